//! Out-of-band cancellation flags.
//!
//! Cancelling a job never removes it from the queue; instead a `cancel:{id}`
//! flag with a TTL is set and workers consult it at every suspension point.
//! Expiry is enforced at read time: the stored value is the unix deadline.

use fjall::PartitionHandle;
use tracing::debug;

use super::store::{JobQueue, Result};

pub const CANCEL_TTL_SECS: i64 = 3600;

/// Encode a cancel flag key: cancel:{job_id}
fn encode_cancel_key(job_id: &str) -> Vec<u8> {
    format!("cancel:{job_id}").into_bytes()
}

/// Flag channel over the queue's `flags` partition
#[derive(Clone)]
pub struct CancelFlags {
    partition: PartitionHandle,
}

impl CancelFlags {
    pub fn new(queue: &JobQueue) -> Self {
        Self {
            partition: queue.flags.clone(),
        }
    }

    /// Arm the cancel flag for a job with the standard TTL
    pub fn set(&self, job_id: &str) -> Result<()> {
        self.set_with_deadline(job_id, chrono::Utc::now().timestamp() + CANCEL_TTL_SECS)
    }

    pub(crate) fn set_with_deadline(&self, job_id: &str, deadline: i64) -> Result<()> {
        self.partition
            .insert(encode_cancel_key(job_id), deadline.to_be_bytes())?;
        debug!(job_id, deadline, "Cancel flag set");
        Ok(())
    }

    /// Whether the flag is currently armed; expired flags are removed lazily
    pub fn is_set(&self, job_id: &str) -> Result<bool> {
        let key = encode_cancel_key(job_id);
        let Some(bytes) = self.partition.get(&key)? else {
            return Ok(false);
        };
        let deadline = i64::from_be_bytes(bytes.as_ref().try_into().unwrap_or([0u8; 8]));
        if chrono::Utc::now().timestamp() > deadline {
            self.partition.remove(key)?;
            return Ok(false);
        }
        Ok(true)
    }

    pub fn clear(&self, job_id: &str) -> Result<()> {
        self.partition.remove(encode_cancel_key(job_id))?;
        Ok(())
    }
}

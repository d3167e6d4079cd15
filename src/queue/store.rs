use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::state::JobKind;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("JSON decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Message not found: seq={0}")]
    MessageNotFound(u64),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Payload persisted per queued job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub kind: JobKind,
    pub session_id: String,
    pub payload: serde_json::Value,
}

/// Delivery state of a queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Queued,
    Started,
    Finished,
    Failed,
}

impl MessageState {
    fn as_byte(self) -> u8 {
        match self {
            MessageState::Queued => b'q',
            MessageState::Started => b's',
            MessageState::Finished => b'f',
            MessageState::Failed => b'x',
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'q' => Some(MessageState::Queued),
            b's' => Some(MessageState::Started),
            b'f' => Some(MessageState::Finished),
            b'x' => Some(MessageState::Failed),
            _ => None,
        }
    }
}

/// Liveness counters derived from the states partition
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueCounters {
    pub queued: u64,
    pub started: u64,
    pub finished: u64,
    pub failed: u64,
}

/// Durable named FIFO over a Fjall keyspace.
///
/// Partition layout:
/// - `tasks`: u64 (big-endian) -> JobMessage (JSON)
/// - `states`: u64 (big-endian) -> delivery state byte
/// - `metadata`: "next_seq" -> u64
/// - `flags`: out-of-band flags (cancellation), managed by [`super::flags`]
///
/// Messages are persisted before distribution, so a crash between persist
/// and delivery is recovered by re-dispatching unfinished sequences:
/// at-least-once semantics; consumers must be idempotent per session id.
pub struct JobQueue {
    name: String,
    keyspace: Keyspace,
    tasks: PartitionHandle,
    states: PartitionHandle,
    metadata: PartitionHandle,
    pub(crate) flags: PartitionHandle,
    seq_counter: Arc<AtomicU64>,
}

impl JobQueue {
    /// Open or create a queue at the specified path
    pub fn open<P: AsRef<Path>>(path: P, name: &str) -> Result<Self> {
        info!(queue = name, path = %path.as_ref().display(), "Opening job queue");

        let keyspace = Config::new(path).open()?;

        let tasks = keyspace.open_partition("tasks", PartitionCreateOptions::default())?;
        let states = keyspace.open_partition("states", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;
        let flags = keyspace.open_partition("flags", PartitionCreateOptions::default())?;

        let current_seq = metadata
            .get(b"next_seq")?
            .map(|bytes| u64::from_be_bytes(bytes.as_ref().try_into().unwrap_or([0u8; 8])))
            .unwrap_or(0);

        info!(queue = name, current_seq, "Job queue opened");

        Ok(Self {
            name: name.to_string(),
            keyspace,
            tasks,
            states,
            metadata,
            flags,
            seq_counter: Arc::new(AtomicU64::new(current_seq)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Persist a message and return its sequence number.
    ///
    /// The counter is persisted after the task so a crash in between is
    /// recovered on reopen (the seq is simply reassigned).
    pub fn push(&self, message: &JobMessage) -> Result<u64> {
        let seq = self.seq_counter.fetch_add(1, Ordering::SeqCst);

        let key = seq.to_be_bytes();
        self.tasks.insert(key, serde_json::to_vec(message)?)?;
        self.states
            .insert(key, [MessageState::Queued.as_byte()])?;
        self.metadata
            .insert(b"next_seq", (seq + 1).to_be_bytes())?;

        debug!(seq, session_id = %message.session_id, "Job message enqueued");

        Ok(seq)
    }

    pub fn get(&self, seq: u64) -> Result<Option<JobMessage>> {
        match self.tasks.get(seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn mark(&self, seq: u64, state: MessageState) -> Result<()> {
        if self.tasks.get(seq.to_be_bytes())?.is_none() {
            return Err(QueueError::MessageNotFound(seq));
        }
        self.states.insert(seq.to_be_bytes(), [state.as_byte()])?;
        Ok(())
    }

    pub fn state(&self, seq: u64) -> Result<Option<MessageState>> {
        Ok(self
            .states
            .get(seq.to_be_bytes())?
            .and_then(|bytes| bytes.first().copied())
            .and_then(MessageState::from_byte))
    }

    /// Sequence-ordered messages that have not reached a terminal delivery
    /// state. Used for startup re-dispatch (at-least-once).
    pub fn unfinished(&self) -> Result<Vec<(u64, JobMessage)>> {
        let mut out = Vec::new();
        for item in self.states.iter() {
            let (key, value) = item?;
            let state = value.first().copied().and_then(MessageState::from_byte);
            if matches!(state, Some(MessageState::Queued) | Some(MessageState::Started)) {
                let seq = u64::from_be_bytes(key.as_ref().try_into().unwrap_or([0u8; 8]));
                if let Some(message) = self.get(seq)? {
                    out.push((seq, message));
                }
            }
        }
        out.sort_by_key(|(seq, _)| *seq);
        Ok(out)
    }

    /// Counters for /api/stats
    pub fn counters(&self) -> Result<QueueCounters> {
        let mut counters = QueueCounters::default();
        for item in self.states.iter() {
            let (_, value) = item?;
            match value.first().copied().and_then(MessageState::from_byte) {
                Some(MessageState::Queued) => counters.queued += 1,
                Some(MessageState::Started) => counters.started += 1,
                Some(MessageState::Finished) => counters.finished += 1,
                Some(MessageState::Failed) => counters.failed += 1,
                None => {}
            }
        }
        Ok(counters)
    }

    /// Flush all writes to disk
    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    /// Health check - verify the keyspace is accessible
    pub fn health_check(&self) -> Result<()> {
        let _ = self.metadata.get(b"next_seq")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_message(session_id: &str) -> JobMessage {
        JobMessage {
            kind: JobKind::Web,
            session_id: session_id.to_string(),
            payload: json!({"url": "https://example.test/", "test_type": "smoke"}),
        }
    }

    #[test]
    fn test_push_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let queue = JobQueue::open(temp_dir.path(), "taas").unwrap();

        let seq = queue.push(&test_message("sess1")).unwrap();
        assert_eq!(seq, 0);

        let message = queue.get(seq).unwrap().unwrap();
        assert_eq!(message.session_id, "sess1");
        assert_eq!(message.kind, JobKind::Web);
        assert_eq!(queue.state(seq).unwrap(), Some(MessageState::Queued));
    }

    #[test]
    fn test_sequential_ids() {
        let temp_dir = TempDir::new().unwrap();
        let queue = JobQueue::open(temp_dir.path(), "taas").unwrap();

        assert_eq!(queue.push(&test_message("a")).unwrap(), 0);
        assert_eq!(queue.push(&test_message("b")).unwrap(), 1);
        assert_eq!(queue.push(&test_message("c")).unwrap(), 2);
    }

    #[test]
    fn test_mark_and_counters() {
        let temp_dir = TempDir::new().unwrap();
        let queue = JobQueue::open(temp_dir.path(), "taas").unwrap();

        let s0 = queue.push(&test_message("a")).unwrap();
        let s1 = queue.push(&test_message("b")).unwrap();
        let s2 = queue.push(&test_message("c")).unwrap();
        let _s3 = queue.push(&test_message("d")).unwrap();

        queue.mark(s0, MessageState::Finished).unwrap();
        queue.mark(s1, MessageState::Failed).unwrap();
        queue.mark(s2, MessageState::Started).unwrap();

        let counters = queue.counters().unwrap();
        assert_eq!(counters.queued, 1);
        assert_eq!(counters.started, 1);
        assert_eq!(counters.finished, 1);
        assert_eq!(counters.failed, 1);
    }

    #[test]
    fn test_mark_unknown_seq() {
        let temp_dir = TempDir::new().unwrap();
        let queue = JobQueue::open(temp_dir.path(), "taas").unwrap();

        let err = queue.mark(42, MessageState::Finished).unwrap_err();
        assert!(matches!(err, QueueError::MessageNotFound(42)));
    }

    #[test]
    fn test_unfinished_for_recovery() {
        let temp_dir = TempDir::new().unwrap();
        let queue = JobQueue::open(temp_dir.path(), "taas").unwrap();

        let s0 = queue.push(&test_message("done")).unwrap();
        let s1 = queue.push(&test_message("mid-flight")).unwrap();
        let _s2 = queue.push(&test_message("waiting")).unwrap();

        queue.mark(s0, MessageState::Finished).unwrap();
        queue.mark(s1, MessageState::Started).unwrap();

        let pending = queue.unfinished().unwrap();
        let ids: Vec<&str> = pending
            .iter()
            .map(|(_, m)| m.session_id.as_str())
            .collect();
        assert_eq!(ids, vec!["mid-flight", "waiting"]);
    }

    #[test]
    fn test_persistence_across_reopens() {
        let temp_dir = TempDir::new().unwrap();

        let seq = {
            let queue = JobQueue::open(temp_dir.path(), "taas").unwrap();
            queue.push(&test_message("sess1")).unwrap()
        };

        let queue = JobQueue::open(temp_dir.path(), "taas").unwrap();
        let seq2 = queue.push(&test_message("sess2")).unwrap();
        assert_eq!(seq2, seq + 1);

        let old = queue.get(seq).unwrap().unwrap();
        assert_eq!(old.session_id, "sess1");
        assert_eq!(queue.unfinished().unwrap().len(), 2);
    }
}

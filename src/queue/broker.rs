use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::store::{JobMessage, JobQueue, MessageState, QueueError};

/// JobEnvelope wraps a JobMessage with its durable sequence number
#[derive(Clone, Debug)]
pub struct JobEnvelope {
    pub seq: u64,
    pub message: JobMessage,
}

/// TaskBroker distributes jobs from the API to the worker pool.
///
/// Flow:
/// 1. API calls `broker.enqueue(message)`
/// 2. Broker persists the message to the durable queue (gets a seq)
/// 3. Broker sends JobEnvelope{seq, message} to a worker via mpsc channel
/// 4. Round-robin distribution across the pool
/// 5. Backpressure via bounded channels
///
/// A worker channel going away does not lose work: the message is already
/// durable and is re-dispatched by `recover()` on the next start.
pub struct TaskBroker {
    queue: Arc<JobQueue>,
    worker_channels: Vec<mpsc::Sender<JobEnvelope>>,
    next_worker: AtomicUsize,
}

impl TaskBroker {
    /// Create a broker with one channel per worker.
    ///
    /// Returns the broker and the receivers to hand to spawned workers.
    pub fn new(
        queue: Arc<JobQueue>,
        num_workers: usize,
        channel_size: usize,
    ) -> (Self, Vec<mpsc::Receiver<JobEnvelope>>) {
        info!(num_workers, channel_size, "Creating task broker");

        let mut worker_channels = Vec::with_capacity(num_workers);
        let mut worker_receivers = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            let (tx, rx) = mpsc::channel(channel_size);
            worker_channels.push(tx);
            worker_receivers.push(rx);
            debug!(worker_id, "Created worker channel");
        }

        let broker = Self {
            queue,
            worker_channels,
            next_worker: AtomicUsize::new(0),
        };

        (broker, worker_receivers)
    }

    /// Persist a message and hand it to the next worker
    pub async fn enqueue(&self, message: JobMessage) -> Result<u64, QueueError> {
        let seq = self.queue.push(&message)?;
        debug!(seq, session_id = %message.session_id, "Job persisted to queue");

        self.dispatch(JobEnvelope { seq, message }).await;
        Ok(seq)
    }

    /// Re-dispatch every message that never reached a terminal delivery
    /// state. Called once on startup; redelivery is expected and workers
    /// skip sessions that are already terminal.
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let pending = self.queue.unfinished()?;
        let count = pending.len();
        if count > 0 {
            info!(count, "Re-dispatching unfinished jobs from durable queue");
        }
        for (seq, message) in pending {
            self.queue.mark(seq, MessageState::Queued)?;
            self.dispatch(JobEnvelope { seq, message }).await;
        }
        Ok(count)
    }

    async fn dispatch(&self, envelope: JobEnvelope) {
        let worker_idx =
            self.next_worker.fetch_add(1, Ordering::Relaxed) % self.worker_channels.len();
        let seq = envelope.seq;

        match self.worker_channels[worker_idx].send(envelope).await {
            Ok(_) => debug!(seq, worker_idx, "Job sent to worker"),
            Err(_) => {
                // Worker is gone; message stays durable for the next recover()
                warn!(seq, worker_idx, "Worker channel closed, job not delivered");
            }
        }
    }

    pub fn num_workers(&self) -> usize {
        self.worker_channels.len()
    }

    /// Check if all worker channels are healthy (not closed)
    pub fn health_check(&self) -> bool {
        self.worker_channels.iter().all(|ch| !ch.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_message(session_id: &str) -> JobMessage {
        JobMessage {
            kind: crate::state::JobKind::Web,
            session_id: session_id.to_string(),
            payload: json!({"test_type": "smoke"}),
        }
    }

    #[tokio::test]
    async fn test_broker_enqueue() {
        let temp_dir = TempDir::new().unwrap();
        let queue = Arc::new(JobQueue::open(temp_dir.path(), "taas").unwrap());

        let (broker, mut receivers) = TaskBroker::new(queue.clone(), 2, 10);

        let seq = broker.enqueue(test_message("sess1")).await.unwrap();
        assert_eq!(seq, 0);

        let envelope = receivers[0].recv().await.unwrap();
        assert_eq!(envelope.seq, 0);
        assert_eq!(envelope.message.session_id, "sess1");

        let seq2 = broker.enqueue(test_message("sess2")).await.unwrap();
        assert_eq!(seq2, 1);

        let envelope2 = receivers[1].recv().await.unwrap();
        assert_eq!(envelope2.seq, 1);
    }

    #[tokio::test]
    async fn test_round_robin_distribution() {
        let temp_dir = TempDir::new().unwrap();
        let queue = Arc::new(JobQueue::open(temp_dir.path(), "taas").unwrap());

        let (broker, mut receivers) = TaskBroker::new(queue.clone(), 3, 10);

        for i in 0..6 {
            broker.enqueue(test_message(&format!("s{i}"))).await.unwrap();
        }

        for worker_id in 0..3 {
            let e1 = receivers[worker_id].recv().await.unwrap();
            let e2 = receivers[worker_id].recv().await.unwrap();
            assert_eq!(e1.seq, worker_id as u64);
            assert_eq!(e2.seq, (worker_id + 3) as u64);
        }
    }

    #[tokio::test]
    async fn test_persistence_before_distribution() {
        let temp_dir = TempDir::new().unwrap();
        let queue = Arc::new(JobQueue::open(temp_dir.path(), "taas").unwrap());

        let (broker, receivers) = TaskBroker::new(queue.clone(), 1, 10);
        drop(receivers); // worker crash before delivery

        let seq = broker.enqueue(test_message("sess1")).await.unwrap();

        let stored = queue.get(seq).unwrap().unwrap();
        assert_eq!(stored.session_id, "sess1");
    }

    #[tokio::test]
    async fn test_recover_redelivers_unfinished() {
        let temp_dir = TempDir::new().unwrap();
        let queue = Arc::new(JobQueue::open(temp_dir.path(), "taas").unwrap());

        // Persisted but never delivered (no broker around)
        queue.push(&test_message("lost")).unwrap();

        let (broker, mut receivers) = TaskBroker::new(queue.clone(), 1, 10);
        let recovered = broker.recover().await.unwrap();
        assert_eq!(recovered, 1);

        let envelope = receivers[0].recv().await.unwrap();
        assert_eq!(envelope.message.session_id, "lost");
    }
}

//! Durable job queue with at-least-once delivery and cooperative
//! cancellation flags

mod broker;
mod flags;
mod store;

pub use broker::{JobEnvelope, TaskBroker};
pub use flags::{CancelFlags, CANCEL_TTL_SECS};
pub use store::{JobMessage, JobQueue, MessageState, QueueCounters, QueueError};

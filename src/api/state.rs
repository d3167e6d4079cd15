use std::sync::Arc;

use crate::config::Config;
use crate::limiter::RateLimiter;
use crate::queue::{CancelFlags, JobQueue, TaskBroker};
use crate::state::StateStore;
use crate::status::StatusFile;
use crate::storage::ObjectStore;
use crate::visual::VisualEngine;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: Arc<JobQueue>,
    pub broker: Arc<TaskBroker>,
    pub flags: CancelFlags,
    pub status: StatusFile,
    pub state: Arc<StateStore>,
    pub store: Option<Arc<dyn ObjectStore>>,
    pub visual: VisualEngine,
    pub limiter: Arc<RateLimiter>,
}

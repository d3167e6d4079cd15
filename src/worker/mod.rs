//! Worker pool: dequeues jobs and drives kind-specific executors.
//!
//! Every dependency an executor touches travels in [`WorkerEnv`]; nothing is
//! reached through globals. Jobs are fed from the broker's bounded channels,
//! so the pool size is the backpressure limit.

pub mod browser;
pub mod crawl;
pub mod mobile;
pub mod perf;
pub mod runner;
pub mod web;
pub mod zap;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::notify::Notifier;
use crate::queue::{CancelFlags, JobEnvelope, JobQueue};
use crate::state::{SessionStatus, StateStore};
use crate::status::{ArtifactRef, StatusFile};
use crate::storage::ObjectStore;
use crate::visual::VisualEngine;

use browser::BrowserDriver;
use perf::PerfClient;
use zap::ZapClient;

/// Executor-level abort. Anything that is not a cancel is folded into the
/// result summary instead of erroring; workers never raise to the queue.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("job canceled")]
    Canceled,
}

/// Shared handles for every job an executor runs
pub struct WorkerEnv {
    pub config: Arc<Config>,
    pub queue: Arc<JobQueue>,
    pub flags: CancelFlags,
    pub status: StatusFile,
    pub state: Arc<StateStore>,
    pub store: Option<Arc<dyn ObjectStore>>,
    pub driver: Arc<dyn BrowserDriver>,
    pub visual: VisualEngine,
    pub notifier: Notifier,
    pub perf: Option<Arc<PerfClient>>,
    pub zap: Option<Arc<ZapClient>>,
}

/// Cooperative cancellation probe, checked at every suspension point.
///
/// Consults both the TTL'd queue flag and the status document, so a cancel
/// outlives flag expiry on long jobs.
#[derive(Clone)]
pub struct CancelToken {
    flags: CancelFlags,
    status: StatusFile,
    job_id: String,
}

impl CancelToken {
    pub fn new(env: &WorkerEnv, job_id: &str) -> Self {
        Self {
            flags: env.flags.clone(),
            status: env.status.clone(),
            job_id: job_id.to_string(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        if self.flags.is_set(&self.job_id).unwrap_or(false) {
            return true;
        }
        matches!(
            self.status.read(&self.job_id).ok().flatten().map(|d| d.status),
            Some(SessionStatus::CancelRequested) | Some(SessionStatus::Canceled)
        )
    }
}

/// Uploads run artifacts under `{job_id}/{basename}` and accumulates the
/// reference map for the result summary. Partial maps survive cancellation:
/// the caller gets everything uploaded before the cancel was observed.
pub struct ArtifactUploader<'a> {
    env: &'a WorkerEnv,
    job_id: String,
    artifacts: &'a mut BTreeMap<String, ArtifactRef>,
}

impl<'a> ArtifactUploader<'a> {
    pub fn new(
        env: &'a WorkerEnv,
        job_id: &str,
        artifacts: &'a mut BTreeMap<String, ArtifactRef>,
    ) -> Self {
        Self {
            env,
            job_id: job_id.to_string(),
            artifacts,
        }
    }

    /// Upload a local file. Storage being unconfigured or the file missing
    /// skips quietly; only a cancel aborts.
    pub async fn upload_file(
        &mut self,
        name: &str,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<(), ExecError> {
        if cancel.is_canceled() {
            return Err(ExecError::Canceled);
        }
        let Some(store) = &self.env.store else {
            return Ok(());
        };
        if !path.is_file() {
            return Ok(());
        }
        let Some(basename) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            return Ok(());
        };
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(job_id = %self.job_id, path = %path.display(), error = %err, "Artifact read failed");
                return Ok(());
            }
        };

        let key = format!("{}/{}", self.job_id, basename);
        if let Err(err) = store.put(&key, bytes).await {
            warn!(job_id = %self.job_id, key = %key, error = %err, "Artifact upload failed");
            return Ok(());
        }

        let ttl = std::time::Duration::from_secs(self.env.config.storage.artifact_ttl_secs);
        let presigned_url = match store.presign(&key, ttl).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(job_id = %self.job_id, key = %key, error = %err, "Artifact presign failed");
                None
            }
        };

        self.artifacts.insert(
            name.to_string(),
            ArtifactRef {
                bucket: store.bucket().to_string(),
                key,
                presigned_url,
            },
        );
        Ok(())
    }
}

/// Spawn one task per broker receiver
pub fn spawn_workers(
    env: Arc<WorkerEnv>,
    receivers: Vec<mpsc::Receiver<JobEnvelope>>,
) -> Vec<JoinHandle<()>> {
    receivers
        .into_iter()
        .enumerate()
        .map(|(worker_id, mut rx)| {
            let env = env.clone();
            tokio::spawn(async move {
                info!(worker_id, "Worker started");
                while let Some(envelope) = rx.recv().await {
                    runner::process(&env, envelope).await;
                }
                info!(worker_id, "Worker channel closed, stopping");
            })
        })
        .collect()
}

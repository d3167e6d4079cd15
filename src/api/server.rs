use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::{get, patch, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use super::state::AppState;
use super::{admin, services, sessions};
use crate::config::Config;
use crate::limiter::RateLimiter;
use crate::notify::Notifier;
use crate::queue::{CancelFlags, JobQueue, TaskBroker};
use crate::state::StateStore;
use crate::status::StatusFile;
use crate::storage::{ObjectStore, S3Store};
use crate::visual::VisualEngine;
use crate::worker::browser::{BrowserDriver, SidecarDriver};
use crate::worker::perf::PerfClient;
use crate::worker::zap::ZapClient;
use crate::worker::{spawn_workers, WorkerEnv};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

const DEFAULT_BROWSER_SIDECAR: &str = "http://browser:3000";

/// Wire every component and serve the API with an in-process worker pool
pub async fn run(address: Option<SocketAddr>) -> Result<(), AnyError> {
    info!("Loading configuration");
    let config = Arc::new(Config::load().map_err(|e| format!("Failed to load config: {e}"))?);
    let address = address.unwrap_or(config.server.bind_addr);

    let status = StatusFile::open(&config.server.results_dir)
        .map_err(|e| format!("Failed to open results dir: {e}"))?;

    info!(path = %config.queue.data_path.display(), "Opening job queue");
    let queue = Arc::new(
        JobQueue::open(&config.queue.data_path, &config.queue.name)
            .map_err(|e| format!("Failed to open queue: {e}"))?,
    );
    let flags = CancelFlags::new(&queue);

    let (broker, worker_receivers) =
        TaskBroker::new(queue.clone(), config.queue.workers, config.queue.channel_size);
    let broker = Arc::new(broker);

    let state_store = Arc::new(
        StateStore::new(&config.database).map_err(|e| format!("Failed to build DB pool: {e}"))?,
    );
    if let Err(err) = state_store.ensure_schema().await {
        warn!(error = %err, "Schema bootstrap failed; continuing on status files");
    }

    let store: Option<Arc<dyn ObjectStore>> = S3Store::from_config(&config.storage)
        .map(|s3| Arc::new(s3) as Arc<dyn ObjectStore>);
    match &store {
        Some(store) => {
            if let Err(err) = store.ensure_bucket().await {
                warn!(error = %err, "Bucket bootstrap failed");
            }
        }
        None => info!("Object storage not configured; artifacts stay local"),
    }

    let visual = VisualEngine::new(
        store.clone(),
        config.visual.threshold_pct,
        config.visual.auto_baseline,
    );

    let driver: Arc<dyn BrowserDriver> = Arc::new(SidecarDriver::new(
        config
            .browser
            .url
            .as_deref()
            .unwrap_or(DEFAULT_BROWSER_SIDECAR),
    ));

    let env = Arc::new(WorkerEnv {
        config: config.clone(),
        queue: queue.clone(),
        flags: flags.clone(),
        status: status.clone(),
        state: state_store.clone(),
        store: store.clone(),
        driver,
        visual: visual.clone(),
        notifier: Notifier::new(config.notify.webhook_url.clone()),
        perf: PerfClient::from_config(&config.perf).map(Arc::new),
        zap: ZapClient::from_config(&config.zap).map(Arc::new),
    });

    let workers = spawn_workers(env, worker_receivers);
    info!(workers = workers.len(), "Worker pool started");

    match broker.recover().await {
        Ok(0) => {}
        Ok(count) => info!(count, "Recovered unfinished jobs"),
        Err(err) => warn!(error = %err, "Queue recovery failed"),
    }

    let app_state = AppState {
        config: config.clone(),
        queue,
        broker,
        flags,
        status,
        state: state_store,
        store,
        visual,
        limiter: Arc::new(RateLimiter::new()),
    };

    let app = router(app_state);

    let listener = TcpListener::bind(address).await?;
    info!(%address, "ProofBox API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Route table. Exposed separately so the integration suites can drive the
/// exact production router against test-wired state.
pub fn router(state: AppState) -> Router {
    // Generous slack over the configured cap: the streaming handler owns the
    // size verdict (413 + partial-file cleanup), not the body-limit layer
    let upload_limit = (state.config.upload.max_bytes() as usize).saturating_add(8 * 1024 * 1024);
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/", get(services::root))
        .route("/healthz", get(services::healthz))
        .route("/api/stats", get(services::stats))
        .route("/api/test/web", post(services::submit_web))
        .route("/api/test/mobile", post(services::submit_mobile))
        .route(
            "/api/upload/mobile",
            post(services::upload_mobile).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/jobs/{job_id}", get(services::get_job))
        .route("/api/jobs/{job_id}/cancel", post(services::cancel_job))
        .route("/api/jobs/{job_id}/retry", post(services::retry_job))
        .route("/api/job-results/{job_id}", get(services::get_job_result))
        .route("/api/artifacts/{job_id}/{name}", get(services::get_artifact))
        .route("/api/visual/accept", post(services::visual_accept))
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions/{session_id}", get(sessions::get_session))
        .route(
            "/api/sessions/{session_id}/results",
            get(sessions::list_session_results),
        )
        .route(
            "/api/sessions/{session_id}/alerts.json",
            get(sessions::session_alerts_json),
        )
        .route(
            "/api/sessions/{session_id}/alerts.csv",
            get(sessions::session_alerts_csv),
        )
        .route("/api/results/{result_id}", get(sessions::get_result))
        .route(
            "/api/results/{result_id}/alerts.json",
            get(sessions::result_alerts_json),
        )
        .route(
            "/api/results/{result_id}/alerts.csv",
            get(sessions::result_alerts_csv),
        )
        .route("/api/projects", get(sessions::list_projects))
        .route("/api/admin/keys", get(admin::list_keys).post(admin::create_key))
        .route("/api/admin/keys/{key_id}", patch(admin::update_key))
        .with_state(state)
        .layer(cors)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins = &config.server.cors_origins;
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

use axum::routing::{delete, get, patch, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use scene_render_queue::app_state::AppState;
use scene_render_queue::config::AppConfig;
use scene_render_queue::routes::{self, health, jobs, queues};
use scene_render_queue::services::registry::QueueRegistry;
use scene_render_queue::services::renderer::CommandRenderer;
use scene_render_queue::services::scheduler::Scheduler;
use scene_render_queue::store::SnapshotStore;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!(
        project_root = %config.project_root.display(),
        result_dir = %config.result_root().display(),
        "Initializing scene render queue"
    );

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe();

    // Restore named queues; anything that was in flight comes back idle
    let store = SnapshotStore::new(config.snapshot_path());
    let queues = store
        .load()
        .await
        .expect("Failed to load queue snapshot");
    tracing::info!(
        path = %store.path().display(),
        queues = queues.len(),
        "Loaded queue snapshot"
    );
    let registry = QueueRegistry::from_snapshot(queues);

    // Start the render worker
    let scheduler = Scheduler::start(
        config.clone(),
        registry,
        store,
        Arc::new(CommandRenderer),
    );
    let state = AppState::new(scheduler);

    // Build API routes
    let app = Router::new()
        .route("/health", get(health::health_check))
        .route("/status", get(jobs::render_status))
        .route("/jobs", get(jobs::list_jobs).post(jobs::submit_job))
        .route("/jobs/clear", post(jobs::clear_jobs))
        .route("/jobs/{id}", delete(jobs::cancel_job))
        .route("/queues", get(queues::list_queues).post(queues::create_queue))
        .route("/queues/import", post(queues::import_queue))
        .route("/queues/{id}", get(queues::get_queue).delete(queues::delete_queue))
        .route("/queues/{id}/project", delete(queues::unlink_project))
        .route("/queues/{id}/jobs", post(queues::add_job))
        .route(
            "/queues/{id}/jobs/{job_id}",
            patch(queues::patch_job).delete(queues::delete_job),
        )
        .route("/queues/{id}/jobs/{job_id}/run", post(queues::run_job))
        .route("/queues/{id}/jobs/{job_id}/cancel", post(queues::cancel_job))
        .route("/queues/{id}/run", post(queues::run_queue))
        .route("/queues/{id}/reset", post(queues::reset_queue))
        .route("/queues/{id}/restart", post(queues::restart_queue))
        .route("/queues/{id}/finalize", post(queues::finalize_queue))
        .route("/queues/{id}/mix-audio", post(queues::mix_audio))
        .route("/queues/{id}/audio-bg", post(queues::set_background_audio))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024)); // 2 MB limit

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

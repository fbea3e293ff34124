use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// Describe the render metrics once at startup so scrapes carry help text.
pub fn describe() {
    metrics::describe_counter!("render_jobs_started", "Renders handed to the renderer");
    metrics::describe_counter!("render_jobs_completed", "Renders that produced a video");
    metrics::describe_counter!("render_jobs_failed", "Renders that exited with an error");
    metrics::describe_histogram!(
        "render_duration_seconds",
        metrics::Unit::Seconds,
        "Wall time of a successful render, excluding audio mixing"
    );
    metrics::describe_gauge!("ready_list_depth", "Jobs waiting for the render worker");
}

/// GET /metrics — Prometheus text exposition.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

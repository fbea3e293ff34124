use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub snapshot: ComponentHealth,
    pub worker: ComponentHealth,
    pub media_tools: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn ok(latency_ms: Option<u64>) -> Self {
        Self {
            status: "ok".to_string(),
            latency_ms,
        }
    }

    fn error() -> Self {
        Self {
            status: "error".to_string(),
            latency_ms: None,
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health — snapshot directory, render worker and media tool status.
///
/// Missing media tools degrade the report but do not fail it: rendering still
/// works without them, only mixing and finalizing do not.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let scheduler = &state.scheduler;

    let start = std::time::Instant::now();
    let snapshot = match scheduler.store().health_check().await {
        Ok(()) => ComponentHealth::ok(Some(start.elapsed().as_millis() as u64)),
        Err(e) => {
            tracing::warn!(error = %e, "Snapshot directory check failed");
            ComponentHealth::error()
        }
    };

    let worker = if scheduler.worker_alive() {
        ComponentHealth::ok(None)
    } else {
        ComponentHealth::error()
    };

    let media_start = std::time::Instant::now();
    let media_tools = if scheduler.media_health().await {
        ComponentHealth::ok(Some(media_start.elapsed().as_millis() as u64))
    } else {
        ComponentHealth::error()
    };

    let healthy = snapshot.is_ok() && worker.is_ok();
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let status = match (healthy, media_tools.is_ok()) {
        (true, true) => "ok",
        (true, false) => "degraded",
        (false, _) => "error",
    };

    (
        status_code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: HealthChecks {
                snapshot,
                worker,
                media_tools,
            },
        }),
    )
}

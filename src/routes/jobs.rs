use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::models::job::Job;
use crate::models::requests::{CreatedResponse, NewJob};
use crate::routes::ApiError;
use crate::services::scheduler::SchedulerStatus;

/// POST /jobs — submit a queue-less render; it is scheduled immediately.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(new_job): Json<NewJob>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    new_job.validate()?;
    let job = state.scheduler.submit_standalone(new_job);
    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            id: job.id,
            status: job.status.to_string(),
        }),
    ))
}

/// GET /jobs — standalone submissions of this process.
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<Job>> {
    Json(state.scheduler.standalone_jobs())
}

/// DELETE /jobs/{id} — drop a standalone job that is not rendering.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let job = state.scheduler.cancel_standalone(job_id)?;
    Ok(Json(json!({ "ok": true, "status": job.status.to_string() })))
}

/// POST /jobs/clear — forget finished standalone jobs.
pub async fn clear_jobs(State(state): State<AppState>) -> Json<Value> {
    let removed = state.scheduler.clear_finished_standalone();
    Json(json!({ "ok": true, "removed": removed }))
}

/// GET /status — the render in flight and the ready-list depth.
pub async fn render_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status())
}

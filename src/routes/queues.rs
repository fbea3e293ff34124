use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::models::job::Job;
use crate::models::queue::NamedQueue;
use crate::models::requests::{
    BackgroundAudioRequest, CreateQueueRequest, CreatedResponse, ImportQueueRequest, JobPatch,
    NewJob, PatchResponse, QueueSummary,
};
use crate::routes::ApiError;
use crate::services::finalizer::FinalizeOutput;
use crate::services::mixer::MixReport;
use crate::services::registry::DeleteOutcome;

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub force: bool,
}

/// GET /queues
pub async fn list_queues(State(state): State<AppState>) -> Json<Vec<QueueSummary>> {
    Json(state.scheduler.summaries())
}

/// POST /queues — create a queue with its initial scenes (all `idle`).
pub async fn create_queue(
    State(state): State<AppState>,
    Json(request): Json<CreateQueueRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    request.validate()?;
    let queue = state
        .scheduler
        .create_queue(request.name, request.project, request.jobs)
        .await;
    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            id: queue.id,
            status: queue.status.to_string(),
        }),
    ))
}

/// POST /queues/import — create a queue from a Markdown or JSON scene list.
pub async fn import_queue(
    State(state): State<AppState>,
    Json(request): Json<ImportQueueRequest>,
) -> Result<(StatusCode, Json<NamedQueue>), ApiError> {
    request.validate()?;
    let queue = state
        .scheduler
        .import_queue(request.name, request.project, &request.content)
        .await?;
    Ok((StatusCode::CREATED, Json(queue)))
}

/// GET /queues/{id}
pub async fn get_queue(
    State(state): State<AppState>,
    Path(queue_id): Path<u64>,
) -> Result<Json<NamedQueue>, ApiError> {
    Ok(Json(state.scheduler.queue(queue_id)?))
}

/// DELETE /queues/{id}?force=true
pub async fn delete_queue(
    State(state): State<AppState>,
    Path(queue_id): Path<u64>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.scheduler.delete_queue(queue_id, params.force).await?;
    Ok(Json(json!({
        "ok": true,
        "cleared": outcome == DeleteOutcome::Cleared,
    })))
}

/// DELETE /queues/{id}/project
pub async fn unlink_project(
    State(state): State<AppState>,
    Path(queue_id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    state.scheduler.unlink_project(queue_id).await?;
    Ok(Json(json!({ "ok": true })))
}

/// POST /queues/{id}/jobs
pub async fn add_job(
    State(state): State<AppState>,
    Path(queue_id): Path<u64>,
    Json(new_job): Json<NewJob>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    new_job.validate()?;
    let job = state.scheduler.add_job(queue_id, new_job).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// PATCH /queues/{id}/jobs/{job_id}
pub async fn patch_job(
    State(state): State<AppState>,
    Path((queue_id, job_id)): Path<(u64, u64)>,
    Json(patch): Json<JobPatch>,
) -> Result<Json<PatchResponse>, ApiError> {
    patch.validate()?;
    let reset = state.scheduler.patch_job(queue_id, job_id, patch).await?;
    Ok(Json(PatchResponse { ok: true, reset }))
}

/// DELETE /queues/{id}/jobs/{job_id}
pub async fn delete_job(
    State(state): State<AppState>,
    Path((queue_id, job_id)): Path<(u64, u64)>,
) -> Result<Json<Value>, ApiError> {
    state.scheduler.delete_job(queue_id, job_id).await?;
    Ok(Json(json!({ "ok": true })))
}

/// POST /queues/{id}/run — schedule every idle scene in index order.
pub async fn run_queue(
    State(state): State<AppState>,
    Path(queue_id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let scheduled = state.scheduler.run_all(queue_id).await?;
    Ok(Json(json!({ "ok": true, "scheduled": scheduled })))
}

/// POST /queues/{id}/jobs/{job_id}/run
pub async fn run_job(
    State(state): State<AppState>,
    Path((queue_id, job_id)): Path<(u64, u64)>,
) -> Result<Json<Value>, ApiError> {
    state.scheduler.run_one(queue_id, job_id).await?;
    Ok(Json(json!({ "ok": true, "scheduled": 1 })))
}

/// POST /queues/{id}/jobs/{job_id}/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path((queue_id, job_id)): Path<(u64, u64)>,
) -> Result<Json<Value>, ApiError> {
    state.scheduler.cancel(queue_id, job_id).await?;
    Ok(Json(json!({ "ok": true })))
}

/// POST /queues/{id}/reset — re-run failed and unrun scenes, keep finished ones.
pub async fn reset_queue(
    State(state): State<AppState>,
    Path(queue_id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let scheduled = state.scheduler.reset(queue_id).await?;
    Ok(Json(json!({ "ok": true, "scheduled": scheduled })))
}

/// POST /queues/{id}/restart — clear every scene and run from the start.
pub async fn restart_queue(
    State(state): State<AppState>,
    Path(queue_id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let scheduled = state.scheduler.restart(queue_id).await?;
    Ok(Json(json!({ "ok": true, "scheduled": scheduled })))
}

/// POST /queues/{id}/finalize
pub async fn finalize_queue(
    State(state): State<AppState>,
    Path(queue_id): Path<u64>,
) -> Result<Json<FinalizeOutput>, ApiError> {
    Ok(Json(state.scheduler.finalize(queue_id).await?))
}

/// POST /queues/{id}/mix-audio
pub async fn mix_audio(
    State(state): State<AppState>,
    Path(queue_id): Path<u64>,
) -> Result<Json<MixReport>, ApiError> {
    Ok(Json(state.scheduler.remix(queue_id).await?))
}

/// POST /queues/{id}/audio-bg
pub async fn set_background_audio(
    State(state): State<AppState>,
    Path(queue_id): Path<u64>,
    Json(request): Json<BackgroundAudioRequest>,
) -> Result<Json<Value>, ApiError> {
    let updated = state
        .scheduler
        .set_background_audio(queue_id, &request.audio_bg)
        .await?;
    Ok(Json(json!({ "ok": true, "updated": updated })))
}

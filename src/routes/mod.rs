pub mod health;
pub mod jobs;
pub mod metrics;
pub mod queues;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::services::finalizer::FinalizeError;
use crate::services::registry::RegistryError;
use crate::services::scheduler::SchedulerError;

/// Error returned by every handler, rendered as `{ "error": "..." }`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::QueueNotFound(_) | RegistryError::JobNotFound { .. } => {
                ApiError::NotFound(e.to_string())
            }
            RegistryError::Conflict(_) => ApiError::Conflict(e.to_string()),
            RegistryError::NothingToRun(_) | RegistryError::InvalidEdit(_) => {
                ApiError::BadRequest(e.to_string())
            }
        }
    }
}

impl From<FinalizeError> for ApiError {
    fn from(e: FinalizeError) -> Self {
        match e {
            FinalizeError::NothingToFinalize | FinalizeError::MissingArtifacts(_) => {
                ApiError::BadRequest(e.to_string())
            }
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Registry(e) => e.into(),
            SchedulerError::Finalize(e) => e.into(),
            SchedulerError::Import(e) => ApiError::BadRequest(e.to_string()),
            SchedulerError::StandaloneNotFound(_) => ApiError::NotFound(e.to_string()),
            SchedulerError::StandaloneRunning(_) => ApiError::Conflict(e.to_string()),
        }
    }
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        ApiError::BadRequest(report.to_string())
    }
}

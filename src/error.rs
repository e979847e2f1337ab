//! Error types for the control plane and API responses

use crate::types::{InstanceId, RouteName, WorkerId};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type FleetResult<T> = Result<T, FleetError>;

/// Control plane errors
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("no workers available")]
    NoWorkers,

    #[error("id {0} already assigned to another worker")]
    WorkerExists(WorkerId),

    #[error("no such worker: {0}")]
    WorkerNotFound(WorkerId),

    #[error("no such instance: {0}")]
    NoSuchInstance(InstanceId),

    /// The instance was removed from the pool while its build was in flight
    #[error("build cancelled for instance {0}")]
    BuildCancelled(InstanceId),

    /// The deployment was superseded, slept or deleted. Not a failure.
    #[error("deployment cancelled")]
    DeploymentCancelled,

    #[error("model {0} is already awake")]
    AlreadyAwake(RouteName),

    #[error("invalid worker url '{url}': {reason}")]
    InvalidWorkerUrl { url: String, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("bad response from worker: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FleetError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FleetError::DeploymentCancelled)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            FleetError::WorkerNotFound(_) | FleetError::NoSuchInstance(_) => StatusCode::NOT_FOUND,
            FleetError::WorkerExists(_)
            | FleetError::AlreadyAwake(_)
            | FleetError::DeploymentCancelled
            | FleetError::BuildCancelled(_) => StatusCode::CONFLICT,
            FleetError::InvalidWorkerUrl { .. } => StatusCode::BAD_REQUEST,
            FleetError::NoWorkers => StatusCode::SERVICE_UNAVAILABLE,
            FleetError::Worker(_) => StatusCode::BAD_GATEWAY,
            FleetError::Storage(_)
            | FleetError::Io(_)
            | FleetError::Json(_)
            | FleetError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for FleetError {
    fn from(err: reqwest::Error) -> Self {
        FleetError::Worker(err.to_string())
    }
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Internal error");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

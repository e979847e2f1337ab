//! API request and response models

use crate::types::{DeployId, LogLine, WorkerId};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Request to deploy a model version
#[derive(Debug, Serialize, Deserialize)]
pub struct DeployRequest {
    pub user: String,
    pub model: String,
    pub version: u32,
}

/// Whether a lifecycle call should block until the deploy finishes
#[derive(Debug, Default, Deserialize)]
pub struct WaitQuery {
    #[serde(default)]
    pub wait: bool,
}

/// Outcome of a lifecycle call
#[derive(Debug, Serialize, Deserialize)]
pub struct DeployResponse {
    pub user: String,
    pub model: String,
    /// "online" when the call waited, "queued" otherwise
    pub status: String,
}

/// Request to add a worker to the pool
#[derive(Debug, Serialize, Deserialize)]
pub struct AddWorkerRequest {
    pub id: WorkerId,
    /// Address of the worker; `http://` is assumed when no scheme is given
    pub url: String,
}

/// Worker information response
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    /// Instances assigned to the worker
    pub instances: usize,
}

/// Query parameters for log slicing
#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub deployment_id: Option<DeployId>,
    pub start: Option<i32>,
    pub end: Option<i32>,
}

/// Log lines response with Python-style slicing
#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    pub lines: Vec<LogLine>,
    pub start: usize,
    pub end: usize,
    pub total_lines: usize,
}

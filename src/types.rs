//! Identifiers and records shared by the pool, supervisor and collaborators

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a single serving instance. Minted by storage, never reused.
pub type InstanceId = i64;

/// Identifier of a worker node in the pool
pub type WorkerId = i64;

/// Identifier of one rollout of a model version
pub type DeployId = i64;

/// Stable, version-independent key for a servable endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteName {
    pub user: String,
    pub model: String,
}

impl RouteName {
    pub fn new(user: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for RouteName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.model)
    }
}

/// Build status reported to storage as a deployment progresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Queued,
    Building,
    Online,
    Failed,
    Asleep,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Building => "building",
            BuildStatus::Online => "online",
            BuildStatus::Failed => "failed",
            BuildStatus::Asleep => "asleep",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A package to install into a model image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Everything a worker needs to build an instance of a model version
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployInfo {
    pub username: String,
    pub modelname: String,
    pub version: u32,
    /// "python2" or "r"
    pub lang: String,

    pub conda_channels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cran_mirror: Option<String>,
    pub apt_get_sources: Vec<String>,
    pub language_packages: Vec<Package>,
    pub ubuntu_packages: Vec<Package>,

    /// Base image for the model container; workers pick a default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
}

/// Instance state as reported by a worker's status endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceStatus {
    pub id: InstanceId,
    pub ready: bool,
}

/// A line of model output with the metadata needed to file it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogLine {
    pub instance_id: InstanceId,
    pub user: String,
    pub model: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub data: String,
    #[serde(default)]
    pub deployment_id: DeployId,
}

/// A worker node known to the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub url: String,
}

/// Where a route should be, as persisted by storage. Used to reconcile at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub user: String,
    pub model: String,
    pub version: u32,
    pub last_deploy_id: DeployId,
    /// Asleep routes are never redeployed at startup
    #[serde(default)]
    pub asleep: bool,
    #[serde(default)]
    pub instance_ids: Vec<InstanceId>,
}

impl DeploymentRecord {
    pub fn route(&self) -> RouteName {
        RouteName::new(self.user.clone(), self.model.clone())
    }
}

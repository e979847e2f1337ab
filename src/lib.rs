//! Fleet Manager - control plane for model serving
//!
//! Deploys versioned models onto a fleet of worker nodes, keeps a routing
//! table from (user, model) to live instances and proxies prediction traffic
//! to them.

pub mod api;
pub mod config;
pub mod deployment;
pub mod error;
pub mod health;
pub mod logs;
pub mod metrics;
pub mod pool;
pub mod storage;
pub mod supervisor;
pub mod tasks;
pub mod testing;
pub mod types;
pub mod worker;

pub use config::ManagerConfig;
pub use deployment::Deployment;
pub use error::{FleetError, FleetResult};
pub use health::HealthMonitor;
pub use pool::WorkerPool;
pub use storage::{FileModelStorage, ModelStorage};
pub use supervisor::{RouteState, RouteSummary, Supervisor, SupervisorConfig};
pub use types::{BuildStatus, DeployInfo, DeploymentRecord, LogLine, RouteName, WorkerRecord};
pub use worker::{HttpConnector, WorkerClient, WorkerConnector};

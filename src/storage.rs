//! Model metadata storage: the trait the supervisor consumes and a file-backed catalog

use crate::error::{FleetError, FleetResult};
use crate::types::{BuildStatus, DeployId, DeployInfo, DeploymentRecord, InstanceId, RouteName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Metadata store consulted by the supervisor
#[async_trait]
pub trait ModelStorage: Send + Sync {
    /// Deploy info and bundle path for a model version
    async fn get(&self, route: &RouteName, version: u32) -> FleetResult<(DeployInfo, PathBuf)>;

    /// Latest version of a model
    async fn get_latest(&self, route: &RouteName) -> FleetResult<u32>;

    /// Record the build status of a route. A "failed" status is ignored while
    /// the route is asleep.
    async fn set_build_status(&self, route: &RouteName, status: BuildStatus) -> FleetResult<()>;

    /// Register a new deployment and allocate its instance ids.
    /// The store decides how many instances a deployment gets.
    async fn new_deployment(
        &self,
        route: &RouteName,
        version: u32,
    ) -> FleetResult<(DeployId, Vec<InstanceId>)>;
}

/// Trait for storage backend operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Save content to a file path atomically
    async fn save(&self, path: &Path, content: &str) -> FleetResult<()>;

    /// Load content from a file path
    /// Returns None if file doesn't exist
    async fn load(&self, path: &Path) -> FleetResult<Option<String>>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production storage backend using tokio::fs
#[derive(Default)]
pub struct FileSystemStorage;

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save(&self, path: &Path, content: &str) -> FleetResult<()> {
        // Atomic write: write to temp file, then rename
        let temp_file = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_file).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_file, path).await?;

        Ok(())
    }

    async fn load(&self, path: &Path) -> FleetResult<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// One buildable version of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version: u32,
    pub bundle_path: PathBuf,
    #[serde(default)]
    pub info: DeployInfo,
}

/// Instances allocated for a deployment of a route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatedDeployment {
    pub version: u32,
    pub deploy_id: DeployId,
    pub instance_ids: Vec<InstanceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub user: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BuildStatus>,
    /// Deployment currently serving the route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<AllocatedDeployment>,
    /// Deployment being built, promoted to `active` once online
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<AllocatedDeployment>,
    #[serde(default)]
    pub versions: Vec<ModelVersion>,
}

impl ModelEntry {
    fn matches(&self, route: &RouteName) -> bool {
        self.user == route.user && self.model == route.model
    }
}

/// Contents of the catalog file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
    /// Instances per deployment
    pub replication: usize,
    pub next_deploy_id: DeployId,
    pub next_instance_id: InstanceId,
    pub models: Vec<ModelEntry>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            last_updated: None,
            replication: 2,
            next_deploy_id: 1,
            next_instance_id: 1,
            models: Vec::new(),
        }
    }
}

impl Catalog {
    fn entry(&self, route: &RouteName) -> FleetResult<&ModelEntry> {
        self.models
            .iter()
            .find(|m| m.matches(route))
            .ok_or_else(|| FleetError::Storage(format!("model {} not found", route)))
    }

    fn entry_mut(&mut self, route: &RouteName) -> FleetResult<&mut ModelEntry> {
        self.models
            .iter_mut()
            .find(|m| m.matches(route))
            .ok_or_else(|| FleetError::Storage(format!("model {} not found", route)))
    }
}

/// Model catalog kept in a TOML file.
///
/// Every mutation is written back atomically before the call returns.
pub struct FileModelStorage {
    path: PathBuf,
    backend: Arc<dyn StorageBackend>,
    catalog: Mutex<Catalog>,
}

impl FileModelStorage {
    /// Open the catalog at `path`, starting empty if the file does not exist
    pub async fn open(path: PathBuf) -> FleetResult<Self> {
        Self::open_with_backend(path, Arc::new(FileSystemStorage)).await
    }

    /// Open the catalog with a custom storage backend
    pub async fn open_with_backend(
        path: PathBuf,
        backend: Arc<dyn StorageBackend>,
    ) -> FleetResult<Self> {
        let catalog = match backend.load(&path).await? {
            Some(content) => toml::from_str(&content).map_err(|e| {
                FleetError::Storage(format!(
                    "failed to parse catalog {:?}: {}. Fix or delete the file.",
                    path, e
                ))
            })?,
            None => {
                tracing::info!(path = ?path, "No catalog found, starting empty");
                Catalog::default()
            }
        };

        tracing::info!(
            path = ?path,
            models = catalog.models.len(),
            "Catalog loaded"
        );

        Ok(Self {
            path,
            backend,
            catalog: Mutex::new(catalog),
        })
    }

    async fn save(&self, catalog: &mut Catalog) -> FleetResult<()> {
        catalog.last_updated = Some(chrono::Utc::now());
        let content = toml::to_string_pretty(catalog)
            .map_err(|e| FleetError::Storage(format!("failed to serialize catalog: {}", e)))?;
        self.backend.save(&self.path, &content).await?;
        tracing::debug!(path = ?self.path, "Catalog saved");
        Ok(())
    }

    /// Add or replace a buildable version of a model
    pub async fn register_version(
        &self,
        route: &RouteName,
        version: u32,
        info: DeployInfo,
        bundle_path: PathBuf,
    ) -> FleetResult<()> {
        let mut catalog = self.catalog.lock().await;

        if catalog.entry(route).is_err() {
            catalog.models.push(ModelEntry {
                user: route.user.clone(),
                model: route.model.clone(),
                status: None,
                active: None,
                pending: None,
                versions: Vec::new(),
            });
        }
        let entry = catalog.entry_mut(route)?;
        entry.versions.retain(|v| v.version != version);
        entry.versions.push(ModelVersion {
            version,
            bundle_path,
            info,
        });

        self.save(&mut catalog).await
    }

    /// Where every route should be, for startup reconciliation
    pub async fn deployment_records(&self) -> Vec<DeploymentRecord> {
        let catalog = self.catalog.lock().await;
        catalog
            .models
            .iter()
            .filter_map(|entry| {
                let asleep = entry.status == Some(BuildStatus::Asleep);
                let latest = entry.versions.iter().map(|v| v.version).max();
                let (version, last_deploy_id, instance_ids) = match &entry.active {
                    Some(active) => (active.version, active.deploy_id, active.instance_ids.clone()),
                    None if asleep => (latest?, 0, Vec::new()),
                    None => return None,
                };
                Some(DeploymentRecord {
                    user: entry.user.clone(),
                    model: entry.model.clone(),
                    version,
                    last_deploy_id,
                    asleep,
                    instance_ids,
                })
            })
            .collect()
    }

    pub async fn catalog(&self) -> Catalog {
        self.catalog.lock().await.clone()
    }
}

#[async_trait]
impl ModelStorage for FileModelStorage {
    async fn get(&self, route: &RouteName, version: u32) -> FleetResult<(DeployInfo, PathBuf)> {
        let catalog = self.catalog.lock().await;
        let entry = catalog.entry(route)?;
        let found = entry
            .versions
            .iter()
            .find(|v| v.version == version)
            .ok_or_else(|| {
                FleetError::Storage(format!("no version {} found for {}", version, route))
            })?;

        let mut info = found.info.clone();
        info.username = route.user.clone();
        info.modelname = route.model.clone();
        info.version = version;

        Ok((info, found.bundle_path.clone()))
    }

    async fn get_latest(&self, route: &RouteName) -> FleetResult<u32> {
        let catalog = self.catalog.lock().await;
        catalog
            .entry(route)?
            .versions
            .iter()
            .map(|v| v.version)
            .max()
            .ok_or_else(|| FleetError::Storage(format!("model {} has no versions", route)))
    }

    async fn set_build_status(&self, route: &RouteName, status: BuildStatus) -> FleetResult<()> {
        let mut catalog = self.catalog.lock().await;
        let entry = catalog.entry_mut(route)?;

        if status == BuildStatus::Failed && entry.status == Some(BuildStatus::Asleep) {
            return Ok(());
        }

        match status {
            BuildStatus::Online => {
                if let Some(pending) = entry.pending.take() {
                    entry.active = Some(pending);
                }
            }
            BuildStatus::Failed => entry.pending = None,
            BuildStatus::Asleep => {
                entry.active = None;
                entry.pending = None;
            }
            BuildStatus::Queued | BuildStatus::Building => {}
        }
        entry.status = Some(status);

        self.save(&mut catalog).await
    }

    async fn new_deployment(
        &self,
        route: &RouteName,
        version: u32,
    ) -> FleetResult<(DeployId, Vec<InstanceId>)> {
        let mut catalog = self.catalog.lock().await;
        catalog.entry(route)?;

        let replication = catalog.replication.max(1);
        let deploy_id = catalog.next_deploy_id;
        let first = catalog.next_instance_id;
        let instance_ids: Vec<InstanceId> = (first..first + replication as i64).collect();
        catalog.next_deploy_id += 1;
        catalog.next_instance_id += replication as i64;

        catalog.entry_mut(route)?.pending = Some(AllocatedDeployment {
            version,
            deploy_id,
            instance_ids: instance_ids.clone(),
        });

        self.save(&mut catalog).await?;

        tracing::debug!(
            route = %route,
            version,
            deploy_id,
            instances = ?instance_ids,
            "Deployment allocated"
        );

        Ok((deploy_id, instance_ids))
    }
}

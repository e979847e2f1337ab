//! In-memory collaborators for tests and benchmarks
//!
//! `MockWorker` behaves like a worker node without running containers,
//! `MockConnector` hands out registered mock workers by URL and
//! `MemoryStorage` allocates ids and records build statuses.
//! All three are instrumented so tests can observe concurrency and teardown.

use crate::error::{FleetError, FleetResult};
use crate::storage::ModelStorage;
use crate::types::{
    BuildStatus, DeployId, DeployInfo, DeploymentRecord, InstanceId, InstanceStatus, LogLine,
    RouteName,
};
use crate::worker::{WorkerClient, WorkerConnector};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Workers
// ============================================================================

#[derive(Debug, Clone)]
struct MockInstance {
    ready: bool,
    user: String,
    model: String,
    version: u32,
}

/// A worker node that "builds" instances by recording them
pub struct MockWorker {
    instances: Mutex<HashMap<InstanceId, MockInstance>>,
    destroyed: Mutex<Vec<InstanceId>>,
    pending_logs: Mutex<Vec<LogLine>>,
    build_delay: Mutex<Duration>,
    fail_builds: AtomicBool,
    healthy: AtomicBool,
    active_builds: AtomicUsize,
    max_active_builds: AtomicUsize,
    predictions: AtomicUsize,
}

impl Default for MockWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWorker {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            destroyed: Mutex::new(Vec::new()),
            pending_logs: Mutex::new(Vec::new()),
            build_delay: Mutex::new(Duration::ZERO),
            fail_builds: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            active_builds: AtomicUsize::new(0),
            max_active_builds: AtomicUsize::new(0),
            predictions: AtomicUsize::new(0),
        }
    }

    /// Pretend these instances survived from an earlier run
    pub fn seed_instances(&self, statuses: &[InstanceStatus]) {
        let mut instances = lock(&self.instances);
        for status in statuses {
            instances.insert(
                status.id,
                MockInstance {
                    ready: status.ready,
                    user: String::new(),
                    model: String::new(),
                    version: 0,
                },
            );
        }
    }

    pub fn set_build_delay(&self, delay: Duration) {
        *lock(&self.build_delay) = delay;
    }

    pub fn set_fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    /// An unhealthy worker fails pings and every instance heartbeat
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Simulate an instance crashing on the worker
    pub fn crash_instance(&self, instance_id: InstanceId) {
        lock(&self.instances).remove(&instance_id);
    }

    pub fn has_instance(&self, instance_id: InstanceId) -> bool {
        lock(&self.instances).contains_key(&instance_id)
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = lock(&self.instances).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn destroyed(&self) -> Vec<InstanceId> {
        lock(&self.destroyed).clone()
    }

    /// Highest number of builds ever running at once on this worker
    pub fn max_active_builds(&self) -> usize {
        self.max_active_builds.load(Ordering::SeqCst)
    }

    pub fn predictions(&self) -> usize {
        self.predictions.load(Ordering::SeqCst)
    }

    fn check_healthy(&self) -> FleetResult<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FleetError::Worker("worker unreachable".to_string()))
        }
    }
}

struct ActiveBuild<'a>(&'a AtomicUsize);

impl Drop for ActiveBuild<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerClient for MockWorker {
    async fn deploy(
        &self,
        instance_id: InstanceId,
        info: &DeployInfo,
        _bundle: &Path,
    ) -> FleetResult<()> {
        self.check_healthy()?;

        let active = self.active_builds.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveBuild(&self.active_builds);
        self.max_active_builds.fetch_max(active, Ordering::SeqCst);

        let delay = *lock(&self.build_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(FleetError::Worker(format!(
                "build failed for instance {}",
                instance_id
            )));
        }

        lock(&self.instances).insert(
            instance_id,
            MockInstance {
                ready: true,
                user: info.username.clone(),
                model: info.modelname.clone(),
                version: info.version,
            },
        );
        lock(&self.pending_logs).push(LogLine {
            instance_id,
            user: info.username.clone(),
            model: info.modelname.clone(),
            timestamp: chrono::Utc::now(),
            data: format!("instance {} ready", instance_id),
            deployment_id: 0,
        });

        Ok(())
    }

    async fn destroy(&self, instance_id: InstanceId) -> FleetResult<()> {
        self.check_healthy()?;
        lock(&self.destroyed).push(instance_id);
        match lock(&self.instances).remove(&instance_id) {
            Some(_) => Ok(()),
            None => Err(FleetError::NoSuchInstance(instance_id)),
        }
    }

    async fn heartbeat(&self, instance_id: InstanceId) -> FleetResult<()> {
        self.check_healthy()?;
        match lock(&self.instances).get(&instance_id) {
            Some(instance) if instance.ready => Ok(()),
            _ => Err(FleetError::Worker(format!(
                "instance {} is not running",
                instance_id
            ))),
        }
    }

    async fn ping(&self) -> FleetResult<()> {
        self.check_healthy()
    }

    async fn status(&self) -> FleetResult<Vec<InstanceStatus>> {
        self.check_healthy()?;
        Ok(lock(&self.instances)
            .iter()
            .map(|(id, instance)| InstanceStatus {
                id: *id,
                ready: instance.ready,
            })
            .collect())
    }

    async fn predict(
        &self,
        instance_id: InstanceId,
        _request: Request<Body>,
    ) -> FleetResult<Response<Body>> {
        self.check_healthy()?;
        let instance = lock(&self.instances)
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| FleetError::Worker(format!("instance {} not found", instance_id)))?;
        self.predictions.fetch_add(1, Ordering::SeqCst);

        let body = serde_json::json!({
            "instance_id": instance_id,
            "user": instance.user,
            "model": instance.model,
            "version": instance.version,
        });
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .map_err(|e| FleetError::Internal(e.to_string()))
    }

    async fn logs(&self) -> FleetResult<Vec<LogLine>> {
        self.check_healthy()?;
        Ok(std::mem::take(&mut *lock(&self.pending_logs)))
    }
}

/// Hands out registered mock workers by base URL
#[derive(Default)]
pub struct MockConnector {
    workers: Mutex<HashMap<String, Arc<MockWorker>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a fresh mock worker reachable at `base_url`
    pub fn register(&self, base_url: &str) -> Arc<MockWorker> {
        let worker = Arc::new(MockWorker::new());
        lock(&self.workers).insert(base_url.to_string(), worker.clone());
        worker
    }

    pub fn worker(&self, base_url: &str) -> Option<Arc<MockWorker>> {
        lock(&self.workers).get(base_url).cloned()
    }
}

impl WorkerConnector for MockConnector {
    fn connect(&self, base_url: &str) -> FleetResult<Arc<dyn WorkerClient>> {
        let worker = lock(&self.workers).get(base_url).cloned().ok_or_else(|| {
            FleetError::Worker(format!("connection refused: {}", base_url))
        })?;
        Ok(worker)
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Storage that allocates ids in memory.
///
/// Every model exists at every version except models whose name starts with
/// `unknown`, for which `get` fails.
pub struct MemoryStorage {
    replication: AtomicUsize,
    next_instance_id: AtomicI64,
    next_deploy_id: AtomicI64,
    fail_new_deployment: AtomicBool,
    latest: Mutex<HashMap<RouteName, u32>>,
    statuses: Mutex<Vec<(RouteName, BuildStatus)>>,
    records: Mutex<HashMap<RouteName, DeploymentRecord>>,
    building: Mutex<HashSet<RouteName>>,
    max_building: AtomicUsize,
    online_delay: Mutex<Duration>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            replication: AtomicUsize::new(2),
            next_instance_id: AtomicI64::new(1),
            next_deploy_id: AtomicI64::new(1),
            fail_new_deployment: AtomicBool::new(false),
            latest: Mutex::new(HashMap::new()),
            statuses: Mutex::new(Vec::new()),
            records: Mutex::new(HashMap::new()),
            building: Mutex::new(HashSet::new()),
            max_building: AtomicUsize::new(0),
            online_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Instances allocated per deployment
    pub fn set_replication(&self, n: usize) {
        self.replication.store(n, Ordering::SeqCst);
    }

    pub fn set_latest(&self, route: &RouteName, version: u32) {
        lock(&self.latest).insert(route.clone(), version);
    }

    /// Delay before an "online" status is recorded
    pub fn set_online_delay(&self, delay: Duration) {
        *lock(&self.online_delay) = delay;
    }

    pub fn set_fail_new_deployment(&self, fail: bool) {
        self.fail_new_deployment.store(fail, Ordering::SeqCst);
    }

    /// Deploy id the next allocation will receive
    pub fn next_deploy_id(&self) -> DeployId {
        self.next_deploy_id.load(Ordering::SeqCst)
    }

    pub fn statuses(&self, route: &RouteName) -> Vec<BuildStatus> {
        lock(&self.statuses)
            .iter()
            .filter(|(r, _)| r == route)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn last_status(&self, route: &RouteName) -> Option<BuildStatus> {
        self.statuses(route).last().copied()
    }

    /// Highest number of routes ever reported "building" at once
    pub fn max_concurrent_builds(&self) -> usize {
        self.max_building.load(Ordering::SeqCst)
    }

    /// The most recent allocation for every route, as a persistent store would keep it
    pub fn records(&self) -> Vec<DeploymentRecord> {
        let mut records: Vec<_> = lock(&self.records).values().cloned().collect();
        records.sort_by(|a, b| (&a.user, &a.model).cmp(&(&b.user, &b.model)));
        records
    }
}

#[async_trait]
impl ModelStorage for MemoryStorage {
    async fn get(&self, route: &RouteName, version: u32) -> FleetResult<(DeployInfo, PathBuf)> {
        if route.model.starts_with("unknown") {
            return Err(FleetError::Storage(format!(
                "no version {} found for {}",
                version, route
            )));
        }
        let info = DeployInfo {
            username: route.user.clone(),
            modelname: route.model.clone(),
            version,
            lang: "python2".to_string(),
            ..Default::default()
        };
        Ok((info, PathBuf::from(format!("bundles/{}.json", route.model))))
    }

    async fn get_latest(&self, route: &RouteName) -> FleetResult<u32> {
        Ok(lock(&self.latest).get(route).copied().unwrap_or(1))
    }

    async fn set_build_status(&self, route: &RouteName, status: BuildStatus) -> FleetResult<()> {
        if status == BuildStatus::Online {
            let delay = *lock(&self.online_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        {
            let mut building = lock(&self.building);
            if status == BuildStatus::Building {
                if building.insert(route.clone()) {
                    self.max_building.fetch_max(building.len(), Ordering::SeqCst);
                }
            } else {
                building.remove(route);
            }
        }

        if status == BuildStatus::Asleep
            && let Some(record) = lock(&self.records).get_mut(route)
        {
            record.asleep = true;
        }

        lock(&self.statuses).push((route.clone(), status));
        Ok(())
    }

    async fn new_deployment(
        &self,
        route: &RouteName,
        version: u32,
    ) -> FleetResult<(DeployId, Vec<InstanceId>)> {
        if self.fail_new_deployment.load(Ordering::SeqCst) {
            return Err(FleetError::Storage("could not allocate deployment".to_string()));
        }

        let n = self.replication.load(Ordering::SeqCst);
        let deploy_id = self.next_deploy_id.fetch_add(1, Ordering::SeqCst);
        let first = self.next_instance_id.fetch_add(n as i64, Ordering::SeqCst);
        let instance_ids: Vec<InstanceId> = (first..first + n as i64).collect();

        lock(&self.records).insert(
            route.clone(),
            DeploymentRecord {
                user: route.user.clone(),
                model: route.model.clone(),
                version,
                last_deploy_id: deploy_id,
                asleep: false,
                instance_ids: instance_ids.clone(),
            },
        );

        Ok((deploy_id, instance_ids))
    }
}

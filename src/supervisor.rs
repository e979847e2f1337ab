//! Supervisor: routing table, deployment sequencing and prediction proxying

use crate::deployment::Deployment;
use crate::error::{FleetError, FleetResult};
use crate::logs::LogStore;
use crate::pool::WorkerPool;
use crate::storage::ModelStorage;
use crate::tasks::BackgroundTasks;
use crate::types::{
    BuildStatus, DeployId, DeploymentRecord, InstanceId, LogLine, RouteName,
    WorkerId, WorkerRecord,
};
use crate::worker::{WorkerConnector, normalize_worker_url};
use axum::Json;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{Instrument, Span};

/// Default number of deployments allowed to build at once
pub const DEFAULT_BUILD_SLOTS: usize = 4;

const MODEL_NOT_FOUND: &str = "model not found";
const MODEL_BUILDING: &str = "model still building";
const MODEL_ASLEEP: &str = "model is asleep";
const NO_INSTANCES: &str = "no instances of model found";

pub struct SupervisorConfig {
    pub storage: Arc<dyn ModelStorage>,
    pub connector: Arc<dyn WorkerConnector>,
    /// Workers added before reconciliation
    pub workers: Vec<WorkerRecord>,
    /// Where every route should be, as last persisted
    pub deployments: Vec<DeploymentRecord>,
    pub build_slots: usize,
    pub log_dir: PathBuf,
    /// Seed for instance shuffling; random when unset
    pub rng_seed: Option<u64>,
}

#[derive(Default)]
struct RouteTables {
    /// Deployments currently serving
    routes: HashMap<RouteName, Arc<Deployment>>,
    /// Deployments being built, at most one per route
    deployments: HashMap<RouteName, Arc<Deployment>>,
    asleep: HashSet<RouteName>,
}

impl RouteTables {
    /// Whether a deploy issued at `seq` has been overtaken by a later one
    fn superseded(&self, route: &RouteName, seq: u64) -> bool {
        let newer = |d: Option<&Arc<Deployment>>| d.is_some_and(|d| d.seq() > seq);
        newer(self.deployments.get(route)) || newer(self.routes.get(route))
    }
}

/// State of a route as reported by [`Supervisor::routes`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteState {
    Online,
    Building,
    Asleep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSummary {
    pub user: String,
    pub model: String,
    pub state: RouteState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy_id: Option<DeployId>,
    pub instance_ids: Vec<InstanceId>,
}

/// Holds a build slot for the duration of a build
struct BuildSlot {
    _permit: OwnedSemaphorePermit,
}

impl BuildSlot {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        crate::metrics::build_started();
        Self { _permit: permit }
    }
}

impl Drop for BuildSlot {
    fn drop(&mut self) {
        crate::metrics::build_finished();
    }
}

/// Top-level orchestrator.
///
/// The route tables and the instance map each have their own mutex, and the
/// pool has a third. None of them is held across a call to a worker or to
/// storage. Locks are taken in the order status, tables, insts.
pub struct Supervisor {
    pool: Arc<WorkerPool>,
    storage: Arc<dyn ModelStorage>,
    /// Held across a build status write and the table check it depends on
    status: Mutex<()>,
    tables: Mutex<RouteTables>,
    /// instance id -> deployment id, for filing log lines
    insts: Mutex<HashMap<InstanceId, DeployId>>,
    build_slots: Arc<Semaphore>,
    seq: AtomicU64,
    rng: std::sync::Mutex<StdRng>,
    tasks: Arc<BackgroundTasks>,
    logs: LogStore,
    span: Span,
}

impl Supervisor {
    /// Build the pool from the configured workers and reconcile persisted
    /// deployment records against the instances the workers still run.
    ///
    /// Records whose instances survived are adopted without rebuilding,
    /// records with none left are redeployed in the background, and instances
    /// no record claims are destroyed. A record that cannot be adopted is
    /// logged and skipped, leaving its instances to be destroyed as orphans.
    pub async fn new(config: SupervisorConfig) -> FleetResult<Arc<Self>> {
        let span = tracing::info_span!("supervisor");
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let supervisor = Arc::new(Self {
            pool: Arc::new(WorkerPool::new(config.connector)),
            storage: config.storage,
            status: Mutex::new(()),
            tables: Mutex::new(RouteTables::default()),
            insts: Mutex::new(HashMap::new()),
            build_slots: Arc::new(Semaphore::new(config.build_slots.max(1))),
            seq: AtomicU64::new(0),
            rng: std::sync::Mutex::new(rng),
            tasks: Arc::new(BackgroundTasks::new(span.clone())),
            logs: LogStore::new(config.log_dir),
            span,
        });

        for worker in &config.workers {
            tracing::info!(worker_id = worker.id, url = %worker.url, "Adding worker");
            supervisor.add_worker(&worker.url, worker.id).await?;
        }

        let redeploys = supervisor
            .reconcile(config.deployments)
            .instrument(supervisor.span.clone())
            .await;

        for record in redeploys {
            supervisor.deploy_in_background(record.route(), record.version);
        }

        Ok(supervisor)
    }

    async fn reconcile(&self, records: Vec<DeploymentRecord>) -> Vec<DeploymentRecord> {
        let mut orphans: HashSet<InstanceId> = self.pool.instances().await.into_iter().collect();
        if !orphans.is_empty() {
            tracing::info!(
                instances = orphans.len(),
                "Found instances from a previous run"
            );
        }

        let mut redeploys = Vec::new();
        for record in records {
            let route = record.route();

            if record.asleep {
                self.tables.lock().await.asleep.insert(route);
                continue;
            }

            let live: Vec<InstanceId> = record
                .instance_ids
                .iter()
                .copied()
                .filter(|id| orphans.contains(id))
                .collect();
            if live.is_empty() {
                redeploys.push(record);
                continue;
            }

            // Only checks the version still exists; adopted instances are not rebuilt
            if let Err(e) = self.storage.get(&route, record.version).await {
                tracing::warn!(
                    route = %route,
                    version = record.version,
                    error = %e,
                    "Version of persisted deployment is missing, not adopting its instances"
                );
                continue;
            }

            let deployment = Arc::new(Deployment::new(
                &self.pool,
                route.clone(),
                record.version,
                record.last_deploy_id,
                record.instance_ids.clone(),
                self.next_seq(),
            ));
            deployment.adopt(&live).await;

            let mut tables = self.tables.lock().await;
            if tables.routes.contains_key(&route) {
                tracing::warn!(
                    route = %route,
                    deploy_id = record.last_deploy_id,
                    "Route persisted twice, not adopting the later record"
                );
                continue;
            }
            {
                let mut insts = self.insts.lock().await;
                for id in &live {
                    orphans.remove(id);
                    insts.insert(*id, record.last_deploy_id);
                }
            }
            tracing::info!(route = %route, instances = live.len(), "Adopted running instances");
            tables.routes.insert(route, deployment);
            crate::metrics::update_route_count(tables.routes.len());
        }

        if !orphans.is_empty() {
            tracing::info!(instances = orphans.len(), "Removing orphaned instances");
        }
        for id in orphans {
            if let Err(e) = self.pool.remove_instance(id).await {
                tracing::warn!(instance_id = id, error = %e, "Failed to remove orphaned instance");
            }
        }

        redeploys
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Add a worker to the rotation
    pub async fn add_worker(&self, addr: &str, worker_id: WorkerId) -> FleetResult<()> {
        self.pool.add(&normalize_worker_url(addr), worker_id).await
    }

    /// Remove a worker and destroy its instances
    pub async fn remove_worker(&self, worker_id: WorkerId) -> FleetResult<()> {
        self.pool.remove_worker(worker_id).await
    }

    /// Remove a worker but leave its instances running, so another process
    /// can adopt them
    pub async fn release_worker(&self, worker_id: WorkerId) -> FleetResult<()> {
        self.pool.release_worker(worker_id).await
    }

    /// Ping a worker, removing it if it does not answer.
    /// Returns whether the worker is healthy.
    pub async fn monitor_worker(&self, worker_id: WorkerId) -> bool {
        let Err(e) = self.pool.ping_worker(worker_id).await else {
            return true;
        };

        tracing::warn!(worker_id, error = %e, "Worker heartbeat failed, removing worker");
        crate::metrics::record_worker_failure(worker_id);
        if let Err(e) = self.remove_worker(worker_id).await {
            tracing::warn!(worker_id, error = %e, "Could not remove worker cleanly");
        }
        false
    }

    /// Heartbeat every instance of every serving route.
    ///
    /// Returns the routes that lost instances with how many are missing.
    pub async fn monitor_routes(&self) -> Vec<(RouteName, usize)> {
        let active: Vec<Arc<Deployment>> =
            self.tables.lock().await.routes.values().cloned().collect();

        let mut degraded = Vec::new();
        for deployment in active {
            let missing = deployment.monitor().await;
            if missing > 0 {
                tracing::warn!(
                    route = %deployment.route(),
                    missing,
                    "Deployment has lost instances"
                );
                degraded.push((deployment.route().clone(), missing));
            }
        }
        degraded
    }

    /// Deploy a version of a model, replacing whatever serves the route once
    /// every new instance is built.
    ///
    /// A deploy superseded by a later one for the same route, or by a sleep or
    /// delete, fails with [`FleetError::DeploymentCancelled`].
    pub async fn deploy(&self, route: &RouteName, version: u32) -> FleetResult<()> {
        self.run_deploy(route, version)
            .instrument(self.span.clone())
            .await
    }

    async fn run_deploy(&self, route: &RouteName, version: u32) -> FleetResult<()> {
        let seq = self.next_seq();

        let (info, bundle) = self.storage.get(route, version).await?;
        let (deploy_id, ids) = self.storage.new_deployment(route, version).await?;
        let instances = ids.len();

        let deployment = Arc::new(Deployment::new(
            &self.pool,
            route.clone(),
            version,
            deploy_id,
            ids,
            seq,
        ));

        {
            let mut tables = self.tables.lock().await;
            if tables.superseded(route, seq) {
                drop(tables);
                tracing::info!(route = %route, version, deploy_id, "Deploy overtaken before it started");
                crate::metrics::record_deployment("cancelled");
                return Err(FleetError::DeploymentCancelled);
            }
            if let Some(previous) = tables.deployments.insert(route.clone(), deployment.clone()) {
                // Cancelled under the lock so the evicted deploy can never publish
                previous.cancel();
                self.kill_in_background(previous);
            }
            let mut insts = self.insts.lock().await;
            for &id in deployment.allocated() {
                insts.insert(id, deploy_id);
            }
        }

        tracing::info!(
            route = %route,
            version,
            deploy_id,
            instances,
            "Deployment queued"
        );

        // The slot stays held until the outcome is recorded, so storage never
        // sees more routes building than there are slots
        let slot = match self.acquire_slot(&deployment).await {
            Ok(slot) => slot,
            Err(e) => return self.finish(&deployment, Err(e)).await,
        };

        self.set_deployment_status(&deployment, BuildStatus::Building)
            .await;
        tracing::info!(route = %route, deploy_id, "Building instances");

        let result = match deployment.build_instances(&info, &bundle).await {
            Ok(()) => self.publish(&deployment).await,
            Err(e) => Err(e),
        };
        let outcome = self.finish(&deployment, result).await;
        drop(slot);
        outcome
    }

    /// Wait for a build slot unless the deployment is cancelled first
    async fn acquire_slot(&self, deployment: &Arc<Deployment>) -> FleetResult<BuildSlot> {
        self.set_deployment_status(deployment, BuildStatus::Queued)
            .await;

        if deployment.is_cancelled() {
            return Err(FleetError::DeploymentCancelled);
        }

        tokio::select! {
            _ = deployment.cancelled() => Err(FleetError::DeploymentCancelled),
            permit = self.build_slots.clone().acquire_owned() => permit
                .map(BuildSlot::new)
                .map_err(|_| FleetError::Internal("build slots closed".to_string())),
        }
    }

    /// Record how a deploy ended and clean up after it
    async fn finish(
        &self,
        deployment: &Arc<Deployment>,
        result: FleetResult<Option<Arc<Deployment>>>,
    ) -> FleetResult<()> {
        let route = deployment.route();
        let version = deployment.version();
        let deploy_id = deployment.deploy_id();

        match result {
            Ok(previous) => {
                self.set_deployment_status(deployment, BuildStatus::Online)
                    .await;
                crate::metrics::record_deployment("online");
                tracing::info!(route = %route, version, deploy_id, "Deployment online");
                if let Some(previous) = previous {
                    self.kill_in_background(previous);
                }
                Ok(())
            }
            Err(e) => {
                {
                    let _status = self.status.lock().await;
                    if self.detach(deployment).await && !e.is_cancelled() {
                        self.set_status(route, BuildStatus::Failed).await;
                    }
                }
                deployment.kill().await;

                if e.is_cancelled() {
                    crate::metrics::record_deployment("cancelled");
                    tracing::info!(route = %route, version, deploy_id, "Deployment cancelled");
                } else {
                    crate::metrics::record_deployment("failed");
                    tracing::error!(
                        route = %route,
                        version,
                        deploy_id,
                        error = %e,
                        "Deployment failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Move a built deployment from the in-flight table to the routing table.
    /// Returns the deployment it replaced.
    async fn publish(&self, deployment: &Arc<Deployment>) -> FleetResult<Option<Arc<Deployment>>> {
        let route = deployment.route();
        let mut tables = self.tables.lock().await;

        let current = tables
            .deployments
            .get(route)
            .is_some_and(|d| Arc::ptr_eq(d, deployment));
        if !current || deployment.is_cancelled() || tables.superseded(route, deployment.seq()) {
            return Err(FleetError::DeploymentCancelled);
        }

        tables.deployments.remove(route);
        tables.asleep.remove(route);
        let previous = tables.routes.insert(route.clone(), deployment.clone());
        crate::metrics::update_route_count(tables.routes.len());

        Ok(previous)
    }

    /// Drop a deployment that will not be published from the in-flight table.
    /// Returns whether it was still the route's in-flight deployment.
    async fn detach(&self, deployment: &Arc<Deployment>) -> bool {
        let mut tables = self.tables.lock().await;
        let current = tables
            .deployments
            .get(deployment.route())
            .is_some_and(|d| Arc::ptr_eq(d, deployment));
        if current {
            tables.deployments.remove(deployment.route());
        }
        current
    }

    /// Record a build status only while the deployment still owns its route,
    /// so a sleep or a newer deploy is never overwritten by a stale status
    async fn set_deployment_status(&self, deployment: &Arc<Deployment>, status: BuildStatus) {
        let route = deployment.route();
        let _status = self.status.lock().await;
        let owns_route = {
            let tables = self.tables.lock().await;
            let is_this = |d: Option<&Arc<Deployment>>| d.is_some_and(|d| Arc::ptr_eq(d, deployment));
            is_this(tables.deployments.get(route)) || is_this(tables.routes.get(route))
        };
        if owns_route {
            self.set_status(route, status).await;
        } else {
            tracing::debug!(route = %route, status = %status, "Deployment no longer owns route, status not recorded");
        }
    }

    async fn set_status(&self, route: &RouteName, status: BuildStatus) {
        if let Err(e) = self.storage.set_build_status(route, status).await {
            tracing::warn!(route = %route, status = %status, error = %e, "Failed to record build status");
        }
    }

    fn kill_in_background(&self, deployment: Arc<Deployment>) {
        self.tasks.spawn("kill deployment", async move {
            deployment.kill().await;
            Ok(())
        });
    }

    /// Track work that runs off the caller's path; shutdown waits for it
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = FleetResult<()>> + Send + 'static,
    {
        self.tasks.spawn(name, task);
    }

    /// Run a deploy off the caller's path, logging its failure
    pub fn deploy_in_background(self: &Arc<Self>, route: RouteName, version: u32) {
        let supervisor = self.clone();
        self.spawn("deploy", async move {
            supervisor.deploy(&route, version).await
        });
    }

    /// Run a restart off the caller's path, logging its failure
    pub fn restart_in_background(self: &Arc<Self>, route: RouteName) {
        let supervisor = self.clone();
        self.spawn("restart", async move {
            supervisor.restart(&route).await
        });
    }

    /// Stop serving a route and mark it asleep
    pub async fn sleep(&self, route: &RouteName) -> FleetResult<()> {
        let _status = self.status.lock().await;
        self.take_route(route, true).await;
        tracing::info!(route = %route, "Route put to sleep");
        self.storage
            .set_build_status(route, BuildStatus::Asleep)
            .await
    }

    /// Redeploy the latest version of a sleeping route
    pub async fn wake(&self, route: &RouteName) -> FleetResult<()> {
        if !self.tables.lock().await.asleep.remove(route) {
            return Err(FleetError::AlreadyAwake(route.clone()));
        }
        tracing::info!(route = %route, "Waking route");

        let version = self.storage.get_latest(route).await?;
        self.deploy(route, version).await
    }

    /// Redeploy the serving version, or the latest one if nothing serves
    pub async fn restart(&self, route: &RouteName) -> FleetResult<()> {
        let active = self
            .tables
            .lock()
            .await
            .routes
            .get(route)
            .map(|d| d.version());

        let version = match active {
            Some(version) => version,
            None => self.storage.get_latest(route).await?,
        };
        self.deploy(route, version).await
    }

    /// Stop serving a route and forget it
    pub async fn delete(&self, route: &RouteName) {
        self.take_route(route, false).await;
        tracing::info!(route = %route, "Route deleted");
    }

    async fn take_route(&self, route: &RouteName, asleep: bool) {
        let removed = {
            let mut tables = self.tables.lock().await;
            if asleep {
                tables.asleep.insert(route.clone());
            } else {
                tables.asleep.remove(route);
            }
            let removed = [tables.deployments.remove(route), tables.routes.remove(route)];
            crate::metrics::update_route_count(tables.routes.len());
            removed
        };

        for deployment in removed.into_iter().flatten() {
            deployment.cancel();
            self.kill_in_background(deployment);
        }
    }

    /// Remove every route owned by a user.
    ///
    /// With `blocking` the call returns once every instance is torn down;
    /// otherwise teardown continues in the background.
    pub async fn delete_user(&self, user: &str, blocking: bool) {
        let removed: Vec<Arc<Deployment>> = {
            let mut guard = self.tables.lock().await;
            let tables = &mut *guard;
            let mut removed = Vec::new();
            for table in [&mut tables.routes, &mut tables.deployments] {
                let routes: Vec<RouteName> =
                    table.keys().filter(|r| r.user == user).cloned().collect();
                removed.extend(routes.iter().filter_map(|r| table.remove(r)));
            }
            tables.asleep.retain(|r| r.user != user);
            crate::metrics::update_route_count(tables.routes.len());
            removed
        };

        tracing::info!(user, deployments = removed.len(), "Deleting user's routes");

        for deployment in removed {
            deployment.cancel();
            if blocking {
                deployment.kill().await;
            } else {
                self.kill_in_background(deployment);
            }
        }
    }

    /// Proxy a prediction to a random live instance of the route.
    ///
    /// Never fails: when no instance answers the response is a 500 with a JSON
    /// body explaining why.
    pub async fn predict(&self, route: &RouteName, request: Request<Body>) -> Response<Body> {
        let active = self.tables.lock().await.routes.get(route).cloned();

        if let Some(deployment) = &active {
            let mut ids = deployment.instances().await;
            ids.shuffle(&mut *self.rng());

            for id in ids {
                let Some(handle) = self.pool.predict(id).await else {
                    continue;
                };
                return match handle.forward(request).await {
                    Ok(response) => {
                        crate::metrics::record_prediction("ok");
                        response
                    }
                    Err(e) => {
                        tracing::warn!(route = %route, instance_id = id, error = %e, "Prediction proxy failed");
                        crate::metrics::record_prediction("proxy_error");
                        prediction_error(StatusCode::BAD_GATEWAY, &e.to_string())
                    }
                };
            }
        }

        let reason = {
            let tables = self.tables.lock().await;
            if tables.asleep.contains(route) {
                MODEL_ASLEEP
            } else if tables.deployments.contains_key(route) {
                MODEL_BUILDING
            } else if active.is_some() {
                NO_INSTANCES
            } else {
                MODEL_NOT_FOUND
            }
        };
        crate::metrics::record_prediction(reason);
        prediction_error(StatusCode::INTERNAL_SERVER_ERROR, reason)
    }

    /// Drain every worker's log buffer into the route log files.
    /// Returns the number of lines written.
    pub async fn write_logs(&self) -> FleetResult<usize> {
        let mut lines: Vec<LogLine> = Vec::new();
        for worker_id in self.pool.workers().await {
            match self.pool.logs(worker_id).await {
                Ok(worker_lines) => lines.extend(worker_lines),
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "Could not get logs from worker");
                }
            }
        }

        {
            let insts = self.insts.lock().await;
            lines.retain_mut(|line| match insts.get(&line.instance_id) {
                Some(deploy_id) => {
                    line.deployment_id = *deploy_id;
                    true
                }
                None => {
                    tracing::debug!(instance_id = line.instance_id, "Log line from unknown instance");
                    false
                }
            });
        }

        let written = lines.len();
        self.logs.append(lines).await?;
        self.prune_insts().await;
        Ok(written)
    }

    /// Forget instance ids that neither a route nor the pool still holds.
    ///
    /// Runs after a flush, so lines buffered by instances that were torn
    /// down but are still on a worker keep their deployment id.
    async fn prune_insts(&self) {
        let mut live: HashSet<InstanceId> = self.pool.instances().await.into_iter().collect();

        let tables = self.tables.lock().await;
        for deployment in tables.routes.values().chain(tables.deployments.values()) {
            live.extend(deployment.allocated());
        }

        let mut insts = self.insts.lock().await;
        let before = insts.len();
        insts.retain(|id, _| live.contains(id));
        if insts.len() < before {
            tracing::debug!(forgotten = before - insts.len(), "Pruned instance map");
        }
    }

    /// Number of instance ids log lines can currently be filed under
    pub async fn tracked_instances(&self) -> usize {
        self.insts.lock().await.len()
    }

    pub async fn read_deployment_logs(
        &self,
        route: &RouteName,
        deploy_id: DeployId,
    ) -> FleetResult<Vec<LogLine>> {
        self.logs.read_deployment_logs(route, deploy_id).await
    }

    pub async fn read_model_logs(&self, route: &RouteName) -> FleetResult<Vec<LogLine>> {
        self.logs.read_model_logs(route).await
    }

    /// Every known route, sorted by user then model
    pub async fn routes(&self) -> Vec<RouteSummary> {
        let (active, building, asleep) = {
            let tables = self.tables.lock().await;
            (
                tables.routes.values().cloned().collect::<Vec<_>>(),
                tables
                    .deployments
                    .iter()
                    .filter(|(route, _)| !tables.routes.contains_key(*route))
                    .map(|(_, d)| d.clone())
                    .collect::<Vec<_>>(),
                tables.asleep.iter().cloned().collect::<Vec<_>>(),
            )
        };

        let mut summaries = Vec::new();
        for (state, deployments) in [(RouteState::Online, active), (RouteState::Building, building)] {
            for deployment in deployments {
                summaries.push(RouteSummary {
                    user: deployment.route().user.clone(),
                    model: deployment.route().model.clone(),
                    state,
                    version: Some(deployment.version()),
                    deploy_id: Some(deployment.deploy_id()),
                    instance_ids: deployment.instances().await,
                });
            }
        }
        for route in asleep {
            summaries.push(RouteSummary {
                user: route.user,
                model: route.model,
                state: RouteState::Asleep,
                version: None,
                deploy_id: None,
                instance_ids: Vec::new(),
            });
        }

        summaries.sort_by(|a, b| (&a.user, &a.model).cmp(&(&b.user, &b.model)));
        summaries
    }

    /// Instances serving a route, if it is online
    pub async fn active_instances(&self, route: &RouteName) -> Option<Vec<InstanceId>> {
        let deployment = self.tables.lock().await.routes.get(route).cloned()?;
        Some(deployment.instances().await)
    }

    pub async fn is_building(&self, route: &RouteName) -> bool {
        self.tables.lock().await.deployments.contains_key(route)
    }

    pub async fn is_asleep(&self, route: &RouteName) -> bool {
        self.tables.lock().await.asleep.contains(route)
    }

    /// Wait for background teardown and redeploys to finish
    pub async fn wait_idle(&self) {
        self.tasks.wait_idle().await;
    }

    /// Flush logs one last time and wait for background work
    pub async fn shutdown(&self) {
        if let Err(e) = self.write_logs().await {
            tracing::warn!(error = %e, "Final log flush failed");
        }
        self.wait_idle().await;
        tracing::info!("Supervisor stopped");
    }
}

fn prediction_error(status: StatusCode, reason: &str) -> Response<Body> {
    (status, Json(serde_json::json!({ "error": reason }))).into_response()
}

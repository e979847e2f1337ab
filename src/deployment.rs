//! A single rollout of a model version onto the worker pool

use crate::error::{FleetError, FleetResult};
use crate::pool::WorkerPool;
use crate::types::{DeployId, DeployInfo, InstanceId, RouteName};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;

/// One rollout of (route, version) to a fixed set of instance ids.
///
/// A deployment owns every instance id it has reserved in the pool, from the
/// moment the reservation succeeds. [`Deployment::kill`] releases them all.
///
/// The pool belongs to the supervisor and outlives every deployment, so a
/// deployment only keeps a weak handle to it.
pub struct Deployment {
    route: RouteName,
    version: u32,
    deploy_id: DeployId,
    /// Issue order of the deploy that created this deployment
    seq: u64,
    /// Ids storage allocated to this deployment
    allocated: Vec<InstanceId>,
    instance_ids: Mutex<Vec<InstanceId>>,
    cancel: watch::Sender<bool>,
    pool: Weak<WorkerPool>,
}

impl Deployment {
    pub fn new(
        pool: &Arc<WorkerPool>,
        route: RouteName,
        version: u32,
        deploy_id: DeployId,
        allocated: Vec<InstanceId>,
        seq: u64,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            route,
            version,
            deploy_id,
            seq,
            allocated,
            instance_ids: Mutex::new(Vec::new()),
            cancel,
            pool: Arc::downgrade(pool),
        }
    }

    fn pool(&self) -> FleetResult<Arc<WorkerPool>> {
        self.pool
            .upgrade()
            .ok_or_else(|| FleetError::Internal("worker pool is gone".to_string()))
    }

    pub fn route(&self) -> &RouteName {
        &self.route
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn deploy_id(&self) -> DeployId {
        self.deploy_id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn expected_count(&self) -> usize {
        self.allocated.len()
    }

    /// Every id allocated to this deployment, built or not
    pub fn allocated(&self) -> &[InstanceId] {
        &self.allocated
    }

    /// Take ownership of instances that are already running in the pool
    pub async fn adopt(&self, ids: &[InstanceId]) {
        self.instance_ids.lock().await.extend_from_slice(ids);
    }

    /// Instance ids currently owned by this deployment
    pub async fn instances(&self) -> Vec<InstanceId> {
        self.instance_ids.lock().await.clone()
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the deployment has been cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Reserve every allocated id in the pool, then build them all concurrently.
    ///
    /// Resolves on the first build error, on cancellation, or once every
    /// build succeeded. Reservations are not rolled back here: on error the
    /// caller tears the deployment down with [`Deployment::kill`].
    pub async fn build_instances(&self, info: &DeployInfo, bundle: &Path) -> FleetResult<()> {
        if self.is_cancelled() {
            return Err(FleetError::DeploymentCancelled);
        }
        let pool = self.pool()?;

        for &id in &self.allocated {
            pool.queue_build(id).await?;
            self.instance_ids.lock().await.push(id);
        }

        let info = Arc::new(info.clone());
        let bundle: Arc<PathBuf> = Arc::new(bundle.to_path_buf());
        let mut builds = JoinSet::new();
        for &id in &self.allocated {
            let pool = pool.clone();
            let info = info.clone();
            let bundle = bundle.clone();
            builds.spawn(async move { pool.build(id, &info, &bundle).await });
        }

        let outcome = tokio::select! {
            _ = self.cancelled() => Err(FleetError::DeploymentCancelled),
            result = Self::join_builds(&mut builds) => result,
        };
        // Builds still running finish on their own; removing their ids makes
        // the pool destroy whatever they produce
        builds.detach_all();

        match outcome {
            Err(_) if self.is_cancelled() => Err(FleetError::DeploymentCancelled),
            outcome => outcome,
        }
    }

    async fn join_builds(builds: &mut JoinSet<FleetResult<()>>) -> FleetResult<()> {
        while let Some(result) = builds.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(FleetError::Internal(format!("build task failed: {}", e))),
            }
        }
        Ok(())
    }

    /// Cancel the deployment and remove every instance it owns.
    ///
    /// Removal failures are logged, never returned. Killing twice is harmless:
    /// the second call finds nothing left to remove.
    pub async fn kill(&self) {
        self.cancel();

        let ids = std::mem::take(&mut *self.instance_ids.lock().await);
        let Ok(pool) = self.pool() else {
            tracing::debug!(route = %self.route, deploy_id = self.deploy_id, "Pool gone, nothing to remove");
            return;
        };
        for id in ids {
            if let Err(e) = pool.remove_instance(id).await {
                tracing::warn!(
                    route = %self.route,
                    deploy_id = self.deploy_id,
                    instance_id = id,
                    error = %e,
                    "Failed to remove instance"
                );
            }
        }

        tracing::debug!(route = %self.route, deploy_id = self.deploy_id, "Deployment killed");
    }

    /// Ping every owned instance, dropping the ones that fail.
    ///
    /// Returns how many instances are missing relative to the expected count.
    pub async fn monitor(&self) -> usize {
        let Ok(pool) = self.pool() else {
            return 0;
        };

        let mut failed = Vec::new();
        for id in self.instances().await {
            if let Err(e) = pool.ping_instance(id).await {
                tracing::warn!(
                    route = %self.route,
                    instance_id = id,
                    error = %e,
                    "Instance failed heartbeat"
                );
                failed.push(id);
            }
        }

        let healthy = {
            let mut ids = self.instance_ids.lock().await;
            ids.retain(|id| !failed.contains(id));
            ids.len()
        };

        for id in failed {
            if let Err(e) = pool.remove_instance(id).await {
                tracing::debug!(instance_id = id, error = %e, "Could not remove failed instance");
            }
        }

        self.expected_count().saturating_sub(healthy)
    }
}

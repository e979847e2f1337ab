//! Worker pool: several worker nodes presented as one build and predict capacity

use crate::error::{FleetError, FleetResult};
use crate::types::{DeployInfo, InstanceId, LogLine, WorkerId};
use crate::worker::{WorkerClient, WorkerConnector};
use axum::body::Body;
use axum::http::{Request, Response};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

struct WorkerEntry {
    client: Arc<dyn WorkerClient>,
    /// Instances reserved or running on this worker
    assigned: usize,
}

#[derive(Default)]
struct PoolState {
    /// Ordered so that least-loaded selection breaks ties on the lowest id
    workers: BTreeMap<WorkerId, WorkerEntry>,
    /// instance id -> owning worker id
    instances: HashMap<InstanceId, WorkerId>,
}

impl PoolState {
    /// Resolve the client owning an instance. Drops the instance entry if
    /// its worker has gone away.
    fn instance_client(&mut self, instance_id: InstanceId) -> Option<Arc<dyn WorkerClient>> {
        let worker_id = *self.instances.get(&instance_id)?;
        match self.workers.get(&worker_id) {
            Some(worker) => Some(worker.client.clone()),
            None => {
                self.instances.remove(&instance_id);
                None
            }
        }
    }
}

/// Thread-safe pool of worker nodes.
///
/// A single mutex guards both the worker map and the instance map. It is
/// never held across a call to a worker.
pub struct WorkerPool {
    state: Mutex<PoolState>,
    connector: Arc<dyn WorkerConnector>,
}

/// Proxy for the worker currently owning an instance
pub struct PredictHandle {
    instance_id: InstanceId,
    client: Arc<dyn WorkerClient>,
}

impl PredictHandle {
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub async fn forward(self, request: Request<Body>) -> FleetResult<Response<Body>> {
        self.client.predict(self.instance_id, request).await
    }
}

impl WorkerPool {
    pub fn new(connector: Arc<dyn WorkerConnector>) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            connector,
        }
    }

    /// Connect to a worker and add it to the pool.
    ///
    /// Instances the worker reports as not ready are leftovers from a crash and
    /// are destroyed; ready ones are adopted and count toward the worker's load.
    pub async fn add(&self, base_url: &str, worker_id: WorkerId) -> FleetResult<()> {
        if self.state.lock().await.workers.contains_key(&worker_id) {
            return Err(FleetError::WorkerExists(worker_id));
        }

        let client = self.connector.connect(base_url)?;
        let statuses = client
            .status()
            .await
            .map_err(|e| FleetError::Worker(format!("could not ping worker: {}", e)))?;

        let mut ready = Vec::with_capacity(statuses.len());
        for status in statuses {
            if status.ready {
                ready.push(status.id);
                continue;
            }
            if let Err(e) = client.destroy(status.id).await {
                tracing::warn!(
                    worker_id,
                    instance_id = status.id,
                    error = %e,
                    "Could not destroy instance that was not ready"
                );
            }
        }

        let mut state = self.state.lock().await;
        if state.workers.contains_key(&worker_id) {
            return Err(FleetError::WorkerExists(worker_id));
        }
        for id in &ready {
            state.instances.insert(*id, worker_id);
        }
        state.workers.insert(
            worker_id,
            WorkerEntry {
                client,
                assigned: ready.len(),
            },
        );

        tracing::info!(
            worker_id,
            url = %base_url,
            adopted_instances = ready.len(),
            total_workers = state.workers.len(),
            "Worker added to pool"
        );
        crate::metrics::update_worker_count(state.workers.len());

        Ok(())
    }

    /// Reserve a build slot for an instance on the least-loaded worker.
    ///
    /// The worker's counter is bumped immediately so that concurrent
    /// reservations spread out before any build completes.
    pub async fn queue_build(&self, instance_id: InstanceId) -> FleetResult<WorkerId> {
        let mut state = self.state.lock().await;

        let (&worker_id, worker) = state
            .workers
            .iter_mut()
            .min_by_key(|(_, worker)| worker.assigned)
            .ok_or(FleetError::NoWorkers)?;
        worker.assigned += 1;

        state.instances.insert(instance_id, worker_id);

        tracing::debug!(instance_id, worker_id, "Build queued");

        Ok(worker_id)
    }

    /// Build an instance previously reserved with [`WorkerPool::queue_build`].
    ///
    /// Removing the instance while the build is in flight cancels it: the
    /// build reports [`FleetError::BuildCancelled`] and whatever the worker
    /// built is destroyed.
    pub async fn build(
        &self,
        instance_id: InstanceId,
        info: &DeployInfo,
        bundle: &Path,
    ) -> FleetResult<()> {
        let client = self
            .state
            .lock()
            .await
            .instance_client(instance_id)
            .ok_or(FleetError::NoSuchInstance(instance_id))?;

        client.deploy(instance_id, info, bundle).await?;

        let still_reserved = self.state.lock().await.instances.contains_key(&instance_id);
        if !still_reserved {
            if let Err(e) = client.destroy(instance_id).await {
                tracing::debug!(
                    instance_id,
                    error = %e,
                    "Could not destroy instance built after cancellation"
                );
            }
            return Err(FleetError::BuildCancelled(instance_id));
        }

        tracing::debug!(instance_id, "Instance built");
        Ok(())
    }

    /// Forget an instance and destroy it on its worker
    pub async fn remove_instance(&self, instance_id: InstanceId) -> FleetResult<()> {
        let client = {
            let mut state = self.state.lock().await;
            let worker_id = state
                .instances
                .remove(&instance_id)
                .ok_or(FleetError::NoSuchInstance(instance_id))?;
            let worker = state
                .workers
                .get_mut(&worker_id)
                .ok_or(FleetError::NoSuchInstance(instance_id))?;
            worker.assigned = worker.assigned.saturating_sub(1);
            worker.client.clone()
        };

        crate::metrics::record_instance_removed();

        client.destroy(instance_id).await
    }

    /// Pull a worker from rotation and destroy every instance still on it.
    ///
    /// Destruction is best effort: the first failure is returned once every
    /// instance has been attempted, the rest are logged.
    pub async fn remove_worker(&self, worker_id: WorkerId) -> FleetResult<()> {
        let (client, instance_ids) = self.detach_worker(worker_id).await?;

        let mut first_error = None;
        for instance_id in instance_ids {
            if let Err(e) = client.destroy(instance_id).await {
                tracing::warn!(
                    worker_id,
                    instance_id,
                    error = %e,
                    "Could not destroy instance on removed worker"
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Pull a worker from rotation, leaving its instances running
    pub async fn release_worker(&self, worker_id: WorkerId) -> FleetResult<()> {
        let (_, instance_ids) = self.detach_worker(worker_id).await?;
        tracing::info!(
            worker_id,
            instances = instance_ids.len(),
            "Worker released with instances left running"
        );
        Ok(())
    }

    async fn detach_worker(
        &self,
        worker_id: WorkerId,
    ) -> FleetResult<(Arc<dyn WorkerClient>, Vec<InstanceId>)> {
        let mut state = self.state.lock().await;
        let worker = state
            .workers
            .remove(&worker_id)
            .ok_or(FleetError::WorkerNotFound(worker_id))?;

        let mut instance_ids = Vec::new();
        state.instances.retain(|id, owner| {
            if *owner == worker_id {
                instance_ids.push(*id);
                false
            } else {
                true
            }
        });

        tracing::info!(worker_id, instances = instance_ids.len(), "Worker removed from pool");
        crate::metrics::update_worker_count(state.workers.len());

        Ok((worker.client, instance_ids))
    }

    /// Proxy handle for an instance, or `None` if the pool no longer tracks it
    pub async fn predict(&self, instance_id: InstanceId) -> Option<PredictHandle> {
        let client = self.state.lock().await.instance_client(instance_id)?;
        Some(PredictHandle {
            instance_id,
            client,
        })
    }

    pub async fn ping_instance(&self, instance_id: InstanceId) -> FleetResult<()> {
        let client = self
            .state
            .lock()
            .await
            .instance_client(instance_id)
            .ok_or(FleetError::NoSuchInstance(instance_id))?;
        client.heartbeat(instance_id).await
    }

    pub async fn ping_worker(&self, worker_id: WorkerId) -> FleetResult<()> {
        self.worker_client(worker_id).await?.ping().await
    }

    /// Drain a worker's buffered log lines
    pub async fn logs(&self, worker_id: WorkerId) -> FleetResult<Vec<LogLine>> {
        self.worker_client(worker_id).await?.logs().await
    }

    async fn worker_client(&self, worker_id: WorkerId) -> FleetResult<Arc<dyn WorkerClient>> {
        self.state
            .lock()
            .await
            .workers
            .get(&worker_id)
            .map(|worker| worker.client.clone())
            .ok_or(FleetError::WorkerNotFound(worker_id))
    }

    /// Ids of every worker, ascending
    pub async fn workers(&self) -> Vec<WorkerId> {
        self.state.lock().await.workers.keys().copied().collect()
    }

    /// Ids of every instance tracked by the pool
    pub async fn instances(&self) -> Vec<InstanceId> {
        self.state.lock().await.instances.keys().copied().collect()
    }

    /// Worker currently owning an instance
    pub async fn owner(&self, instance_id: InstanceId) -> Option<WorkerId> {
        self.state.lock().await.instances.get(&instance_id).copied()
    }

    /// Number of instances assigned to a worker
    pub async fn load(&self, worker_id: WorkerId) -> Option<usize> {
        self.state
            .lock()
            .await
            .workers
            .get(&worker_id)
            .map(|worker| worker.assigned)
    }
}

//! Supervisor behaviour against in-memory workers and storage
//!
//! Covers deploy sequencing, route lifecycle, build slot limits, log filing
//! and reconciliation of persisted records on startup.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use fleet_manager::error::FleetError;
use fleet_manager::testing::{MemoryStorage, MockConnector, MockWorker};
use fleet_manager::types::{BuildStatus, DeploymentRecord, InstanceStatus, RouteName, WorkerRecord};
use fleet_manager::{FleetResult, Supervisor, SupervisorConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    supervisor: Arc<Supervisor>,
    storage: Arc<MemoryStorage>,
    workers: Vec<Arc<MockWorker>>,
    _dir: TempDir,
}

fn worker_records(count: usize) -> Vec<WorkerRecord> {
    (1..=count)
        .map(|i| WorkerRecord {
            id: i as i64,
            url: format!("worker-{}", i),
        })
        .collect()
}

async fn start(
    connector: Arc<MockConnector>,
    storage: Arc<MemoryStorage>,
    workers: usize,
    deployments: Vec<DeploymentRecord>,
) -> FleetResult<(Arc<Supervisor>, TempDir)> {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let supervisor = Supervisor::new(SupervisorConfig {
        storage,
        connector,
        workers: worker_records(workers),
        deployments,
        build_slots: 4,
        log_dir: dir.path().join("logs"),
        rng_seed: Some(42),
    })
    .await?;
    Ok((supervisor, dir))
}

async fn harness(workers: usize) -> Harness {
    let connector = Arc::new(MockConnector::new());
    let mocks: Vec<_> = (1..=workers)
        .map(|i| connector.register(&format!("http://worker-{}", i)))
        .collect();
    let storage = Arc::new(MemoryStorage::new());
    let (supervisor, dir) = start(connector, storage.clone(), workers, Vec::new())
        .await
        .expect("Failed to start supervisor");

    Harness {
        supervisor,
        storage,
        workers: mocks,
        _dir: dir,
    }
}

async fn predict(supervisor: &Supervisor, route: &RouteName) -> (StatusCode, serde_json::Value) {
    let response = supervisor
        .predict(route, Request::new(Body::from("{}")))
        .await;
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    (status, serde_json::from_slice(&body).expect("Body is not JSON"))
}

fn sorted(mut ids: Vec<i64>) -> Vec<i64> {
    ids.sort_unstable();
    ids
}

// =============================================================================
// Deploy
// =============================================================================

#[tokio::test]
async fn test_deploy_then_predict_reaches_version() {
    let h = harness(2).await;
    let route = RouteName::new("bigdatabob", "hellopy");

    h.supervisor.deploy(&route, 4).await.unwrap();

    let (status, body) = predict(&h.supervisor, &route).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 4);
    assert_eq!(body["model"], "hellopy");

    let statuses = h.storage.statuses(&route);
    assert_eq!(
        statuses,
        vec![BuildStatus::Queued, BuildStatus::Building, BuildStatus::Online]
    );
}

#[tokio::test]
async fn test_deploy_spreads_instances_across_workers() {
    let h = harness(2).await;
    let route = RouteName::new("alice", "iris");

    h.supervisor.deploy(&route, 1).await.unwrap();

    for worker in &h.workers {
        assert_eq!(worker.instance_ids().len(), 1);
    }
}

#[tokio::test]
async fn test_redeploy_removes_old_instances() {
    let h = harness(1).await;
    let route = RouteName::new("alice", "iris");

    h.supervisor.deploy(&route, 1).await.unwrap();
    let old = h.supervisor.active_instances(&route).await.unwrap();

    h.supervisor.deploy(&route, 2).await.unwrap();
    h.supervisor.wait_idle().await;

    let new = h.supervisor.active_instances(&route).await.unwrap();
    assert_eq!(new.len(), 2);
    for id in &old {
        assert!(!new.contains(id));
        assert!(!h.workers[0].has_instance(*id));
    }
    assert_eq!(sorted(h.supervisor.pool().instances().await), sorted(new));

    let (status, body) = predict(&h.supervisor, &route).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 2);
}

#[tokio::test]
async fn test_concurrent_deploys_leave_one_deployment() {
    let h = harness(2).await;
    let route = RouteName::new("alice", "iris");

    let (first, second) = tokio::join!(
        h.supervisor.deploy(&route, 1),
        h.supervisor.deploy(&route, 2)
    );
    assert!(first.is_ok() || second.is_ok());
    h.supervisor.wait_idle().await;

    let active = h.supervisor.active_instances(&route).await.unwrap();
    assert_eq!(active.len(), 2);
    assert_eq!(sorted(h.supervisor.pool().instances().await), sorted(active));

    let routes = h.supervisor.routes().await;
    assert_eq!(routes.len(), 1);
}

#[tokio::test]
async fn test_later_deploy_cancels_earlier_one() {
    let h = harness(1).await;
    h.workers[0].set_build_delay(Duration::from_millis(300));
    let route = RouteName::new("alice", "iris");

    let earlier = tokio::spawn({
        let supervisor = h.supervisor.clone();
        let route = route.clone();
        async move { supervisor.deploy(&route, 1).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.supervisor.deploy(&route, 2).await.unwrap();
    let earlier = earlier.await.unwrap();
    assert!(matches!(earlier, Err(FleetError::DeploymentCancelled)));

    h.supervisor.wait_idle().await;
    let (status, body) = predict(&h.supervisor, &route).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 2);
}

#[tokio::test]
async fn test_build_slots_limit_concurrent_builds() {
    let h = harness(1).await;
    h.storage.set_replication(1);
    h.workers[0].set_build_delay(Duration::from_millis(100));

    let deploys = (0..6).map(|i| {
        let supervisor = h.supervisor.clone();
        async move {
            supervisor
                .deploy(&RouteName::new("alice", format!("model-{}", i)), 1)
                .await
        }
    });
    let results = futures::future::join_all(deploys).await;

    assert!(results.iter().all(Result::is_ok));
    assert!(h.storage.max_concurrent_builds() <= 4);
    assert!(h.workers[0].max_active_builds() <= 4);
    assert_eq!(h.supervisor.routes().await.len(), 6);
}

#[tokio::test]
async fn test_storage_failure_builds_nothing() {
    let h = harness(1).await;
    h.storage.set_fail_new_deployment(true);
    let route = RouteName::new("alice", "iris");

    let result = h.supervisor.deploy(&route, 1).await;

    assert!(matches!(result, Err(FleetError::Storage(_))));
    assert!(h.supervisor.pool().instances().await.is_empty());
    assert!(h.storage.statuses(&route).is_empty());
    assert!(!h.supervisor.is_building(&route).await);
}

#[tokio::test]
async fn test_unknown_version_builds_nothing() {
    let h = harness(1).await;
    let route = RouteName::new("alice", "unknown-model");

    let result = h.supervisor.deploy(&route, 9).await;

    assert!(matches!(result, Err(FleetError::Storage(_))));
    assert!(h.workers[0].instance_ids().is_empty());
}

#[tokio::test]
async fn test_build_failure_marks_failed() {
    let h = harness(1).await;
    h.workers[0].set_fail_builds(true);
    let route = RouteName::new("alice", "iris");

    let result = h.supervisor.deploy(&route, 1).await;

    assert!(matches!(result, Err(FleetError::Worker(_))));
    assert_eq!(h.storage.last_status(&route), Some(BuildStatus::Failed));
    assert!(h.supervisor.pool().instances().await.is_empty());
    assert!(!h.supervisor.is_building(&route).await);

    let (status, body) = predict(&h.supervisor, &route).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "model not found");
}

#[tokio::test]
async fn test_failed_redeploy_keeps_serving_previous() {
    let h = harness(1).await;
    let route = RouteName::new("alice", "iris");

    h.supervisor.deploy(&route, 1).await.unwrap();
    h.workers[0].set_fail_builds(true);
    assert!(h.supervisor.deploy(&route, 2).await.is_err());

    let (status, body) = predict(&h.supervisor, &route).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_predict_while_building() {
    let h = harness(1).await;
    h.workers[0].set_build_delay(Duration::from_millis(300));
    let route = RouteName::new("alice", "iris");

    let deploy = tokio::spawn({
        let supervisor = h.supervisor.clone();
        let route = route.clone();
        async move { supervisor.deploy(&route, 1).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, body) = predict(&h.supervisor, &route).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "model still building");

    deploy.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_sleep_then_predict() {
    let h = harness(1).await;
    let route = RouteName::new("alice", "iris");

    h.supervisor.deploy(&route, 1).await.unwrap();
    h.supervisor.sleep(&route).await.unwrap();
    h.supervisor.wait_idle().await;

    let (status, body) = predict(&h.supervisor, &route).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "model is asleep");
    assert_eq!(h.storage.last_status(&route), Some(BuildStatus::Asleep));
    assert!(h.workers[0].instance_ids().is_empty());
}

#[tokio::test]
async fn test_sleep_wake_serves_fresh_instances() {
    let h = harness(1).await;
    let route = RouteName::new("alice", "iris");
    h.storage.set_latest(&route, 3);

    h.supervisor.deploy(&route, 3).await.unwrap();
    let before = h.supervisor.active_instances(&route).await.unwrap();

    h.supervisor.sleep(&route).await.unwrap();
    h.supervisor.wake(&route).await.unwrap();

    let after = h.supervisor.active_instances(&route).await.unwrap();
    assert_eq!(after.len(), 2);
    assert!(after.iter().all(|id| !before.contains(id)));
    assert!(!h.supervisor.is_asleep(&route).await);

    let (status, body) = predict(&h.supervisor, &route).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 3);
}

#[tokio::test]
async fn test_sleep_cancels_inflight_build() {
    let h = harness(1).await;
    h.workers[0].set_build_delay(Duration::from_secs(5));
    let route = RouteName::new("alice", "iris");

    let deploy = tokio::spawn({
        let supervisor = h.supervisor.clone();
        let route = route.clone();
        async move { supervisor.deploy(&route, 1).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.supervisor.sleep(&route).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), deploy)
        .await
        .expect("Deploy did not stop after sleep")
        .unwrap();
    assert!(matches!(result, Err(FleetError::DeploymentCancelled)));

    h.supervisor.wait_idle().await;
    assert!(h.supervisor.pool().instances().await.is_empty());
    assert!(h.supervisor.is_asleep(&route).await);
    assert_eq!(h.storage.last_status(&route), Some(BuildStatus::Asleep));
}

#[tokio::test]
async fn test_sleep_while_going_online_stays_asleep() {
    let h = harness(1).await;
    h.storage.set_online_delay(Duration::from_millis(300));
    let route = RouteName::new("alice", "iris");

    let deploy = tokio::spawn({
        let supervisor = h.supervisor.clone();
        let route = route.clone();
        async move { supervisor.deploy(&route, 1).await }
    });
    while h.supervisor.active_instances(&route).await.is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    h.supervisor.sleep(&route).await.unwrap();
    deploy.await.unwrap().unwrap();
    h.supervisor.wait_idle().await;

    assert!(h.supervisor.is_asleep(&route).await);
    assert_eq!(h.storage.last_status(&route), Some(BuildStatus::Asleep));
    assert!(h.storage.records().iter().all(|r| r.asleep));
    assert!(h.supervisor.pool().instances().await.is_empty());
}

#[tokio::test]
async fn test_delete_user_removes_only_their_routes() {
    let h = harness(2).await;
    let alice_a = RouteName::new("alice", "a");
    let alice_b = RouteName::new("alice", "b");
    let bob = RouteName::new("bob", "c");

    for route in [&alice_a, &alice_b, &bob] {
        h.supervisor.deploy(route, 1).await.unwrap();
    }
    h.supervisor.sleep(&RouteName::new("alice", "d")).await.unwrap();

    h.supervisor.delete_user("alice", true).await;

    let routes = h.supervisor.routes().await;
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].user, "bob");

    let remaining = h.supervisor.active_instances(&bob).await.unwrap();
    assert_eq!(sorted(h.supervisor.pool().instances().await), sorted(remaining));
}

#[tokio::test]
async fn test_lost_instances_are_pruned() {
    let h = harness(1).await;
    let route = RouteName::new("alice", "iris");

    h.supervisor.deploy(&route, 1).await.unwrap();
    for id in h.supervisor.active_instances(&route).await.unwrap() {
        h.workers[0].crash_instance(id);
    }

    let degraded = h.supervisor.monitor_routes().await;
    assert_eq!(degraded, vec![(route.clone(), 2)]);
    assert!(h.supervisor.pool().instances().await.is_empty());

    let (status, body) = predict(&h.supervisor, &route).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "no instances of model found");
}

#[tokio::test]
async fn test_unreachable_instance_is_bad_gateway() {
    let h = harness(1).await;
    h.storage.set_replication(1);
    let route = RouteName::new("alice", "iris");

    h.supervisor.deploy(&route, 1).await.unwrap();
    for id in h.supervisor.active_instances(&route).await.unwrap() {
        h.workers[0].crash_instance(id);
    }

    let (status, body) = predict(&h.supervisor, &route).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_remove_instance_twice() {
    let h = harness(1).await;
    let route = RouteName::new("alice", "iris");

    h.supervisor.deploy(&route, 1).await.unwrap();
    let id = h.supervisor.active_instances(&route).await.unwrap()[0];

    h.supervisor.pool().remove_instance(id).await.unwrap();
    assert!(matches!(
        h.supervisor.pool().remove_instance(id).await,
        Err(FleetError::NoSuchInstance(_))
    ));
}

// =============================================================================
// Logs
// =============================================================================

#[tokio::test]
async fn test_logs_filed_by_deployment() {
    let h = harness(1).await;
    let route = RouteName::new("alice", "iris");

    let first_id = h.storage.next_deploy_id();
    h.supervisor.deploy(&route, 1).await.unwrap();
    let first_instances = h.supervisor.active_instances(&route).await.unwrap();
    assert_eq!(h.supervisor.write_logs().await.unwrap(), 2);

    let second_id = h.storage.next_deploy_id();
    h.supervisor.deploy(&route, 2).await.unwrap();
    assert_eq!(h.supervisor.write_logs().await.unwrap(), 2);

    let first = h
        .supervisor
        .read_deployment_logs(&route, first_id)
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|line| line.deployment_id == first_id));
    assert!(
        first
            .iter()
            .all(|line| first_instances.contains(&line.instance_id))
    );

    let second = h
        .supervisor
        .read_deployment_logs(&route, second_id)
        .await
        .unwrap();
    assert_eq!(second.len(), 2);

    let all = h.supervisor.read_model_logs(&route).await.unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all[0].deployment_id, first_id);
    assert_eq!(all[3].deployment_id, second_id);
}

#[tokio::test]
async fn test_log_flush_forgets_retired_instances() {
    let h = harness(1).await;
    let route = RouteName::new("alice", "iris");

    for version in 1..=5 {
        h.supervisor.deploy(&route, version).await.unwrap();
    }
    h.supervisor.wait_idle().await;
    h.supervisor.write_logs().await.unwrap();
    assert_eq!(h.supervisor.tracked_instances().await, 2);

    let deploy_id = h.storage.next_deploy_id();
    h.supervisor.deploy(&route, 6).await.unwrap();
    h.supervisor.wait_idle().await;
    assert_eq!(h.supervisor.write_logs().await.unwrap(), 2);
    let lines = h
        .supervisor
        .read_deployment_logs(&route, deploy_id)
        .await
        .unwrap();
    assert_eq!(lines.len(), 2);

    h.supervisor.delete(&route).await;
    h.supervisor.wait_idle().await;
    h.supervisor.write_logs().await.unwrap();
    assert_eq!(h.supervisor.tracked_instances().await, 0);
}

#[tokio::test]
async fn test_log_flush_keeps_building_instances() {
    let h = harness(1).await;
    h.workers[0].set_build_delay(Duration::from_millis(300));
    let route = RouteName::new("alice", "iris");

    let deploy = tokio::spawn({
        let supervisor = h.supervisor.clone();
        let route = route.clone();
        async move { supervisor.deploy(&route, 1).await }
    });
    while !h.supervisor.is_building(&route).await {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    h.supervisor.write_logs().await.unwrap();
    assert_eq!(h.supervisor.tracked_instances().await, 2);

    deploy.await.unwrap().unwrap();
    assert_eq!(h.supervisor.write_logs().await.unwrap(), 2);
}

#[tokio::test]
async fn test_logs_of_unknown_route_are_empty() {
    let h = harness(1).await;

    let lines = h
        .supervisor
        .read_model_logs(&RouteName::new("nobody", "nothing"))
        .await
        .unwrap();

    assert!(lines.is_empty());
}

// =============================================================================
// Reconciliation
// =============================================================================

fn record(user: &str, model: &str, version: u32, instance_ids: Vec<i64>) -> DeploymentRecord {
    DeploymentRecord {
        user: user.to_string(),
        model: model.to_string(),
        version,
        last_deploy_id: 10,
        asleep: false,
        instance_ids,
    }
}

fn ready(ids: &[i64], ready: bool) -> Vec<InstanceStatus> {
    ids.iter().map(|&id| InstanceStatus { id, ready }).collect()
}

#[tokio::test]
async fn test_reconcile_adopts_and_cleans_up() {
    let connector = Arc::new(MockConnector::new());
    let worker = connector.register("http://worker-1");
    worker.seed_instances(&ready(&[101, 102, 103], true));
    worker.seed_instances(&ready(&[104], false));

    let mut sleeping = record("bob", "churn", 1, Vec::new());
    sleeping.asleep = true;
    let records = vec![
        record("alice", "iris", 1, vec![101, 102]),
        sleeping,
        record("carol", "fraud", 2, vec![150, 151]),
    ];

    let storage = Arc::new(MemoryStorage::new());
    let (supervisor, _dir) = start(connector, storage.clone(), 1, records)
        .await
        .unwrap();

    let alice = RouteName::new("alice", "iris");
    assert_eq!(
        sorted(supervisor.active_instances(&alice).await.unwrap()),
        vec![101, 102]
    );
    assert!(supervisor.is_asleep(&RouteName::new("bob", "churn")).await);

    let destroyed = worker.destroyed();
    assert!(destroyed.contains(&103));
    assert!(destroyed.contains(&104));
    assert!(worker.has_instance(101));

    supervisor.wait_idle().await;
    let carol = RouteName::new("carol", "fraud");
    let rebuilt = supervisor.active_instances(&carol).await.unwrap();
    assert_eq!(rebuilt.len(), 2);
    let records = storage.records();
    let fraud = records.iter().find(|r| r.model == "fraud").unwrap();
    assert_eq!(fraud.version, 2);
    assert_eq!(sorted(fraud.instance_ids.clone()), sorted(rebuilt));
}

#[tokio::test]
async fn test_reconcile_skips_duplicate_route() {
    let connector = Arc::new(MockConnector::new());
    let worker = connector.register("http://worker-1");
    worker.seed_instances(&ready(&[101, 102], true));

    let records = vec![
        record("alice", "iris", 1, vec![101]),
        record("alice", "iris", 1, vec![102]),
    ];

    let (supervisor, _dir) = start(connector, Arc::new(MemoryStorage::new()), 1, records)
        .await
        .unwrap();

    let alice = RouteName::new("alice", "iris");
    assert_eq!(supervisor.active_instances(&alice).await.unwrap(), vec![101]);
    assert!(worker.has_instance(101));
    assert!(worker.destroyed().contains(&102));
    assert_eq!(supervisor.pool().instances().await, vec![101]);
}

#[tokio::test]
async fn test_reconcile_skips_record_with_missing_version() {
    let connector = Arc::new(MockConnector::new());
    let worker = connector.register("http://worker-1");
    worker.seed_instances(&ready(&[101, 102], true));

    let records = vec![
        record("alice", "unknown-model", 1, vec![101]),
        record("bob", "churn", 1, vec![102]),
    ];

    let (supervisor, _dir) = start(connector, Arc::new(MemoryStorage::new()), 1, records)
        .await
        .unwrap();

    let stale = RouteName::new("alice", "unknown-model");
    assert!(supervisor.active_instances(&stale).await.is_none());
    assert!(worker.destroyed().contains(&101));
    assert!(!worker.has_instance(101));

    let bob = RouteName::new("bob", "churn");
    assert_eq!(supervisor.active_instances(&bob).await.unwrap(), vec![102]);
}

#[tokio::test]
async fn test_unreachable_worker_fails_startup() {
    let connector = Arc::new(MockConnector::new());

    let result = start(connector, Arc::new(MemoryStorage::new()), 1, Vec::new()).await;

    assert!(matches!(result, Err(FleetError::Worker(_))));
}

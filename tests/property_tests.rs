//! Property-based tests using proptest
//!
//! These tests verify invariants across randomized inputs, helping catch
//! edge cases that might be missed by example-based testing.

use fleet_manager::config::{AuthConfig, ManagerConfig, UserCredentials};
use fleet_manager::logs::LogStore;
use fleet_manager::testing::MockConnector;
use fleet_manager::types::{RouteName, WorkerRecord};
use fleet_manager::WorkerPool;
use proptest::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Runtime;

// =============================================================================
// Arbitrary Implementations
// =============================================================================

fn arb_worker_records() -> impl Strategy<Value = Vec<WorkerRecord>> {
    prop::collection::btree_map(1i64..1000, "[a-z][a-z0-9-]{0,20}:[0-9]{2,5}", 0..5).prop_map(
        |workers| {
            workers
                .into_iter()
                .map(|(id, url)| WorkerRecord { id, url })
                .collect()
        },
    )
}

fn arb_auth_config() -> impl Strategy<Value = AuthConfig> {
    prop::collection::btree_map(
        "[a-z][a-z0-9]{0,15}",
        ("[A-Za-z0-9]{8,32}", prop::option::of("[A-Za-z0-9]{8,32}")),
        0..4,
    )
    .prop_map(|users| AuthConfig {
        users: users
            .into_iter()
            .map(|(user, (apikey, read_only_key))| UserCredentials {
                user,
                apikey,
                read_only_key,
            })
            .collect(),
        shared: Vec::new(),
    })
}

/// Generate ManagerConfig values for round-trip testing
fn arb_manager_config() -> impl Strategy<Value = ManagerConfig> {
    (
        1024u16..60000, // api_port
        1usize..16,     // build_slots
        1u64..3600,     // worker_ping_interval_secs
        1u64..3600,     // monitor_interval_secs
        any::<bool>(),  // auto_redeploy
        arb_worker_records(),
        arb_auth_config(),
    )
        .prop_map(
            |(
                api_port,
                build_slots,
                worker_ping_interval_secs,
                monitor_interval_secs,
                auto_redeploy,
                workers,
                auth,
            )| {
                ManagerConfig {
                    api_port,
                    build_slots,
                    worker_ping_interval_secs,
                    monitor_interval_secs,
                    auto_redeploy,
                    workers,
                    auth,
                    ..Default::default()
                }
            },
        )
}

// =============================================================================
// Config Serialization Round-Trip Tests
// =============================================================================

proptest! {
    /// ManagerConfig serializes to TOML and deserializes back
    #[test]
    fn manager_config_roundtrip(config in arb_manager_config()) {
        let toml_str = toml::to_string(&config).expect("Failed to serialize to TOML");
        let parsed: ManagerConfig = toml::from_str(&toml_str).expect("Failed to parse TOML");

        prop_assert_eq!(config.api_port, parsed.api_port);
        prop_assert_eq!(config.build_slots, parsed.build_slots);
        prop_assert_eq!(config.worker_ping_interval_secs, parsed.worker_ping_interval_secs);
        prop_assert_eq!(config.monitor_interval_secs, parsed.monitor_interval_secs);
        prop_assert_eq!(config.auto_redeploy, parsed.auto_redeploy);
        prop_assert_eq!(&config.log_dir, &parsed.log_dir);
        prop_assert_eq!(&config.workers, &parsed.workers);
        prop_assert_eq!(&config.auth, &parsed.auth);
    }

    /// Generated configs with unique ids and keys pass validation
    #[test]
    fn generated_config_validates(config in arb_manager_config()) {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let config = ManagerConfig {
            log_dir: temp_dir.path().join("logs"),
            catalog_file: temp_dir.path().join("catalog.toml"),
            ..config
        };
        prop_assert!(config.validate().is_ok());
    }
}

// =============================================================================
// Pool Placement Invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Reservations spread so no worker carries more than one instance above another
    #[test]
    fn queue_build_balances_load(workers in 1i64..6, instances in 0i64..40) {
        let rt = Runtime::new().expect("Failed to create runtime");
        let loads = rt.block_on(async {
            let connector = Arc::new(MockConnector::new());
            for id in 0..workers {
                connector.register(&format!("http://worker-{}", id));
            }
            let pool = WorkerPool::new(connector);
            for id in 0..workers {
                pool.add(&format!("http://worker-{}", id), id).await.expect("Failed to add worker");
            }
            for instance_id in 0..instances {
                pool.queue_build(instance_id).await.expect("Failed to queue build");
            }

            let mut loads = Vec::new();
            for id in pool.workers().await {
                loads.push(pool.load(id).await.expect("Worker vanished"));
            }
            loads
        });

        let max = loads.iter().copied().max().unwrap_or(0);
        let min = loads.iter().copied().min().unwrap_or(0);
        prop_assert!(max - min <= 1);
        prop_assert_eq!(loads.iter().sum::<usize>(), instances as usize);
    }

    /// Ties between equally loaded workers go to the lowest id
    #[test]
    fn queue_build_prefers_lowest_id(workers in 1i64..6) {
        let rt = Runtime::new().expect("Failed to create runtime");
        let chosen = rt.block_on(async {
            let connector = Arc::new(MockConnector::new());
            let pool = WorkerPool::new(connector.clone());
            for id in (0..workers).rev() {
                connector.register(&format!("http://worker-{}", id));
                pool.add(&format!("http://worker-{}", id), id).await.expect("Failed to add worker");
            }
            pool.queue_build(1).await.expect("Failed to queue build")
        });

        prop_assert_eq!(chosen, 0);
    }
}

// =============================================================================
// Log File Invariants
// =============================================================================

proptest! {
    /// Route names never escape the log directory
    #[test]
    fn log_path_stays_in_dir(user in "\\PC{0,20}", model in "\\PC{0,20}") {
        let store = LogStore::new("/var/log/fleet");
        let path = store.log_path(&RouteName::new(user, model));

        prop_assert_eq!(path.parent(), Some(Path::new("/var/log/fleet")));
        prop_assert_eq!(path.extension().and_then(|e| e.to_str()), Some("jsonl"));
    }

    /// Distinct safe names map to distinct files
    #[test]
    fn log_path_distinguishes_models(
        user in "[a-z0-9]{1,10}",
        a in "[a-z0-9-]{1,10}",
        b in "[a-z0-9-]{1,10}"
    ) {
        prop_assume!(a != b);
        let store = LogStore::new("/logs");
        prop_assert_ne!(
            store.log_path(&RouteName::new(user.clone(), a)),
            store.log_path(&RouteName::new(user, b))
        );
    }
}

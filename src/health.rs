//! Periodic worker and deployment health checks

use crate::supervisor::Supervisor;
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior, interval, sleep};

/// Health monitor with configurable checks and auto-redeploy
pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    worker_ping_interval: Duration,
    monitor_interval: Duration,
    initial_delay: Duration,
    log_flush_interval: Duration,
    auto_redeploy: bool,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(
        supervisor: Arc<Supervisor>,
        worker_ping_interval_secs: u64,
        monitor_interval_secs: u64,
        initial_delay_secs: u64,
        log_flush_interval_secs: u64,
        auto_redeploy: bool,
    ) -> Self {
        Self {
            supervisor,
            worker_ping_interval: Duration::from_secs(worker_ping_interval_secs),
            monitor_interval: Duration::from_secs(monitor_interval_secs),
            initial_delay: Duration::from_secs(initial_delay_secs),
            log_flush_interval: Duration::from_secs(log_flush_interval_secs),
            auto_redeploy,
        }
    }

    /// Start every monitoring loop. Never returns.
    pub async fn run(self: Arc<Self>) {
        tokio::join!(
            self.clone().run_worker_checks(),
            self.clone().run_route_checks(),
            self.clone().run_log_flush(),
        );
    }

    async fn run_worker_checks(self: Arc<Self>) {
        let mut ticker = interval(self.worker_ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.worker_ping_interval.as_secs(),
            "Worker monitoring started"
        );

        loop {
            ticker.tick().await;
            self.check_workers().await;
        }
    }

    async fn run_route_checks(self: Arc<Self>) {
        // Wait initial delay before first check (gives startup redeploys time to build)
        tracing::info!(
            delay_secs = self.initial_delay.as_secs(),
            "Waiting before starting deployment checks"
        );
        sleep(self.initial_delay).await;

        let mut ticker = interval(self.monitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.monitor_interval.as_secs(),
            auto_redeploy = self.auto_redeploy,
            "Deployment monitoring started"
        );

        loop {
            ticker.tick().await;
            self.check_routes().await;
        }
    }

    async fn run_log_flush(self: Arc<Self>) {
        let mut ticker = interval(self.log_flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.supervisor.write_logs().await {
                tracing::error!(error = %e, "Failed to write model logs");
            }
        }
    }

    /// Ping every worker once, removing the ones that do not answer.
    /// Returns the number of workers removed.
    pub async fn check_workers(&self) -> usize {
        let mut removed = 0;
        for worker_id in self.supervisor.pool().workers().await {
            if !self.supervisor.monitor_worker(worker_id).await {
                removed += 1;
            }
        }
        removed
    }

    /// Heartbeat every serving instance once and, with auto-redeploy on,
    /// restart routes that lost instances. Returns the degraded route count.
    pub async fn check_routes(&self) -> usize {
        let degraded = self.supervisor.monitor_routes().await;

        for (route, missing) in &degraded {
            if !self.auto_redeploy {
                continue;
            }
            tracing::warn!(
                route = %route,
                missing,
                "Instances lost, redeploying route"
            );
            self.supervisor.restart_in_background(route.clone());
        }

        degraded.len()
    }
}

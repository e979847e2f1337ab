//! Configuration structures and loading logic

use crate::types::WorkerRecord;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Main manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub api_port: u16,
    /// Directory holding one JSON Lines log file per route
    pub log_dir: PathBuf,
    /// Model catalog read at startup and updated as deployments progress
    pub catalog_file: PathBuf,
    /// Deployments allowed to build at once, across all routes
    pub build_slots: usize,
    pub worker_ping_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub monitor_initial_delay_secs: u64,
    pub log_flush_interval_secs: u64,
    /// Restart routes whose instances fail their heartbeat
    pub auto_redeploy: bool,
    /// Upper bound on any call to a worker, builds included
    pub worker_request_timeout_secs: u64,
    pub workers: Vec<WorkerRecord>,
    pub auth: AuthConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            log_dir: default_log_dir(),
            catalog_file: default_catalog_file(),
            build_slots: crate::supervisor::DEFAULT_BUILD_SLOTS,
            worker_ping_interval_secs: default_interval(),
            monitor_interval_secs: default_interval(),
            monitor_initial_delay_secs: default_monitor_initial_delay(),
            log_flush_interval_secs: default_log_flush_interval(),
            auto_redeploy: true,
            worker_request_timeout_secs: default_worker_request_timeout(),
            workers: Vec::new(),
            auth: AuthConfig::default(),
            tls: None,
        }
    }
}

/// Credentials accepted on the prediction route
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    pub users: Vec<UserCredentials>,
    pub shared: Vec<SharedModel>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UserCredentials {
    pub user: String,
    pub apikey: String,
    /// Key that may only call the user's own models
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_key: Option<String>,
}

/// A model its owner has opened to another user
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SharedModel {
    pub owner: String,
    pub model: String,
    pub user: String,
}

/// TLS material for serving the API over HTTPS
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("FLEET_MANAGER_API_PORT") {
            config.api_port = port
                .parse()
                .context("Invalid FLEET_MANAGER_API_PORT value")?;
        }
        if let Ok(log_dir) = std::env::var("FLEET_MANAGER_LOG_DIR") {
            config.log_dir = PathBuf::from(log_dir);
        }
        if let Ok(catalog_file) = std::env::var("FLEET_MANAGER_CATALOG_FILE") {
            config.catalog_file = PathBuf::from(catalog_file);
        }
        if let Ok(slots) = std::env::var("FLEET_MANAGER_BUILD_SLOTS") {
            config.build_slots = slots
                .parse()
                .context("Invalid FLEET_MANAGER_BUILD_SLOTS value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.build_slots == 0 {
            anyhow::bail!("build_slots must be at least 1");
        }
        for (name, value) in [
            ("worker_ping_interval_secs", self.worker_ping_interval_secs),
            ("monitor_interval_secs", self.monitor_interval_secs),
            ("log_flush_interval_secs", self.log_flush_interval_secs),
            ("worker_request_timeout_secs", self.worker_request_timeout_secs),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        let mut ids = HashSet::new();
        for worker in &self.workers {
            if worker.url.trim().is_empty() {
                anyhow::bail!("Worker {} has an empty url", worker.id);
            }
            if !ids.insert(worker.id) {
                anyhow::bail!("Duplicate worker id: {}", worker.id);
            }
        }

        let mut users = HashSet::new();
        for creds in &self.auth.users {
            if creds.user.is_empty() || creds.apikey.is_empty() {
                anyhow::bail!("Auth entries need both a user and an apikey");
            }
            if !users.insert(&creds.user) {
                anyhow::bail!("Duplicate auth entry for user: {}", creds.user);
            }
        }

        if let Some(tls) = &self.tls {
            for path in [&tls.cert_path, &tls.key_path] {
                if !path.exists() {
                    anyhow::bail!("TLS file not found: {:?}", path);
                }
            }
        }

        std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Cannot create log directory: {:?}", self.log_dir))?;
        if let Some(parent) = self.catalog_file.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create catalog directory: {:?}", parent))?;
        }

        Ok(())
    }
}

// Default functions
fn default_api_port() -> u16 {
    9000
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/data/fleet-manager/logs")
}
fn default_catalog_file() -> PathBuf {
    PathBuf::from("/data/fleet-manager/catalog.toml")
}
fn default_interval() -> u64 {
    30
}
fn default_monitor_initial_delay() -> u64 {
    60
}
fn default_log_flush_interval() -> u64 {
    10
}
fn default_worker_request_timeout() -> u64 {
    600
}

//! Model log files: one JSON Lines file per route

use crate::error::FleetResult;
use crate::types::{DeployId, LogLine, RouteName};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only log files under a directory.
///
/// Reads and writes are serialized so a reader never sees a half-written batch.
pub struct LogStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl LogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding every log line of a route
    pub fn log_path(&self, route: &RouteName) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.jsonl",
            sanitize(&route.user),
            sanitize(&route.model)
        ))
    }

    /// Append lines to their routes' files, keeping the given order per route
    pub async fn append(&self, lines: Vec<LogLine>) -> FleetResult<()> {
        if lines.is_empty() {
            return Ok(());
        }

        let mut by_route: BTreeMap<RouteName, Vec<u8>> = BTreeMap::new();
        for line in &lines {
            let buf = by_route
                .entry(RouteName::new(line.user.clone(), line.model.clone()))
                .or_default();
            serde_json::to_writer(&mut *buf, line)?;
            buf.push(b'\n');
        }

        let _guard = self.lock.lock().await;
        fs::create_dir_all(&self.dir).await?;
        for (route, buf) in by_route {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.log_path(&route))
                .await?;
            file.write_all(&buf).await?;
            file.flush().await?;
        }

        tracing::debug!(lines = lines.len(), "Log lines written");
        Ok(())
    }

    /// Lines of one deployment of a route, in append order
    pub async fn read_deployment_logs(
        &self,
        route: &RouteName,
        deploy_id: DeployId,
    ) -> FleetResult<Vec<LogLine>> {
        let mut lines = self.read_model_logs(route).await?;
        lines.retain(|line| line.deployment_id == deploy_id);
        Ok(lines)
    }

    /// Every line of a route, in append order. A route without logs yields
    /// an empty list.
    pub async fn read_model_logs(&self, route: &RouteName) -> FleetResult<Vec<LogLine>> {
        let path = self.log_path(route);
        let content = {
            let _guard = self.lock.lock().await;
            match fs::read(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            }
        };

        let mut lines = Vec::new();
        for line in serde_json::Deserializer::from_slice(&content).into_iter::<LogLine>() {
            match line {
                Ok(line) => lines.push(line),
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "Skipping unreadable log file tail");
                    break;
                }
            }
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn line(user: &str, model: &str, deployment_id: DeployId, data: &str) -> LogLine {
        LogLine {
            instance_id: deployment_id * 10,
            user: user.to_string(),
            model: model.to_string(),
            timestamp: chrono::Utc::now(),
            data: data.to_string(),
            deployment_id,
        }
    }

    #[tokio::test]
    async fn test_append_and_filter_by_deployment() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path());
        let route = RouteName::new("bigdatabob", "hellopy");

        store
            .append(vec![
                line("bigdatabob", "hellopy", 1, "first"),
                line("bigdatabob", "hellopy", 2, "second"),
                line("alice", "iris", 1, "other route"),
            ])
            .await
            .unwrap();
        store
            .append(vec![line("bigdatabob", "hellopy", 1, "third")])
            .await
            .unwrap();

        let data: Vec<_> = store
            .read_deployment_logs(&route, 1)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.data)
            .collect();
        assert_eq!(data, vec!["first", "third"]);

        assert_eq!(store.read_model_logs(&route).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path().join("not-yet-created"));

        let lines = store
            .read_model_logs(&RouteName::new("nobody", "nothing"))
            .await
            .unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn test_log_path_stays_in_directory() {
        let store = LogStore::new("/var/log/fleet");
        let path = store.log_path(&RouteName::new("../etc", "pass/wd"));
        assert_eq!(path, PathBuf::from("/var/log/fleet/.._etc_pass_wd.jsonl"));
    }
}

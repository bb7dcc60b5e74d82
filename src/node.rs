use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::stats::Stats;
use crate::utils::retry_with_backoff;

const STATS_RETRY_ATTEMPTS: u32 = 10;
const STATS_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
const STATS_RETRY_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        source: reqwest::Error,
    },
    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: u16 },
}

/// Manager-side descriptor of a worker: its endpoint plus the most recently
/// observed resource picture. Memory and disk figures are bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Canonical identity, the worker's `host:port`.
    pub name: String,
    /// Base URL of the worker's API.
    pub api: String,
    pub role: String,
    pub memory_total: u64,
    pub memory_allocated: u64,
    pub disk_total: u64,
    pub disk_allocated: u64,
    pub cpu_cores: u64,
    pub task_count: usize,
    /// Latest snapshot pulled from the worker, if any.
    pub stats: Option<Stats>,
}

impl Node {
    pub fn new(name: &str, api: &str, role: &str) -> Self {
        Node {
            name: name.to_string(),
            api: api.to_string(),
            role: role.to_string(),
            memory_total: 0,
            memory_allocated: 0,
            disk_total: 0,
            disk_allocated: 0,
            cpu_cores: 0,
            task_count: 0,
            stats: None,
        }
    }

    /// Disk not yet promised to any task.
    pub fn disk_free(&self) -> u64 {
        self.disk_total.saturating_sub(self.disk_allocated)
    }

    /// Pulls a fresh snapshot from the worker's stats endpoint and folds the
    /// totals into this descriptor.
    pub async fn refresh_stats(&mut self, client: &reqwest::Client) -> Result<(), NodeError> {
        let url = format!("{}/stats", self.api);

        let response = retry_with_backoff(
            STATS_RETRY_ATTEMPTS,
            STATS_RETRY_BASE_DELAY,
            STATS_RETRY_DEADLINE,
            || {
                let client = client.clone();
                let url = url.clone();
                async move { client.get(&url).send().await }
            },
        )
        .await
        .map_err(|source| NodeError::Request {
            url: url.clone(),
            source,
        })?;

        if !response.status().is_success() {
            return Err(NodeError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        let stats: Stats = response.json().await.map_err(|source| NodeError::Request {
            url: url.clone(),
            source,
        })?;

        self.memory_total = stats.mem_stats.mem_total;
        self.disk_total = stats.disk_stats.total;
        self.task_count = stats.task_count;
        self.stats = Some(stats);
        debug!(node = %self.name, "refreshed node stats");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::DiskStats;

    #[test]
    fn new_node_starts_unobserved() {
        let node = Node::new("127.0.0.1:5556", "http://127.0.0.1:5556", "worker");
        assert_eq!(node.name, "127.0.0.1:5556");
        assert_eq!(node.api, "http://127.0.0.1:5556");
        assert_eq!(node.role, "worker");
        assert!(node.stats.is_none());
        assert_eq!(node.task_count, 0);
    }

    #[test]
    fn disk_free_subtracts_allocation() {
        let mut node = Node::new("w1", "http://w1", "worker");
        node.disk_total = 100;
        node.disk_allocated = 30;
        assert_eq!(node.disk_free(), 70);

        node.disk_allocated = 200;
        assert_eq!(node.disk_free(), 0);
    }

    #[tokio::test]
    async fn refresh_stats_folds_snapshot_into_descriptor() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/stats",
            axum::routing::get(|| async {
                axum::Json(Stats {
                    mem_stats: crate::stats::MemInfo {
                        mem_total: 2048,
                        mem_available: 1024,
                    },
                    disk_stats: DiskStats {
                        total: 4096,
                        used: 1000,
                        free: 3096,
                    },
                    task_count: 2,
                    ..Stats::default()
                })
            }),
        );
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let mut node = Node::new(
            &addr.to_string(),
            &format!("http://{addr}"),
            "worker",
        );
        let client = reqwest::Client::new();
        node.refresh_stats(&client).await.unwrap();

        assert_eq!(node.memory_total, 2048);
        assert_eq!(node.disk_total, 4096);
        assert_eq!(node.task_count, 2);
        assert_eq!(node.stats.unwrap().mem_used(), 1024);
    }
}

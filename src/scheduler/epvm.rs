use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{lowest_scoring_node, Scheduler};
use crate::node::{Node, NodeError};
use crate::stats::CpuStat;
use crate::task::Task;

/// Lieb's square-ice constant, used as the base of the convex cost curve.
const LIEB_SQUARE_ICE: f64 = 1.53960071783900203869;
const MAX_JOBS: f64 = 4.0;
const CPU_SAMPLE_GAP: Duration = Duration::from_secs(3);

/// Marginal-cost strategy: a node's score is the increase in an
/// exponential cost function that placing the task there would cause, so
/// load spreads towards the nodes it hurts least.
pub struct Epvm {
    client: reqwest::Client,
}

impl Epvm {
    pub fn new() -> Self {
        Epvm {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for Epvm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for Epvm {
    fn select_candidate_nodes(&self, task: &Task, nodes: &[Node]) -> Vec<Node> {
        nodes
            .iter()
            .filter(|node| task.disk <= node.disk_free())
            .cloned()
            .collect()
    }

    async fn score(&mut self, task: &Task, nodes: &mut [Node]) -> HashMap<String, f64> {
        let mut scores = HashMap::new();

        for node in nodes.iter_mut() {
            let cpu_usage = match calculate_cpu_usage(node, &self.client).await {
                Ok(usage) => usage,
                Err(err) => {
                    warn!(node = %node.name, error = %err, "failed to sample cpu usage");
                    continue;
                }
            };

            match marginal_cost(task, node, cpu_usage) {
                Some(cost) => {
                    scores.insert(node.name.clone(), cost);
                }
                None => {
                    warn!(node = %node.name, "node has no usable stats, skipping");
                }
            }
        }

        scores
    }

    fn pick(&self, scores: &HashMap<String, f64>, candidates: &[Node]) -> Option<Node> {
        lowest_scoring_node(scores, candidates)
    }
}

/// Samples the node's stats twice, [`CPU_SAMPLE_GAP`] apart, and derives
/// cpu usage from the jiffy deltas.
async fn calculate_cpu_usage(
    node: &mut Node,
    client: &reqwest::Client,
) -> Result<f64, NodeError> {
    node.refresh_stats(client).await?;
    let first = node
        .stats
        .as_ref()
        .map(|stats| stats.cpu_stats.clone())
        .unwrap_or_default();

    tokio::time::sleep(CPU_SAMPLE_GAP).await;

    node.refresh_stats(client).await?;
    let second = node
        .stats
        .as_ref()
        .map(|stats| stats.cpu_stats.clone())
        .unwrap_or_default();

    Ok(cpu_usage_between(&first, &second))
}

fn cpu_usage_between(prev: &CpuStat, cur: &CpuStat) -> f64 {
    let prev_idle = prev.user + prev.iowait;
    let cur_idle = cur.user + cur.iowait;

    let prev_busy = prev.user + prev.nice + prev.system + prev.irq + prev.softirq + prev.steal;
    let cur_busy = cur.user + cur.nice + cur.system + cur.irq + cur.softirq + cur.steal;

    let total_delta = (cur_idle + cur_busy) as f64 - (prev_idle + prev_busy) as f64;
    let idle_delta = cur_idle as f64 - prev_idle as f64;

    if total_delta == 0.0 && idle_delta == 0.0 {
        return 0.0;
    }
    (total_delta - idle_delta) / total_delta
}

/// The cost increase of placing `task` on `node`, or `None` when the node
/// has no stats snapshot or reports zero total memory.
fn marginal_cost(task: &Task, node: &Node, cpu_usage: f64) -> Option<f64> {
    let stats = node.stats.as_ref()?;
    if node.memory_total == 0 {
        return None;
    }

    let cpu_load = cpu_usage / 2f64.powf(0.8);

    let mem_allocated = stats.mem_used() as f64 + node.memory_allocated as f64;
    let mem_pct = mem_allocated / node.memory_total as f64;
    let new_mem_pct = mem_allocated * (task.memory / 1000) as f64 / node.memory_total as f64;

    let task_count = node.task_count as f64;

    let mem_cost = phi(new_mem_pct) + phi((task_count + 1.0) / MAX_JOBS)
        - phi(mem_pct)
        - phi(task_count / MAX_JOBS);
    let cpu_cost = phi(cpu_load) + phi((task_count + 1.0) / MAX_JOBS)
        - phi(cpu_load)
        - phi(task_count / MAX_JOBS);

    Some(mem_cost + cpu_cost)
}

fn phi(x: f64) -> f64 {
    LIEB_SQUARE_ICE.powf(x)
}

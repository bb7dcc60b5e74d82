use std::collections::HashMap;

use async_trait::async_trait;

use super::{lowest_scoring_node, Scheduler};
use crate::node::Node;
use crate::task::Task;

/// Hands tasks to workers in rotation, one worker per dispatch, wrapping
/// back to the first once every worker has had a turn.
#[derive(Debug, Default)]
pub struct RoundRobin {
    last_worker: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        RoundRobin { last_worker: 0 }
    }
}

#[async_trait]
impl Scheduler for RoundRobin {
    fn select_candidate_nodes(&self, _task: &Task, nodes: &[Node]) -> Vec<Node> {
        nodes.to_vec()
    }

    async fn score(&mut self, _task: &Task, nodes: &mut [Node]) -> HashMap<String, f64> {
        let mut scores = HashMap::new();

        let next_worker = if self.last_worker + 1 < nodes.len() {
            self.last_worker += 1;
            self.last_worker
        } else {
            self.last_worker = 0;
            0
        };

        for (i, node) in nodes.iter().enumerate() {
            let score = if i == next_worker { 0.1 } else { 1.0 };
            scores.insert(node.name.clone(), score);
        }

        scores
    }

    fn pick(&self, scores: &HashMap<String, f64>, candidates: &[Node]) -> Option<Node> {
        lowest_scoring_node(scores, candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(count: usize) -> Vec<Node> {
        (0..count)
            .map(|i| Node::new(&format!("worker-{i}"), &format!("http://worker-{i}"), "worker"))
            .collect()
    }

    #[tokio::test]
    async fn candidates_pass_through_unfiltered() {
        let scheduler = RoundRobin::new();
        let all = nodes(3);
        let candidates = scheduler.select_candidate_nodes(&Task::default(), &all);
        assert_eq!(candidates, all);
    }

    #[tokio::test]
    async fn cycles_through_every_node() {
        let mut scheduler = RoundRobin::new();
        let mut all = nodes(3);
        let task = Task::default();

        let mut picked = Vec::new();
        for _ in 0..3 {
            let scores = scheduler.score(&task, &mut all).await;
            picked.push(scheduler.pick(&scores, &all).unwrap().name);
        }

        assert_eq!(picked, vec!["worker-1", "worker-2", "worker-0"]);
    }

    #[tokio::test]
    async fn six_tasks_over_three_nodes_land_two_each() {
        let mut scheduler = RoundRobin::new();
        let mut all = nodes(3);
        let task = Task::default();

        let mut assignments: HashMap<String, usize> = HashMap::new();
        for _ in 0..6 {
            let scores = scheduler.score(&task, &mut all).await;
            let node = scheduler.pick(&scores, &all).unwrap();
            *assignments.entry(node.name).or_default() += 1;
        }

        assert_eq!(assignments.len(), 3);
        assert!(assignments.values().all(|&count| count == 2));
    }

    #[tokio::test]
    async fn single_node_always_wins() {
        let mut scheduler = RoundRobin::new();
        let mut all = nodes(1);
        let task = Task::default();

        for _ in 0..3 {
            let scores = scheduler.score(&task, &mut all).await;
            assert_eq!(scheduler.pick(&scores, &all).unwrap().name, "worker-0");
        }
    }

    #[tokio::test]
    async fn empty_node_list_scores_nothing() {
        let mut scheduler = RoundRobin::new();
        let scores = scheduler.score(&Task::default(), &mut []).await;
        assert!(scores.is_empty());
        assert!(scheduler.pick(&scores, &[]).is_none());
    }
}

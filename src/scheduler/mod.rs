mod epvm;
mod round_robin;

use std::collections::HashMap;

use async_trait::async_trait;

pub use epvm::Epvm;
pub use round_robin::RoundRobin;

use crate::node::Node;
use crate::task::Task;

/// Placement strategy. Each dispatch runs the pipeline in order: filter the
/// nodes down to viable candidates, score them (lower is better), then pick
/// the winner.
#[async_trait]
pub trait Scheduler: Send {
    /// Hard constraints. At minimum a candidate must have enough
    /// unallocated disk for the task.
    fn select_candidate_nodes(&self, task: &Task, nodes: &[Node]) -> Vec<Node>;

    /// Score each candidate by name; lower is better. Strategies that need
    /// live worker measurements may take their time here.
    async fn score(&mut self, task: &Task, nodes: &mut [Node]) -> HashMap<String, f64>;

    /// The lowest-scoring candidate; ties go to the first seen. Candidates
    /// without a score are not eligible.
    fn pick(&self, scores: &HashMap<String, f64>, candidates: &[Node]) -> Option<Node>;
}

/// The closed set of available strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    RoundRobin,
    Epvm,
}

pub fn new_scheduler(kind: SchedulerKind) -> Box<dyn Scheduler> {
    match kind {
        SchedulerKind::RoundRobin => Box::new(RoundRobin::new()),
        SchedulerKind::Epvm => Box::new(Epvm::new()),
    }
}

/// Shared pick implementation: minimum score wins, first-seen order breaks
/// ties.
pub(crate) fn lowest_scoring_node(
    scores: &HashMap<String, f64>,
    candidates: &[Node],
) -> Option<Node> {
    let mut best: Option<(&Node, f64)> = None;
    for node in candidates {
        let Some(score) = scores.get(&node.name).copied() else {
            continue;
        };
        match best {
            Some((_, lowest)) if score >= lowest => {}
            _ => best = Some((node, score)),
        }
    }
    best.map(|(node, _)| node.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> Node {
        Node::new(name, &format!("http://{name}"), "worker")
    }

    #[test]
    fn pick_prefers_the_lowest_score() {
        let candidates = vec![node("a"), node("b"), node("c")];
        let scores = HashMap::from([
            ("a".to_string(), 1.0),
            ("b".to_string(), 0.1),
            ("c".to_string(), 0.5),
        ]);

        let picked = lowest_scoring_node(&scores, &candidates).unwrap();
        assert_eq!(picked.name, "b");
    }

    #[test]
    fn pick_breaks_ties_by_candidate_order() {
        let candidates = vec![node("a"), node("b")];
        let scores = HashMap::from([("a".to_string(), 0.3), ("b".to_string(), 0.3)]);

        let picked = lowest_scoring_node(&scores, &candidates).unwrap();
        assert_eq!(picked.name, "a");
    }

    #[test]
    fn pick_skips_unscored_candidates() {
        let candidates = vec![node("a"), node("b")];
        let scores = HashMap::from([("b".to_string(), 2.0)]);

        let picked = lowest_scoring_node(&scores, &candidates).unwrap();
        assert_eq!(picked.name, "b");
    }

    #[test]
    fn pick_of_nothing_is_none() {
        assert!(lowest_scoring_node(&HashMap::new(), &[]).is_none());
        assert!(lowest_scoring_node(&HashMap::new(), &[node("a")]).is_none());
    }
}

//! Planner abstraction — turns one free-text task into a `Dag`-ready node list.
//!
//! Mirrors [`crate::scheduler::Runner`]'s shape: a narrow async trait the orchestrator
//! consumes, with a deterministic mock implementation for tests and default CLI wiring.

use async_trait::async_trait;

use crate::dag::PlannedNode;
use crate::error::{ApexError, Result};

/// Decomposes a task description into a dependency-ordered node list.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, task: &str) -> Result<Vec<PlannedNode>>;
}

/// Single-node planner for tests and for running the pipeline without a real
/// decomposition subprocess: the whole task becomes one node with no dependencies.
#[derive(Debug, Default, Clone)]
pub struct MockPlanner;

#[async_trait]
impl Planner for MockPlanner {
    async fn plan(&self, task: &str) -> Result<Vec<PlannedNode>> {
        if task.trim().is_empty() {
            return Err(ApexError::InvalidPlan {
                reason: "task text is empty".to_string(),
            });
        }
        Ok(vec![PlannedNode {
            id: "root".to_string(),
            task: task.to_string(),
            depends: Vec::new(),
        }])
    }
}

/// Fixed-plan planner for tests that need a specific multi-node shape without writing
/// a planner implementation inline.
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    nodes: Vec<PlannedNode>,
}

impl StaticPlanner {
    pub fn new(nodes: Vec<PlannedNode>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, _task: &str) -> Result<Vec<PlannedNode>> {
        Ok(self.nodes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_planner_produces_single_root_node() {
        let plan = MockPlanner.plan("build a thing").await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].id, "root");
        assert!(plan[0].depends.is_empty());
    }

    #[tokio::test]
    async fn mock_planner_rejects_empty_task() {
        let err = MockPlanner.plan("   ").await.unwrap_err();
        assert!(matches!(err, ApexError::InvalidPlan { .. }));
    }

    #[tokio::test]
    async fn static_planner_replays_fixed_nodes() {
        let nodes = vec![PlannedNode {
            id: "a".to_string(),
            task: "t".to_string(),
            depends: vec![],
        }];
        let planner = StaticPlanner::new(nodes.clone());
        let plan = planner.plan("ignored").await.unwrap();
        assert_eq!(plan.len(), nodes.len());
    }
}

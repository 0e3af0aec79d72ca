//! DAG node/graph model
//!
//! Performance notes carried over from the reference design this is adapted from:
//! - `Arc<str>` for zero-cost cloning of node ids
//! - `FxHashMap`/`FxHashSet` for faster (non-cryptographic) hashing
//! - `SmallVec` for stack-allocated dependency lists (most nodes have 0-4 deps)

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::ApexError;

/// Stack-allocated dependency list: most nodes have 0-4 dependencies.
pub type DepVec = SmallVec<[Arc<str>; 4]>;

/// One node as returned by the planner, before it is admitted into a `Dag`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedNode {
    pub id: String,
    pub task: String,
    #[serde(default)]
    pub depends: Vec<String>,
}

/// Terminal/non-terminal status of one DAG node.
///
/// ```text
/// Pending ──dispatch──► Running ──ok────► Completed
///                           └──err──► Failed
/// Pending ──dep-failed──► Skipped
/// Pending ──cancel──► Skipped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// One atomic sub-task in a run.
///
/// Owned exclusively by the `Dag`; the scheduler holds borrowed references while
/// dispatching, and a node's assigned worker is the only writer of its mutable fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Arc<str>,
    pub task: String,
    pub depends: DepVec,
    pub status: NodeStatus,
    pub error: Option<String>,
    pub output: Option<String>,
}

impl Node {
    fn pending(id: Arc<str>, task: String, depends: DepVec) -> Self {
        Self {
            id,
            task,
            depends,
            status: NodeStatus::Pending,
            error: None,
            output: None,
        }
    }
}

/// Directed acyclic graph of `Node`s for one run.
///
/// Structurally immutable after [`Dag::new`] validates it; `nodes` entries are mutated
/// in place by the scheduler as the run progresses.
pub struct Dag {
    nodes: FxHashMap<Arc<str>, Node>,
    /// Insertion order, preserved for the scheduler's deterministic tie-break (SPEC_FULL §4.1).
    order: Vec<Arc<str>>,
    /// node_id -> nodes that depend on it (for skip propagation and readiness checks).
    successors: FxHashMap<Arc<str>, DepVec>,
}

impl Dag {
    /// Validate a planned node list and build a `Dag`.
    ///
    /// Rejects cycles, unknown dependencies, duplicate ids, and empty input.
    pub fn new(planned: Vec<PlannedNode>) -> Result<Self, ApexError> {
        if planned.is_empty() {
            return Err(ApexError::EmptyDag);
        }

        let mut nodes: FxHashMap<Arc<str>, Node> =
            FxHashMap::with_capacity_and_hasher(planned.len(), Default::default());
        let mut order = Vec::with_capacity(planned.len());
        let mut seen: FxHashSet<Arc<str>> = FxHashSet::default();

        for p in &planned {
            let id: Arc<str> = Arc::from(p.id.as_str());
            if !seen.insert(Arc::clone(&id)) {
                return Err(ApexError::DuplicateNodeId {
                    node_id: p.id.clone(),
                });
            }
            order.push(Arc::clone(&id));
        }

        for p in planned {
            let id: Arc<str> = Arc::from(p.id.as_str());
            let mut depends: DepVec = SmallVec::new();
            for dep in &p.depends {
                if !seen.contains(dep.as_str()) {
                    return Err(ApexError::UnknownDependency {
                        node_id: p.id.clone(),
                        dep_id: dep.clone(),
                    });
                }
                depends.push(Arc::from(dep.as_str()));
            }
            nodes.insert(Arc::clone(&id), Node::pending(id, p.task, depends));
        }

        let mut successors: FxHashMap<Arc<str>, DepVec> =
            FxHashMap::with_capacity_and_hasher(nodes.len(), Default::default());
        for id in &order {
            successors.entry(Arc::clone(id)).or_default();
        }
        for node in nodes.values() {
            for dep in &node.depends {
                successors.entry(Arc::clone(dep)).or_default().push(Arc::clone(&node.id));
            }
        }

        let dag = Self {
            nodes,
            order,
            successors,
        };
        dag.detect_cycles()?;
        Ok(dag)
    }

    /// Three-color DFS cycle detection, run once at construction time.
    fn detect_cycles(&self) -> Result<(), ApexError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: FxHashMap<Arc<str>, Color> =
            self.order.iter().map(|id| (Arc::clone(id), Color::White)).collect();
        let mut stack: Vec<Arc<str>> = Vec::new();

        fn dfs(
            node: Arc<str>,
            nodes: &FxHashMap<Arc<str>, Node>,
            colors: &mut FxHashMap<Arc<str>, Color>,
            stack: &mut Vec<Arc<str>>,
        ) -> Result<(), String> {
            colors.insert(Arc::clone(&node), Color::Gray);
            stack.push(Arc::clone(&node));

            if let Some(n) = nodes.get(&node) {
                for dep in &n.depends {
                    match colors.get(dep) {
                        Some(Color::Gray) => {
                            let cycle_start =
                                stack.iter().position(|x| x.as_ref() == dep.as_ref()).unwrap_or(0);
                            let cycle: Vec<&str> =
                                stack[cycle_start..].iter().map(|s| s.as_ref()).collect();
                            return Err(format!("{} → {}", cycle.join(" → "), dep));
                        }
                        Some(Color::White) | None => {
                            dfs(Arc::clone(dep), nodes, colors, stack)?;
                        }
                        Some(Color::Black) => {}
                    }
                }
            }

            stack.pop();
            colors.insert(node, Color::Black);
            Ok(())
        }

        for id in &self.order {
            if colors.get(id) == Some(&Color::White) {
                if let Err(cycle) = dfs(Arc::clone(id), &self.nodes, &mut colors, &mut stack) {
                    return Err(ApexError::CycleDetected { cycle });
                }
            }
        }

        Ok(())
    }

    /// Nodes in original planner order (the scheduler's dispatch tie-break).
    pub fn order(&self) -> &[Arc<str>] {
        &self.order
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(move |id| self.nodes.get(id.as_ref()))
    }

    /// Nodes whose dependencies are all `Completed` and which are themselves still `Pending`,
    /// in original planner order.
    pub fn ready_nodes(&self) -> Vec<Arc<str>> {
        self.order
            .iter()
            .filter(|id| {
                let node = &self.nodes[id.as_ref()];
                node.status == NodeStatus::Pending
                    && node
                        .depends
                        .iter()
                        .all(|dep| self.nodes.get(dep.as_ref()).map(|d| d.status == NodeStatus::Completed).unwrap_or(false))
            })
            .cloned()
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(|n| n.status.is_terminal())
    }

    /// Mark every node transitively depending on `failed_id` (directly or indirectly) as
    /// `Skipped`, unless it is already terminal. Never touches Running nodes.
    pub fn propagate_skip(&mut self, failed_id: &str) {
        let mut queue: Vec<Arc<str>> = self
            .successors
            .get(failed_id)
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(id) = queue.pop() {
            let should_skip = matches!(
                self.nodes.get(id.as_ref()).map(|n| n.status),
                Some(NodeStatus::Pending)
            );
            if should_skip {
                if let Some(n) = self.nodes.get_mut(id.as_ref()) {
                    n.status = NodeStatus::Skipped;
                }
                if let Some(next) = self.successors.get(id.as_ref()) {
                    queue.extend(next.iter().cloned());
                }
            }
        }
    }

    /// Mark every still-`Pending` node as `Skipped` (used on cancellation).
    pub fn skip_all_pending(&mut self) {
        for node in self.nodes.values_mut() {
            if node.status == NodeStatus::Pending {
                node.status = NodeStatus::Skipped;
            }
        }
    }

    pub fn counts(&self) -> NodeCounts {
        let mut counts = NodeCounts::default();
        for n in self.nodes.values() {
            match n.status {
                NodeStatus::Pending => counts.pending += 1,
                NodeStatus::Running => counts.running += 1,
                NodeStatus::Completed => counts.completed += 1,
                NodeStatus::Failed => counts.failed += 1,
                NodeStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NodeCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

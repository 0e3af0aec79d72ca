//! DAG module — node/dependency model and validation
//!
//! Contains the DAG representation used by the scheduler (§4.1 of SPEC_FULL.md):
//! - `model`: `Node`, `NodeStatus`, `Dag` (adjacency, cycle detection, skip propagation)
//!
//! The DAG is immutable in structure after construction; only node status/output/error
//! fields are mutated, and only by the worker assigned to that node.

mod model;

pub use model::{Dag, DepVec, Node, NodeStatus, PlannedNode};

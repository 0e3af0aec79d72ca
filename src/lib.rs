//! apex-core - execution core of a local autonomous-agent runtime
//!
//! ## Module Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         PLANNING                              │
//! │  planner/   task -> DAG (Planner, MockPlanner, StaticPlanner) │
//! │  risk/      textual risk classification + fail-closed gate    │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         EXECUTION                              │
//! │  dag/       dependency graph (Dag, PlannedNode, NodeStatus)   │
//! │  scheduler/ bounded worker pool dispatch (Scheduler, Runner)  │
//! │  sandbox/   subprocess isolation levels                       │
//! │  locks/     two-level advisory file locking                   │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       DURABILITY                               │
//! │  outbox/    WAL + single-writer queue, crash-safe actions     │
//! │  audit/     hash-chained tamper-evident audit log             │
//! │  manifest/  per-run manifest + pre-run git snapshot           │
//! │  killswitch/ filesystem-visible emergency stop                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`dag`] | Dependency graph with cycle/unknown-dep validation |
//! | [`scheduler`] | Bounded worker pool dispatch over a `Dag` |
//! | [`planner`] | Task -> plan abstraction |
//! | [`risk`] | Deterministic risk classification and the fail-closed gate |
//! | [`audit`] | Hash-chained, daily-anchored audit log |
//! | [`outbox`] | WAL + writer queue giving crash-safe action tracking |
//! | [`locks`] | Advisory file locking with global/workspace ordering |
//! | [`sandbox`] | Subprocess isolation wrapper (none/ulimit/docker) |
//! | [`killswitch`] | Filesystem-visible emergency stop |
//! | [`manifest`] | Per-run manifest and pre-run git snapshot |
//! | [`orchestrator`] | Wires the above into one end-to-end run |
//! | [`config`] | Runtime configuration, loaded from file + env |
//! | [`error`] | Error types with stable codes and fix suggestions |

pub mod audit;
pub mod config;
pub mod dag;
pub mod error;
pub mod killswitch;
pub mod locks;
pub mod manifest;
pub mod orchestrator;
pub mod outbox;
pub mod planner;
pub mod risk;
pub mod sandbox;
pub mod scheduler;

pub use audit::{AuditLogger, AuditRecord, VerifyReport};
pub use config::ApexConfig;
pub use dag::{Dag, NodeStatus, PlannedNode};
pub use error::{ApexError, Result};
pub use killswitch::KillSwitch;
pub use locks::{LockManager, LockOrder};
pub use manifest::RunManifest;
pub use orchestrator::{Orchestrator, RunResult};
pub use outbox::{Orphan, Outbox, Wal, WriterQueue};
pub use planner::{MockPlanner, Planner, StaticPlanner};
pub use risk::{classify, Approver, FailClosedGate, Policy, RiskAction, RiskLevel};
pub use sandbox::{SandboxLevel, SandboxWrapper};
pub use scheduler::{MockRunner, Outcome, OutboxRunner, ProcessRunner, Runner, Scheduler};

//! Scheduler — bounded worker pool dispatch over a `Dag` (SPEC_FULL.md §4.1)
//!
//! `Scheduler::execute` owns no long-lived state; it borrows a `Dag` mutably for the
//! duration of one run and returns the run's `Outcome` once every node is terminal.

mod runner;

pub use runner::{ExitOutcome, MockRunner, OutboxRunner, ProcessRunner, RunOutput, Runner};

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::dag::{Dag, NodeStatus};

/// Terminal classification of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every node Completed.
    Success,
    /// At least one node Completed, but at least one Failed or was Skipped.
    PartialFailure,
    /// No node Completed; every node Failed or Skipped, the scheduler itself did not fault.
    Failure,
    /// Cancelled by the kill switch or a caller-supplied token before completion.
    Killed,
}

struct WorkerResult {
    node_id: Arc<str>,
    output: RunOutput,
}

/// Runs a `Dag` to completion against a `Runner`, with a fixed-size worker pool.
pub struct Scheduler {
    workers: usize,
}

impl Scheduler {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Drive `dag` to completion, dispatching ready nodes to `runner` with at most
    /// `self.workers` running concurrently. Mutates node status/output/error in place.
    #[instrument(skip(self, dag, runner, cancel), fields(workers = self.workers))]
    pub async fn execute(
        &self,
        dag: &mut Dag,
        runner: Arc<dyn Runner>,
        cancel: CancellationToken,
    ) -> Outcome {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut inflight: JoinSet<WorkerResult> = JoinSet::new();
        let mut killed = false;

        loop {
            if cancel.is_cancelled() {
                killed = true;
                break;
            }

            for id in dag.ready_nodes() {
                if let Some(node) = dag.get_mut(&id) {
                    node.status = NodeStatus::Running;
                }
                let permit = Arc::clone(&semaphore);
                let runner = Arc::clone(&runner);
                let cancel = cancel.clone();
                let task = dag.get(&id).expect("just set to running").task.clone();
                let node_id = Arc::clone(&id);

                inflight.spawn(async move {
                    let _permit = permit.acquire_owned().await.expect("semaphore not closed");
                    let output = match runner.run(&task, cancel).await {
                        Ok(out) => out,
                        Err(e) => RunOutput {
                            stdout: String::new(),
                            status: ExitOutcome::Failure(e.to_string()),
                        },
                    };
                    WorkerResult { node_id, output }
                });
            }

            if inflight.is_empty() {
                if dag.all_terminal() {
                    break;
                }
                // Nothing ready and nothing inflight but the DAG is not all-terminal:
                // every remaining node has an unsatisfiable (failed/skipped) dependency.
                // propagate_skip already handles this as results land; this arm only
                // fires if ready_nodes() legitimately found nothing this tick while
                // something is still Pending, which means we must wait for inflight —
                // but inflight is empty, so skip the remainder defensively.
                dag.skip_all_pending();
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    killed = true;
                    break;
                }
                joined = inflight.join_next() => {
                    match joined {
                        Some(Ok(result)) => self.apply_result(dag, result),
                        Some(Err(join_err)) => {
                            warn!(error = %join_err, "scheduler worker task panicked");
                        }
                        None => {}
                    }
                }
            }
        }

        if killed {
            // Await already-dispatched workers so their Runner can observe cancellation
            // and we don't leave detached tasks mutating the Dag after we return.
            while let Some(joined) = inflight.join_next().await {
                if let Ok(result) = joined {
                    self.apply_result(dag, result);
                }
            }
            dag.skip_all_pending();
            info!(run = "killed", "scheduler cancelled");
            return Outcome::Killed;
        }

        let counts = dag.counts();
        info!(
            completed = counts.completed,
            failed = counts.failed,
            skipped = counts.skipped,
            "scheduler run finished"
        );
        if counts.failed == 0 && counts.skipped == 0 {
            Outcome::Success
        } else if counts.completed > 0 {
            Outcome::PartialFailure
        } else {
            Outcome::Failure
        }
    }

    fn apply_result(&self, dag: &mut Dag, result: WorkerResult) {
        let WorkerResult { node_id, output } = result;
        match output.status {
            ExitOutcome::Success => {
                if let Some(node) = dag.get_mut(&node_id) {
                    node.status = NodeStatus::Completed;
                    node.output = Some(output.stdout);
                }
            }
            ExitOutcome::Failure(reason) => {
                if let Some(node) = dag.get_mut(&node_id) {
                    node.status = NodeStatus::Failed;
                    node.error = Some(reason);
                }
                dag.propagate_skip(&node_id);
            }
            ExitOutcome::Cancelled => {
                if let Some(node) = dag.get_mut(&node_id) {
                    node.status = NodeStatus::Failed;
                    node.error = Some("cancelled".to_string());
                }
                dag.propagate_skip(&node_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::PlannedNode;

    fn planned(id: &str, task: &str, depends: &[&str]) -> PlannedNode {
        PlannedNode {
            id: id.to_string(),
            task: task.to_string(),
            depends: depends.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn linear_dag_completes_successfully() {
        let mut dag = Dag::new(vec![
            planned("a", "do a", &[]),
            planned("b", "do b", &["a"]),
            planned("c", "do c", &["b"]),
        ])
        .unwrap();

        let scheduler = Scheduler::new(2);
        let outcome = scheduler
            .execute(&mut dag, Arc::new(MockRunner), CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(dag.counts().completed, 3);
    }

    #[tokio::test]
    async fn failure_propagates_skip_to_dependents() {
        let mut dag = Dag::new(vec![
            planned("a", "please fail", &[]),
            planned("b", "do b", &["a"]),
            planned("c", "do c", &[]),
        ])
        .unwrap();

        let scheduler = Scheduler::new(4);
        let outcome = scheduler
            .execute(&mut dag, Arc::new(MockRunner), CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::PartialFailure);
        assert_eq!(dag.get("a").unwrap().status, NodeStatus::Failed);
        assert_eq!(dag.get("b").unwrap().status, NodeStatus::Skipped);
        assert_eq!(dag.get("c").unwrap().status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn all_nodes_failing_yields_failure_outcome() {
        let mut dag = Dag::new(vec![planned("a", "please fail", &[])]).unwrap();
        let scheduler = Scheduler::new(1);
        let outcome = scheduler
            .execute(&mut dag, Arc::new(MockRunner), CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::Failure);
    }

    #[tokio::test]
    async fn cancellation_before_dispatch_kills_run_and_skips_pending() {
        let mut dag = Dag::new(vec![
            planned("a", "do a", &[]),
            planned("b", "do b", &["a"]),
        ])
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let scheduler = Scheduler::new(2);
        let outcome = scheduler.execute(&mut dag, Arc::new(MockRunner), cancel).await;

        assert_eq!(outcome, Outcome::Killed);
        assert_eq!(dag.get("a").unwrap().status, NodeStatus::Skipped);
        assert_eq!(dag.get("b").unwrap().status, NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn independent_nodes_dispatch_in_original_order() {
        // Determinism property (SPEC_FULL §4.1): with workers=1, nodes become ready at
        // the same tick and must run in original planner order.
        let mut dag = Dag::new(vec![
            planned("z", "do z", &[]),
            planned("a", "do a", &[]),
            planned("m", "do m", &[]),
        ])
        .unwrap();

        assert_eq!(
            dag.ready_nodes(),
            vec![Arc::from("z"), Arc::from("a"), Arc::from("m")]
        );

        let scheduler = Scheduler::new(1);
        let outcome = scheduler
            .execute(&mut dag, Arc::new(MockRunner), CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::Success);
    }
}

//! Runner abstraction — the external collaborator that executes one sub-task.
//!
//! This is the narrow interface the core consumes from the subprocess-based
//! code-generation tool being orchestrated (SPEC_FULL.md §6). Implementations are
//! plain structs satisfying the trait; no inheritance is needed.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ApexError;

/// How a Runner's subprocess terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Failure(String),
    Cancelled,
}

/// Output of one Runner invocation.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub status: ExitOutcome,
}

impl RunOutput {
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExitOutcome::Success)
    }
}

/// Executes one sub-task and returns its stdout+status.
///
/// Cancellation of `cancel` must terminate the external process; a Runner that
/// ignores cancellation will stall the whole DAG's shutdown.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, task: &str, cancel: CancellationToken) -> Result<RunOutput, ApexError>;
}

/// Deterministic in-process Runner for tests and for running the pipeline without a
/// real code-generation subprocess.
///
/// Mirrors the reference design's `MockProvider`: it never touches the network or the
/// filesystem and always succeeds unless its task text contains the substring `"fail"`.
#[derive(Debug, Default, Clone)]
pub struct MockRunner;

#[async_trait]
impl Runner for MockRunner {
    async fn run(&self, task: &str, cancel: CancellationToken) -> Result<RunOutput, ApexError> {
        if cancel.is_cancelled() {
            return Ok(RunOutput {
                stdout: String::new(),
                status: ExitOutcome::Cancelled,
            });
        }
        if task.to_ascii_lowercase().contains("fail") {
            return Ok(RunOutput {
                stdout: String::new(),
                status: ExitOutcome::Failure(format!("mock failure for task: {task}")),
            });
        }
        Ok(RunOutput {
            stdout: format!("ok: {task}"),
            status: ExitOutcome::Success,
        })
    }
}

/// Runs a real subprocess, shaping the command through a [`crate::sandbox::SandboxWrapper`]
/// before spawning it with `tokio::process::Command`.
pub struct ProcessRunner {
    binary: String,
    base_args: Vec<String>,
    sandbox: std::sync::Arc<dyn crate::sandbox::SandboxWrapper>,
}

impl ProcessRunner {
    pub fn new(
        binary: impl Into<String>,
        base_args: Vec<String>,
        sandbox: std::sync::Arc<dyn crate::sandbox::SandboxWrapper>,
    ) -> Self {
        Self {
            binary: binary.into(),
            base_args,
            sandbox,
        }
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(&self, task: &str, cancel: CancellationToken) -> Result<RunOutput, ApexError> {
        use std::process::Stdio;
        use tokio::io::AsyncReadExt;

        let mut args = self.base_args.clone();
        args.push(task.to_string());
        let (binary, args) = self.sandbox.wrap(&self.binary, &args);

        let mut cmd = tokio::process::Command::new(&binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| ApexError::SpawnFailed {
            reason: e.to_string(),
        })?;

        let mut stdout = child.stdout.take().expect("piped stdout");

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                Ok(RunOutput { stdout: String::new(), status: ExitOutcome::Cancelled })
            }
            status = child.wait() => {
                let status = status.map_err(|e| ApexError::SpawnFailed { reason: e.to_string() })?;
                let mut out = String::new();
                let _ = stdout.read_to_string(&mut out).await;
                if status.success() {
                    Ok(RunOutput { stdout: out, status: ExitOutcome::Success })
                } else {
                    Ok(RunOutput {
                        stdout: out,
                        status: ExitOutcome::Failure(format!("exit status: {status}")),
                    })
                }
            }
        }
    }
}

/// Wraps any `Runner` so each invocation is tracked as one action under the outbox's
/// 7-step WAL+DB protocol (SPEC_FULL.md §4.3): every node execution becomes crash-safe.
///
/// The inner Runner's success/failure/cancellation status, not just a thrown error,
/// decides the action's terminal WAL/DB state — a `RunOutput` carrying
/// `ExitOutcome::Failure` is recorded as a `Failed` action even though `inner.run`
/// itself returned `Ok`.
pub struct OutboxRunner {
    inner: std::sync::Arc<dyn Runner>,
    outbox: std::sync::Arc<crate::outbox::Outbox>,
    trace_id: String,
}

impl OutboxRunner {
    pub fn new(
        inner: std::sync::Arc<dyn Runner>,
        outbox: std::sync::Arc<crate::outbox::Outbox>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            outbox,
            trace_id: trace_id.into(),
        }
    }
}

#[async_trait]
impl Runner for OutboxRunner {
    async fn run(&self, task: &str, cancel: CancellationToken) -> Result<RunOutput, ApexError> {
        let action_id = uuid::Uuid::new_v4().to_string();
        let started = crate::outbox::WalEntry::started(&action_id, &self.trace_id, task);
        self.outbox.wal().append(&started)?;
        self.outbox
            .queue()
            .insert_started(&action_id, &self.trace_id, task)
            .await?;

        let output = self.inner.run(task, cancel).await?;

        match &output.status {
            ExitOutcome::Success => {
                self.outbox
                    .queue()
                    .mark_completed(&action_id, Some(&output.stdout))
                    .await?;
                self.outbox.wal().append(&started.terminal(
                    crate::outbox::WalStatus::Completed,
                    Some(output.stdout.clone()),
                    None,
                ))?;
            }
            ExitOutcome::Failure(reason) => {
                self.outbox.queue().mark_failed(&action_id, reason).await?;
                self.outbox.wal().append(&started.terminal(
                    crate::outbox::WalStatus::Failed,
                    None,
                    Some(reason.clone()),
                ))?;
            }
            ExitOutcome::Cancelled => {
                self.outbox
                    .queue()
                    .mark_failed(&action_id, "cancelled")
                    .await?;
                self.outbox.wal().append(&started.terminal(
                    crate::outbox::WalStatus::Failed,
                    None,
                    Some("cancelled".to_string()),
                ))?;
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::killswitch::KillSwitch;
    use crate::outbox::{db, Outbox, Wal, WriterQueue};

    async fn setup_outbox() -> (std::sync::Arc<Outbox>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::open_pool(&dir.path().join("runtime.db")).await.unwrap();
        db::run_migrations(&pool, &dir.path().join("runtime.db")).await.unwrap();
        let kill_switch = std::sync::Arc::new(KillSwitch::new(dir.path().join("KILL")));
        let queue = WriterQueue::spawn(pool, 16, kill_switch);
        let wal = Wal::open(dir.path().join("actions_wal.jsonl")).unwrap();
        (std::sync::Arc::new(Outbox::new(wal, queue)), dir)
    }

    #[tokio::test]
    async fn outbox_runner_records_completed_action_for_successful_task() {
        let (outbox, _dir) = setup_outbox().await;
        let runner = OutboxRunner::new(std::sync::Arc::new(MockRunner), outbox.clone(), "trace-1");

        let out = runner.run("do the thing", CancellationToken::new()).await.unwrap();
        assert!(out.is_success());
        assert!(outbox.reconcile().unwrap().is_empty());

        let entries = outbox.wal().read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].status, crate::outbox::WalStatus::Completed);
    }

    #[tokio::test]
    async fn outbox_runner_records_failed_action_without_orphaning() {
        let (outbox, _dir) = setup_outbox().await;
        let runner = OutboxRunner::new(std::sync::Arc::new(MockRunner), outbox.clone(), "trace-1");

        let out = runner.run("please fail here", CancellationToken::new()).await.unwrap();
        assert!(!out.is_success());
        assert!(outbox.reconcile().unwrap().is_empty());

        let entries = outbox.wal().read_all().unwrap();
        assert_eq!(entries[1].status, crate::outbox::WalStatus::Failed);
    }

    #[tokio::test]
    async fn mock_runner_succeeds_by_default() {
        let runner = MockRunner;
        let out = runner.run("do the thing", CancellationToken::new()).await.unwrap();
        assert!(out.is_success());
    }

    #[tokio::test]
    async fn mock_runner_fails_on_keyword() {
        let runner = MockRunner;
        let out = runner.run("please fail here", CancellationToken::new()).await.unwrap();
        assert!(!out.is_success());
    }

    #[tokio::test]
    async fn mock_runner_respects_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let runner = MockRunner;
        let out = runner.run("anything", token).await.unwrap();
        assert_eq!(out.status, ExitOutcome::Cancelled);
    }
}

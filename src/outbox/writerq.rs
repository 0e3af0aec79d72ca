//! Single-writer queue: serialises all SQL writes through one worker task with
//! batched transactions, back-pressure, and panic recovery (SPEC_FULL.md §4.3).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use sqlx::sqlite::SqlitePool;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::{ApexError, Result};
use crate::killswitch::KillSwitch;

use super::db;

type Ack = oneshot::Sender<Result<()>>;

enum Op {
    Started {
        action_id: String,
        trace_id: String,
        task: String,
        ack: Ack,
    },
    Terminal {
        action_id: String,
        status: &'static str,
        result_ref: Option<String>,
        error: Option<String>,
        ack: Ack,
    },
    Close,
}

/// Handle submitters use; cloneable, cheap.
#[derive(Clone)]
pub struct WriterQueue {
    tx: mpsc::Sender<Op>,
    closed: Arc<std::sync::atomic::AtomicBool>,
    worker: Arc<AsyncMutex<Option<tokio::task::JoinHandle<()>>>>,
}

/// Batching and crash-recovery tunables, sourced from `ApexConfig::writer_queue`
/// (SPEC_FULL.md §4.3) rather than hardcoded, so operators can tune flush latency
/// vs. throughput and how many worker panics the queue tolerates before it gives up
/// and trips the kill switch.
pub struct WriterConfig {
    pub flush: Duration,
    pub max_batch: usize,
    pub max_crash_restarts: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush: Duration::from_millis(50),
            max_batch: 100,
            max_crash_restarts: 3,
        }
    }
}

impl WriterQueue {
    /// Spawns the worker task and returns a handle. `queue_size` bounds the submission
    /// channel (back-pressure); `kill_switch` is where a fatal crash marker is written.
    /// Uses the default batching/crash-recovery tunables — see [`WriterQueue::spawn_with_config`]
    /// to source them from `ApexConfig::writer_queue` instead.
    pub fn spawn(pool: SqlitePool, queue_size: usize, kill_switch: Arc<KillSwitch>) -> Self {
        Self::spawn_with_config(pool, queue_size, kill_switch, WriterConfig::default())
    }

    /// Like [`WriterQueue::spawn`] but with explicit batching/crash-recovery tunables.
    pub fn spawn_with_config(
        pool: SqlitePool,
        queue_size: usize,
        kill_switch: Arc<KillSwitch>,
        config: WriterConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let handle = tokio::spawn(run_worker(pool, rx, kill_switch, config));
        Self {
            tx,
            closed,
            worker: Arc::new(AsyncMutex::new(Some(handle))),
        }
    }

    async fn submit(&self, op_builder: impl FnOnce(Ack) -> Op) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ApexError::WriterClosed);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        let op = op_builder(ack_tx);
        self.tx.send(op).await.map_err(|_| ApexError::WriterClosed)?;
        ack_rx.await.map_err(|_| ApexError::WriterClosed)?
    }

    #[instrument(skip(self))]
    pub async fn insert_started(&self, action_id: &str, trace_id: &str, task: &str) -> Result<()> {
        let (action_id, trace_id, task) = (action_id.to_string(), trace_id.to_string(), task.to_string());
        self.submit(|ack| Op::Started {
            action_id,
            trace_id,
            task,
            ack,
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn mark_completed(&self, action_id: &str, result_ref: Option<&str>) -> Result<()> {
        let action_id = action_id.to_string();
        let result_ref = result_ref.map(String::from);
        self.submit(|ack| Op::Terminal {
            action_id,
            status: "completed",
            result_ref,
            error: None,
            ack,
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn mark_failed(&self, action_id: &str, error: &str) -> Result<()> {
        let action_id = action_id.to_string();
        let error = Some(error.to_string());
        self.submit(|ack| Op::Terminal {
            action_id,
            status: "failed",
            result_ref: None,
            error,
            ack,
        })
        .await
    }

    /// Signals stop, drains pending ops, commits a final batch, waits for the worker
    /// to exit. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(Op::Close).await;
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn run_worker(
    pool: SqlitePool,
    rx: mpsc::Receiver<Op>,
    kill_switch: Arc<KillSwitch>,
    config: WriterConfig,
) {
    let rx = Arc::new(AsyncMutex::new(rx));
    let crash_count = AtomicU32::new(0);

    loop {
        let rx = Arc::clone(&rx);
        let pool = pool.clone();
        let batch_future = AssertUnwindSafeFuture(batch_loop(pool, rx, config.flush, config.max_batch));

        match batch_future.catch_unwind().await {
            Ok(BatchOutcome::Stopped) => {
                info!("writer queue worker stopped cleanly");
                return;
            }
            Ok(BatchOutcome::ChannelClosed) => {
                info!("writer queue channel closed, worker exiting");
                return;
            }
            Err(panic) => {
                let restarts = crash_count.fetch_add(1, Ordering::SeqCst) + 1;
                let reason = panic_message(&panic);
                error!(restarts, reason = %reason, "writer queue worker panicked");

                if restarts >= config.max_crash_restarts {
                    error!("writer queue exceeded max crash restarts, activating kill switch");
                    let _ = kill_switch.activate(&format!(
                        "writer queue crashed {restarts} times: {reason}"
                    ));
                    return;
                }
                warn!(restarts, "restarting writer queue worker");
            }
        }
    }
}

enum BatchOutcome {
    Stopped,
    ChannelClosed,
}

async fn batch_loop(
    pool: SqlitePool,
    rx: Arc<AsyncMutex<mpsc::Receiver<Op>>>,
    flush: Duration,
    max_batch: usize,
) -> BatchOutcome {
    let mut rx = rx.lock().await;
    let mut interval = tokio::time::interval(flush);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let mut batch = Vec::with_capacity(max_batch);
        let mut stop = false;

        tokio::select! {
            _ = interval.tick() => {}
            maybe_op = rx.recv() => {
                match maybe_op {
                    Some(Op::Close) => stop = true,
                    Some(op) => batch.push(op),
                    None => return BatchOutcome::ChannelClosed,
                }
            }
        }

        while !stop && batch.len() < max_batch {
            match rx.try_recv() {
                Ok(Op::Close) => {
                    stop = true;
                    break;
                }
                Ok(op) => batch.push(op),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            commit_batch(&pool, batch).await;
        }

        if stop {
            return BatchOutcome::Stopped;
        }
    }
}

async fn commit_batch(pool: &SqlitePool, batch: Vec<Op>) {
    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            for op in batch {
                ack_all_with_error(op, &format!("failed to open transaction: {e}"));
            }
            return;
        }
    };

    let mut failed_at = None;
    for (idx, op) in batch.iter().enumerate() {
        if apply_op(&mut tx, op).await.is_err() {
            failed_at = Some(idx);
            break;
        }
    }

    if failed_at.is_none() {
        if let Err(e) = tx.commit().await {
            warn!(error = %e, "batch commit failed, replaying individually");
            replay_individually(pool, batch).await;
            return;
        }
        for op in batch {
            ack_ok(op);
        }
        return;
    }

    // One statement failed: roll back and replay the whole batch one-by-one so a
    // single bad op cannot block its independent siblings.
    let _ = tx.rollback().await;
    replay_individually(pool, batch).await;
}

async fn replay_individually(pool: &SqlitePool, batch: Vec<Op>) {
    for op in batch {
        let mut tx = match pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                ack_all_with_error(op, &format!("failed to open transaction: {e}"));
                continue;
            }
        };
        match apply_op(&mut tx, &op).await {
            Ok(()) => match tx.commit().await {
                Ok(()) => ack_ok(op),
                Err(e) => ack_all_with_error(op, &e.to_string()),
            },
            Err(e) => {
                let _ = tx.rollback().await;
                ack_all_with_error(op, &e.to_string());
            }
        }
    }
}

async fn apply_op(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, op: &Op) -> std::result::Result<(), sqlx::Error> {
    match op {
        Op::Started {
            action_id,
            trace_id,
            task,
            ..
        } => db::insert_started(tx, action_id, trace_id, task, Utc::now()).await,
        Op::Terminal {
            action_id,
            status,
            result_ref,
            error,
            ..
        } => {
            db::mark_terminal(
                tx,
                action_id,
                status,
                Utc::now(),
                result_ref.as_deref(),
                error.as_deref(),
            )
            .await
        }
        Op::Close => Ok(()),
    }
}

fn ack_ok(op: Op) {
    let ack = match op {
        Op::Started { ack, .. } => ack,
        Op::Terminal { ack, .. } => ack,
        Op::Close => return,
    };
    let _ = ack.send(Ok(()));
}

fn ack_all_with_error(op: Op, reason: &str) {
    let ack = match op {
        Op::Started { ack, .. } => ack,
        Op::Terminal { ack, .. } => ack,
        Op::Close => return,
    };
    let _ = ack.send(Err(ApexError::Database {
        reason: reason.to_string(),
    }));
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Wraps a future so `catch_unwind` can poll it even though it is not `UnwindSafe` —
/// we never touch shared state after a panic without re-fetching it from the pool/rx,
/// so this is safe in practice (the pattern this worker is grounded on).
struct AssertUnwindSafeFuture<F>(F);

impl<F: std::future::Future> std::future::Future for AssertUnwindSafeFuture<F> {
    type Output = F::Output;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.0) };
        std::panic::AssertUnwindSafe(inner).poll(cx)
    }
}

impl<F> std::panic::UnwindSafe for AssertUnwindSafeFuture<F> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::db::{open_pool, run_migrations};

    async fn setup() -> (SqlitePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("runtime.db");
        let pool = open_pool(&db_path).await.unwrap();
        run_migrations(&pool, &db_path).await.unwrap();
        (pool, dir)
    }

    #[tokio::test]
    async fn insert_then_complete_round_trips() {
        let (pool, dir) = setup().await;
        let kill_switch = Arc::new(KillSwitch::new(dir.path().join("KILL")));
        let queue = WriterQueue::spawn(pool.clone(), 16, kill_switch);

        queue.insert_started("a1", "t1", "do it").await.unwrap();
        queue.mark_completed("a1", Some("ref-1")).await.unwrap();
        queue.close().await;

        let row = db::fetch_action(&pool, "a1").await.unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.result_ref.as_deref(), Some("ref-1"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (pool, dir) = setup().await;
        let kill_switch = Arc::new(KillSwitch::new(dir.path().join("KILL")));
        let queue = WriterQueue::spawn(pool, 16, kill_switch);
        queue.close().await;
        queue.close().await;
    }

    #[tokio::test]
    async fn submit_after_close_fails() {
        let (pool, dir) = setup().await;
        let kill_switch = Arc::new(KillSwitch::new(dir.path().join("KILL")));
        let queue = WriterQueue::spawn(pool, 16, kill_switch);
        queue.close().await;
        let err = queue.insert_started("a2", "t2", "do it").await.unwrap_err();
        assert!(matches!(err, ApexError::WriterClosed));
    }

    #[tokio::test]
    async fn spawn_with_config_honours_custom_max_batch() {
        let (pool, dir) = setup().await;
        let kill_switch = Arc::new(KillSwitch::new(dir.path().join("KILL")));
        let queue = WriterQueue::spawn_with_config(
            pool.clone(),
            16,
            kill_switch,
            WriterConfig {
                flush: Duration::from_millis(5),
                max_batch: 1,
                max_crash_restarts: 1,
            },
        );

        queue.insert_started("a9", "t9", "do it").await.unwrap();
        queue.mark_completed("a9", None).await.unwrap();
        queue.close().await;

        let row = db::fetch_action(&pool, "a9").await.unwrap().unwrap();
        assert_eq!(row.status, "completed");
    }

    #[tokio::test]
    async fn batches_many_concurrent_submits() {
        let (pool, dir) = setup().await;
        let kill_switch = Arc::new(KillSwitch::new(dir.path().join("KILL")));
        let queue = WriterQueue::spawn(pool.clone(), 1000, kill_switch);

        let mut handles = Vec::new();
        for i in 0..200 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .insert_started(&format!("a{i}"), "t", "do it")
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        queue.close().await;

        let row = db::fetch_action(&pool, "a199").await.unwrap();
        assert!(row.is_some());
    }
}

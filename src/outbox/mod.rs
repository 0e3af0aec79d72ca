//! Action outbox: write-ahead log + single-writer queue giving crash-safe action
//! tracking and orphan reconciliation (SPEC_FULL.md §4.3).

mod db;
mod reconcile;
mod wal;
mod writerq;

pub use db::{finish_run, get_state, insert_run, open_pool, run_migrations, set_state, ActionRow};
pub use reconcile::{reconcile, Orphan};
pub use wal::{Wal, WalEntry, WalStatus};
pub use writerq::{WriterConfig, WriterQueue};

use std::future::Future;

use tracing::instrument;

use crate::error::Result;

/// Ties the WAL and the writer queue together behind the 7-step protocol
/// (SPEC_FULL.md §4.3): WAL-Started, DB-Started, execute, DB-terminal, WAL-terminal.
///
/// The WAL append happens-before the DB write at every step; recovery after a crash
/// anywhere in this sequence can always tell, from the WAL alone, whether an action's
/// DB row reflects its true outcome (see [`reconcile`]).
pub struct Outbox {
    wal: Wal,
    queue: WriterQueue,
}

impl Outbox {
    pub fn new(wal: Wal, queue: WriterQueue) -> Self {
        Self { wal, queue }
    }

    /// Runs `action` under the full outbox protocol, recording its lifecycle in both
    /// the WAL and the DB. `action` yields the result_ref stored on success.
    #[instrument(skip(self, action), fields(action_id, trace_id))]
    pub async fn run_action<F, Fut>(
        &self,
        action_id: &str,
        trace_id: &str,
        task: &str,
        action: F,
    ) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let started = WalEntry::started(action_id, trace_id, task);
        self.wal.append(&started)?;
        self.queue.insert_started(action_id, trace_id, task).await?;

        match action().await {
            Ok(result_ref) => {
                self.queue.mark_completed(action_id, Some(&result_ref)).await?;
                self.wal.append(&started.terminal(
                    WalStatus::Completed,
                    Some(result_ref.clone()),
                    None,
                ))?;
                Ok(result_ref)
            }
            Err(e) => {
                self.queue.mark_failed(action_id, &e.to_string()).await?;
                self.wal
                    .append(&started.terminal(WalStatus::Failed, None, Some(e.to_string())))?;
                Err(e)
            }
        }
    }

    /// Reads the WAL and returns every action whose only record is `Started`.
    pub fn reconcile(&self) -> Result<Vec<Orphan>> {
        reconcile(&self.wal)
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    pub fn queue(&self) -> &WriterQueue {
        &self.queue
    }
}

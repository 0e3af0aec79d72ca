//! SQLite schema and connection pool for the action outbox's DB mirror.
//!
//! Migrations are embedded `include_str!` SQL files applied in order, tracked through
//! `PRAGMA user_version` rather than `sqlx`'s own migration table, so the only moving
//! parts at runtime are a version counter and a pre-migration file-copy backup.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{info, instrument};

use crate::error::{ApexError, Result};

/// Embedded migrations, applied in order starting from version 1.
const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("../../migrations/0001_initial.sql"))];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRow {
    pub action_id: String,
    pub trace_id: String,
    pub task: String,
    pub status: String,
    pub started_at: chrono::DateTime<Utc>,
    pub completed_at: Option<chrono::DateTime<Utc>>,
    pub result_ref: Option<String>,
    pub error: Option<String>,
}

#[instrument]
pub async fn open_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ApexError::Database {
            reason: e.to_string(),
        })?;
    }
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .map_err(|e| ApexError::Database {
            reason: e.to_string(),
        })?;
    Ok(pool)
}

/// Applies any migration whose version exceeds `PRAGMA user_version`, backing up the
/// database file beforehand.
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool, db_path: &Path) -> Result<()> {
    let row = sqlx::query("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .map_err(|e| ApexError::Database {
            reason: e.to_string(),
        })?;
    let current: i64 = row.try_get(0).map_err(|e| ApexError::Database {
        reason: e.to_string(),
    })?;

    let pending: Vec<_> = MIGRATIONS.iter().filter(|(v, _)| *v > current).collect();
    if pending.is_empty() {
        return Ok(());
    }

    if db_path.exists() {
        let backup = db_path.with_extension("db.bak");
        std::fs::copy(db_path, backup).map_err(|e| ApexError::Database {
            reason: e.to_string(),
        })?;
    }

    for (version, sql) in pending {
        let mut tx = pool.begin().await.map_err(|e| ApexError::Database {
            reason: e.to_string(),
        })?;
        sqlx::raw_sql(sql).execute(&mut *tx).await.map_err(|e| ApexError::Database {
            reason: e.to_string(),
        })?;
        sqlx::query(&format!("PRAGMA user_version = {version}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| ApexError::Database {
                reason: e.to_string(),
            })?;
        tx.commit().await.map_err(|e| ApexError::Database {
            reason: e.to_string(),
        })?;
        info!(version, "applied outbox migration");
    }

    Ok(())
}

pub async fn insert_started(
    conn: &mut sqlx::SqliteConnection,
    action_id: &str,
    trace_id: &str,
    task: &str,
    started_at: chrono::DateTime<Utc>,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO actions (action_id, trace_id, task, status, started_at) VALUES (?, ?, ?, 'started', ?)",
    )
    .bind(action_id)
    .bind(trace_id)
    .bind(task)
    .bind(started_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn mark_terminal(
    conn: &mut sqlx::SqliteConnection,
    action_id: &str,
    status: &str,
    completed_at: chrono::DateTime<Utc>,
    result_ref: Option<&str>,
    error: Option<&str>,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE actions SET status = ?, completed_at = ?, result_ref = ?, error = ? WHERE action_id = ?",
    )
    .bind(status)
    .bind(completed_at)
    .bind(result_ref)
    .bind(error)
    .bind(action_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Records a run's start in the `runs` table mirror (SPEC_FULL.md §6).
pub async fn insert_run(
    pool: &SqlitePool,
    run_id: &str,
    task: &str,
    risk_level: &str,
    created_at: chrono::DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO runs (run_id, task, risk_level, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(task)
    .bind(risk_level)
    .bind(created_at)
    .execute(pool)
    .await
    .map_err(|e| ApexError::Database {
        reason: e.to_string(),
    })?;
    Ok(())
}

pub async fn finish_run(
    pool: &SqlitePool,
    run_id: &str,
    outcome: &str,
    finished_at: chrono::DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE runs SET outcome = ?, finished_at = ? WHERE run_id = ?")
        .bind(outcome)
        .bind(finished_at)
        .bind(run_id)
        .execute(pool)
        .await
        .map_err(|e| ApexError::Database {
            reason: e.to_string(),
        })?;
    Ok(())
}

/// Reads one value from the `state` key-value mirror, used for small pieces of
/// process-wide bookkeeping (e.g. the last reconciliation timestamp).
pub async fn get_state(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row = sqlx::query_as::<_, (String,)>("SELECT value FROM state WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(|e| ApexError::Database {
            reason: e.to_string(),
        })?;
    Ok(row.map(|(v,)| v))
}

pub async fn set_state(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO state (key, value, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(|e| ApexError::Database {
        reason: e.to_string(),
    })?;
    Ok(())
}

pub async fn fetch_action(pool: &SqlitePool, action_id: &str) -> Result<Option<ActionRow>> {
    let row = sqlx::query_as::<_, (String, String, String, String, chrono::DateTime<Utc>, Option<chrono::DateTime<Utc>>, Option<String>, Option<String>)>(
        "SELECT action_id, trace_id, task, status, started_at, completed_at, result_ref, error FROM actions WHERE action_id = ?",
    )
    .bind(action_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| ApexError::Database {
        reason: e.to_string(),
    })?;

    Ok(row.map(|(action_id, trace_id, task, status, started_at, completed_at, result_ref, error)| ActionRow {
        action_id,
        trace_id,
        task,
        status,
        started_at,
        completed_at,
        result_ref,
        error,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_create_expected_tables() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("runtime.db");
        let pool = open_pool(&db_path).await.unwrap();
        run_migrations(&pool, &db_path).await.unwrap();

        let row = sqlx::query("PRAGMA user_version").fetch_one(&pool).await.unwrap();
        let version: i64 = row.try_get(0).unwrap();
        assert_eq!(version, 1);

        sqlx::query("INSERT INTO actions (action_id, trace_id, task, status, started_at) VALUES ('a1', 't1', 'do it', 'started', datetime('now'))")
            .execute(&pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rerunning_migrations_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("runtime.db");
        let pool = open_pool(&db_path).await.unwrap();
        run_migrations(&pool, &db_path).await.unwrap();
        run_migrations(&pool, &db_path).await.unwrap();
    }

    #[tokio::test]
    async fn run_lifecycle_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("runtime.db");
        let pool = open_pool(&db_path).await.unwrap();
        run_migrations(&pool, &db_path).await.unwrap();

        insert_run(&pool, "run-1", "do a thing", "Low", Utc::now()).await.unwrap();
        finish_run(&pool, "run-1", "success", Utc::now()).await.unwrap();

        let row = sqlx::query_as::<_, (String,)>("SELECT outcome FROM runs WHERE run_id = ?")
            .bind("run-1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, "success");
    }

    #[tokio::test]
    async fn state_kv_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("runtime.db");
        let pool = open_pool(&db_path).await.unwrap();
        run_migrations(&pool, &db_path).await.unwrap();

        assert_eq!(get_state(&pool, "last_reconcile").await.unwrap(), None);
        set_state(&pool, "last_reconcile", "2026-01-01").await.unwrap();
        assert_eq!(
            get_state(&pool, "last_reconcile").await.unwrap(),
            Some("2026-01-01".to_string())
        );
        set_state(&pool, "last_reconcile", "2026-01-02").await.unwrap();
        assert_eq!(
            get_state(&pool, "last_reconcile").await.unwrap(),
            Some("2026-01-02".to_string())
        );
    }
}

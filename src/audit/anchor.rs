//! Daily anchors: a commitment of the chain tip for one calendar day (SPEC_FULL.md §4.2)

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::{ApexError, Result};

use super::log::AuditLogger;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Anchor {
    pub date: NaiveDate,
    pub chain_hash: String,
    pub record_count: usize,
    pub created_at: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_tag: Option<String>,
}

fn anchors_path(dir: &Path) -> PathBuf {
    dir.join("anchors.jsonl")
}

fn read_anchors(dir: &Path) -> Result<Vec<Anchor>> {
    let path = anchors_path(dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(&path).map_err(|e| ApexError::AuditIo {
        reason: e.to_string(),
    })?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| ApexError::AuditIo {
            reason: e.to_string(),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line).map_err(|e| ApexError::AuditSerialize {
            reason: e.to_string(),
        })?);
    }
    Ok(out)
}

fn write_anchors(dir: &Path, anchors: &[Anchor]) -> Result<()> {
    let path = anchors_path(dir);
    let tmp = dir.join(format!(".anchors.{}.tmp", Uuid::new_v4()));
    {
        let mut file = File::create(&tmp).map_err(|e| ApexError::AuditIo {
            reason: e.to_string(),
        })?;
        for anchor in anchors {
            let line = serde_json::to_string(anchor).map_err(|e| ApexError::AuditSerialize {
                reason: e.to_string(),
            })?;
            writeln!(file, "{line}").map_err(|e| ApexError::AuditIo {
                reason: e.to_string(),
            })?;
        }
        file.sync_all().map_err(|e| ApexError::AuditIo {
            reason: e.to_string(),
        })?;
    }
    fs::rename(&tmp, &path).map_err(|e| ApexError::AuditIo {
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Writes or overwrites today's anchor if missing or stale, returning whether it wrote.
///
/// An optional `git tag -a {prefix}-{date}` is created when `git_tag_prefix` is set;
/// tagging failures are logged as warnings and never fail the anchor write itself.
#[instrument(skip(logger))]
pub fn maybe_create_anchor(
    logger: &AuditLogger,
    date: NaiveDate,
    git_tag_prefix: Option<&str>,
) -> Result<bool> {
    let records = logger.records_for_date(date)?;
    let chain_hash = records.last().map(|r| r.hash.clone()).unwrap_or_default();
    let record_count = records.len();

    let dir = logger.dir();
    let mut anchors = read_anchors(dir)?;

    let existing = anchors.iter().find(|a| a.date == date).cloned();
    if let Some(existing) = &existing {
        if existing.chain_hash == chain_hash {
            return Ok(false);
        }
    }

    let git_tag = git_tag_prefix.and_then(|prefix| {
        let tag = format!("{prefix}-{}", date.format("%Y-%m-%d"));
        match Command::new("git").args(["tag", "-a", &tag, "-m", "apex anchor"]).output() {
            Ok(out) if out.status.success() => Some(tag),
            Ok(out) => {
                warn!(stderr = %String::from_utf8_lossy(&out.stderr), "git tag failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "failed to invoke git for anchor tag");
                None
            }
        }
    });

    let anchor = Anchor {
        date,
        chain_hash,
        record_count,
        created_at: Utc::now(),
        git_tag,
    };

    anchors.retain(|a| a.date != date);
    anchors.push(anchor);
    anchors.sort_by_key(|a| a.date);
    write_anchors(dir, &anchors)?;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::log::AuditRecord;
    use crate::risk::RiskLevel;
    use chrono::TimeZone;

    fn record(action_id: &str, at: chrono::DateTime<Utc>) -> AuditRecord {
        AuditRecord {
            timestamp: at,
            action_id: action_id.to_string(),
            task: "t".to_string(),
            risk_level: RiskLevel::Low,
            outcome: "success".to_string(),
            duration_ms: 1,
            model: "mock".to_string(),
            error: None,
            sandbox_level: None,
            prev_hash: String::new(),
            hash: String::new(),
        }
    }

    #[test]
    fn creates_anchor_for_new_day() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path()).unwrap();
        let day = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        logger.log(record("a1", day)).unwrap();

        let created = maybe_create_anchor(&logger, day.date_naive(), None).unwrap();
        assert!(created);

        let again = maybe_create_anchor(&logger, day.date_naive(), None).unwrap();
        assert!(!again);
    }

    #[test]
    fn anchor_updates_when_chain_hash_changes() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path()).unwrap();
        let day = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        logger.log(record("a1", day)).unwrap();
        maybe_create_anchor(&logger, day.date_naive(), None).unwrap();

        logger.log(record("a2", day)).unwrap();
        let created = maybe_create_anchor(&logger, day.date_naive(), None).unwrap();
        assert!(created);
    }
}

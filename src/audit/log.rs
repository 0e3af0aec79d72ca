//! Hash-chained append-only audit log, one JSONL file per calendar day.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::error::{ApexError, Result};
use crate::risk::RiskLevel;

use super::redact::{NoopRedactor, Redactor};

/// One line of the hash chain.
///
/// Field order is fixed (derive order == serialised order) because the hash is computed
/// over this exact `serde_json` rendering with `hash` cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: chrono::DateTime<Utc>,
    pub action_id: String,
    pub task: String,
    pub risk_level: RiskLevel,
    pub outcome: String,
    pub duration_ms: u64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_level: Option<String>,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditRecord {
    /// Hash over the canonical serialisation with `hash` cleared.
    fn compute_hash(&self) -> Result<String> {
        let mut unhashed = self.clone();
        unhashed.hash = String::new();
        let bytes = serde_json::to_vec(&unhashed).map_err(|e| ApexError::AuditSerialize {
            reason: e.to_string(),
        })?;
        let digest = Sha256::digest(&bytes);
        Ok(hex::encode(digest))
    }
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub valid: bool,
    pub records_checked: usize,
    pub broken_at: Option<usize>,
}

/// Append-only hash-chained log; one instance per process owns the write lock.
pub struct AuditLogger {
    dir: PathBuf,
    redactor: Box<dyn Redactor>,
    writer: Mutex<Option<(NaiveDate, BufWriter<File>)>>,
}

impl AuditLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| ApexError::AuditIo {
            reason: e.to_string(),
        })?;
        Ok(Self {
            dir,
            redactor: Box::new(NoopRedactor),
            writer: Mutex::new(None),
        })
    }

    pub fn with_redactor(mut self, redactor: Box<dyn Redactor>) -> Self {
        self.redactor = redactor;
        self
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Append one record, filling in `prev_hash` and `hash`, redacting `task`/`error`
    /// first so the chain is self-consistent against its own redacted view.
    #[instrument(skip(self, record), fields(action_id = %record.action_id))]
    pub fn log(&self, mut record: AuditRecord) -> Result<AuditRecord> {
        record.task = self.redactor.redact("task", &record.task);
        record.error = record.error.map(|e| self.redactor.redact("error", &e));

        let date = record.timestamp.date_naive();
        let mut guard = self.writer.lock();

        let prev_hash = self.last_hash_for_date(date)?.unwrap_or_else(|| {
            // First record of the day: chain from yesterday's tip, if any.
            self.last_hash_before(date).unwrap_or_default()
        });
        record.prev_hash = prev_hash;
        record.hash = record.compute_hash()?;

        let needs_reopen = match guard.as_ref() {
            Some((open_date, _)) => *open_date != date,
            None => true,
        };
        if needs_reopen {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(date))
                .map_err(|e| ApexError::AuditIo {
                    reason: e.to_string(),
                })?;
            *guard = Some((date, BufWriter::new(file)));
        }

        let (_, writer) = guard.as_mut().expect("just opened");
        let line = serde_json::to_string(&record).map_err(|e| ApexError::AuditSerialize {
            reason: e.to_string(),
        })?;
        writeln!(writer, "{line}").map_err(|e| ApexError::AuditIo {
            reason: e.to_string(),
        })?;
        writer.flush().map_err(|e| ApexError::AuditIo {
            reason: e.to_string(),
        })?;
        writer.get_ref().sync_data().map_err(|e| ApexError::AuditIo {
            reason: e.to_string(),
        })?;

        Ok(record)
    }

    /// Most recent `n` records across all days, newest last.
    pub fn recent(&self, n: usize) -> Result<Vec<AuditRecord>> {
        let mut all = Vec::new();
        for date in self.day_files()? {
            all.extend(self.records_for_date(date)?);
        }
        let start = all.len().saturating_sub(n);
        Ok(all.split_off(start))
    }

    pub fn records_for_date(&self, date: NaiveDate) -> Result<Vec<AuditRecord>> {
        let path = self.path_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(|e| ApexError::AuditIo {
            reason: e.to_string(),
        })?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| ApexError::AuditIo {
                reason: e.to_string(),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line).map_err(|e| ApexError::AuditSerialize {
                reason: e.to_string(),
            })?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn last_hash_for_date(&self, date: NaiveDate) -> Result<Option<String>> {
        Ok(self.records_for_date(date)?.last().map(|r| r.hash.clone()))
    }

    fn last_hash_before(&self, date: NaiveDate) -> Option<String> {
        self.day_files()
            .ok()?
            .into_iter()
            .filter(|d| *d < date)
            .next_back()
            .and_then(|d| self.last_hash_for_date(d).ok().flatten())
    }

    /// Calendar dates with a JSONL file, ascending (filename sort == chronological sort).
    fn day_files(&self) -> Result<Vec<NaiveDate>> {
        let mut dates = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| ApexError::AuditIo {
            reason: e.to_string(),
        })? {
            let entry = entry.map_err(|e| ApexError::AuditIo {
                reason: e.to_string(),
            })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".jsonl") {
                if let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
                    dates.push(date);
                }
            }
        }
        dates.sort();
        Ok(dates)
    }

    /// Walk every day ascending, verifying the chain is contiguous and self-consistent.
    #[instrument(skip(self))]
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut index = 0usize;
        let mut expected_prev = String::new();

        for date in self.day_files()? {
            for record in self.records_for_date(date)? {
                if record.hash.is_empty() {
                    // Legacy/migration record: accepted, resets the chain head.
                    expected_prev = String::new();
                    index += 1;
                    continue;
                }
                if record.prev_hash != expected_prev {
                    return Ok(VerifyReport {
                        valid: false,
                        records_checked: index,
                        broken_at: Some(index),
                    });
                }
                let recomputed = record.compute_hash()?;
                if recomputed != record.hash {
                    return Ok(VerifyReport {
                        valid: false,
                        records_checked: index,
                        broken_at: Some(index),
                    });
                }
                expected_prev = record.hash.clone();
                index += 1;
            }
        }

        Ok(VerifyReport {
            valid: true,
            records_checked: index,
            broken_at: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn record(action_id: &str, at: chrono::DateTime<Utc>) -> AuditRecord {
        AuditRecord {
            timestamp: at,
            action_id: action_id.to_string(),
            task: "do a thing".to_string(),
            risk_level: RiskLevel::Low,
            outcome: "success".to_string(),
            duration_ms: 10,
            model: "mock".to_string(),
            error: None,
            sandbox_level: None,
            prev_hash: String::new(),
            hash: String::new(),
        }
    }

    #[test]
    fn chain_of_records_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path()).unwrap();
        let day = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        logger.log(record("a1", day)).unwrap();
        logger.log(record("a2", day)).unwrap();
        logger.log(record("a3", day)).unwrap();

        let report = logger.verify().unwrap();
        assert!(report.valid);
        assert_eq!(report.records_checked, 3);
    }

    #[test]
    fn tampering_with_a_record_breaks_verification() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path()).unwrap();
        let day = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        logger.log(record("a1", day)).unwrap();
        logger.log(record("a2", day)).unwrap();

        let path = logger.path_for(day.date_naive());
        let contents = fs::read_to_string(&path).unwrap();
        let tampered = contents.replace("do a thing", "do a different thing");
        fs::write(&path, tampered).unwrap();

        let report = logger.verify().unwrap();
        assert!(!report.valid);
        assert_eq!(report.broken_at, Some(0));
    }

    #[test]
    fn chain_continues_across_days() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path()).unwrap();
        let day1 = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 1, 2, 9, 0, 0).unwrap();

        logger.log(record("a1", day1)).unwrap();
        let second = logger.log(record("a2", day2)).unwrap();

        let last_day1 = logger.last_hash_for_date(day1.date_naive()).unwrap().unwrap();
        assert_eq!(second.prev_hash, last_day1);

        let report = logger.verify().unwrap();
        assert!(report.valid);
    }

    #[test]
    fn redactor_masks_before_hashing() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path())
            .unwrap()
            .with_redactor(Box::new(super::super::redact::SecretRedactor::new()));
        let day = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        let mut r = record("a1", day);
        r.task = "use sk-abcdefghijklmnopqrstuvwx please".to_string();
        let logged = logger.log(r).unwrap();
        assert!(logged.task.contains("[REDACTED]"));

        let report = logger.verify().unwrap();
        assert!(report.valid);
    }

    proptest! {
        /// Any run of 1..=20 untampered appends to the same day always verifies clean,
        /// regardless of the action ids or outcome strings involved.
        #[test]
        fn untampered_chain_of_any_length_always_verifies(count in 1usize..20) {
            let dir = tempfile::tempdir().unwrap();
            let logger = AuditLogger::new(dir.path()).unwrap();
            let day = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

            for i in 0..count {
                logger.log(record(&format!("a{i}"), day)).unwrap();
            }

            let report = logger.verify().unwrap();
            prop_assert!(report.valid);
            prop_assert_eq!(report.records_checked, count);
        }
    }
}

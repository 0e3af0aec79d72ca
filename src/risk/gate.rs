//! Fail-closed gate: a set of registered conditions evaluated before every run.

use std::path::PathBuf;

use tracing::{instrument, warn};

use crate::audit::AuditLogger;
use crate::error::{ApexError, Result};

/// One admission condition. `check` returns `Ok(())` to admit, or `Err(reason)` to deny.
pub trait GateCondition: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self) -> std::result::Result<(), String>;
}

/// Denies admission while the kill-switch sentinel file exists.
pub struct KillSwitchCondition {
    path: PathBuf,
}

impl KillSwitchCondition {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl GateCondition for KillSwitchCondition {
    fn name(&self) -> &str {
        "kill_switch"
    }

    fn check(&self) -> std::result::Result<(), String> {
        if self.path.exists() {
            Err(format!("kill switch is active at {}", self.path.display()))
        } else {
            Ok(())
        }
    }
}

/// Denies admission if the audit chain does not currently verify.
pub struct AuditChainCondition {
    logger: std::sync::Arc<AuditLogger>,
}

impl AuditChainCondition {
    pub fn new(logger: std::sync::Arc<AuditLogger>) -> Self {
        Self { logger }
    }
}

impl GateCondition for AuditChainCondition {
    fn name(&self) -> &str {
        "audit_chain_integrity"
    }

    fn check(&self) -> std::result::Result<(), String> {
        match self.logger.verify() {
            Ok(report) if report.valid => Ok(()),
            Ok(report) => Err(format!(
                "audit chain broken at record {}",
                report.broken_at.unwrap_or(0)
            )),
            Err(e) => Err(format!("could not verify audit chain: {e}")),
        }
    }
}

/// Denies admission if free space on the filesystem backing `path` drops below `min_bytes`.
pub struct DiskSpaceCondition {
    path: PathBuf,
    min_bytes: u64,
}

impl DiskSpaceCondition {
    pub fn new(path: impl Into<PathBuf>, min_bytes: u64) -> Self {
        Self {
            path: path.into(),
            min_bytes,
        }
    }

    fn available_bytes(&self) -> std::result::Result<u64, String> {
        fs2::available_space(&self.path).map_err(|e| e.to_string())
    }
}

impl GateCondition for DiskSpaceCondition {
    fn name(&self) -> &str {
        "disk_space"
    }

    fn check(&self) -> std::result::Result<(), String> {
        let available = self.available_bytes()?;
        if available < self.min_bytes {
            Err(format!(
                "only {available} bytes free at {}, need at least {}",
                self.path.display(),
                self.min_bytes
            ))
        } else {
            Ok(())
        }
    }
}

/// Denies admission if the config file is missing or unreadable.
pub struct ConfigPresentCondition {
    path: PathBuf,
}

impl ConfigPresentCondition {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl GateCondition for ConfigPresentCondition {
    fn name(&self) -> &str {
        "config_present"
    }

    fn check(&self) -> std::result::Result<(), String> {
        if self.path.exists() {
            Ok(())
        } else {
            Err(format!("config file missing at {}", self.path.display()))
        }
    }
}

/// Evaluates its registered conditions in order; the first denial aborts the run.
///
/// Behind a `parking_lot::RwLock` so the condition set can be hot-reloaded without
/// disrupting an in-flight classification (SPEC_FULL.md §4.5).
pub struct FailClosedGate {
    conditions: parking_lot::RwLock<std::sync::Arc<Vec<Box<dyn GateCondition>>>>,
}

impl FailClosedGate {
    pub fn new(conditions: Vec<Box<dyn GateCondition>>) -> Self {
        Self {
            conditions: parking_lot::RwLock::new(std::sync::Arc::new(conditions)),
        }
    }

    pub fn set_conditions(&self, conditions: Vec<Box<dyn GateCondition>>) {
        *self.conditions.write() = std::sync::Arc::new(conditions);
    }

    #[instrument(skip(self))]
    pub fn admit(&self) -> Result<()> {
        let conditions = self.conditions.read().clone();
        for condition in conditions.iter() {
            if let Err(reason) = condition.check() {
                warn!(condition = condition.name(), reason = %reason, "fail-closed gate denied run");
                return Err(ApexError::GateDenied {
                    reason: format!("{}: {reason}", condition.name()),
                });
            }
        }
        Ok(())
    }
}

#[allow(dead_code)]
fn _assert_send_sync<T: Send + Sync>() {}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysDeny;
    impl GateCondition for AlwaysDeny {
        fn name(&self) -> &str {
            "always_deny"
        }
        fn check(&self) -> std::result::Result<(), String> {
            Err("nope".to_string())
        }
    }

    struct AlwaysAdmit;
    impl GateCondition for AlwaysAdmit {
        fn name(&self) -> &str {
            "always_admit"
        }
        fn check(&self) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn empty_gate_admits() {
        let gate = FailClosedGate::new(Vec::new());
        assert!(gate.admit().is_ok());
    }

    #[test]
    fn single_denial_aborts() {
        let gate = FailClosedGate::new(vec![Box::new(AlwaysAdmit), Box::new(AlwaysDeny)]);
        let err = gate.admit().unwrap_err();
        assert!(matches!(err, ApexError::GateDenied { .. }));
    }

    #[test]
    fn kill_switch_condition_denies_when_file_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("KILL");
        std::fs::write(&path, "active").unwrap();
        let condition = KillSwitchCondition::new(path);
        assert!(condition.check().is_err());
    }

    #[test]
    fn kill_switch_condition_admits_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("KILL");
        let condition = KillSwitchCondition::new(path);
        assert!(condition.check().is_ok());
    }

    #[test]
    fn set_conditions_replaces_the_snapshot() {
        let gate = FailClosedGate::new(vec![Box::new(AlwaysAdmit)]);
        assert!(gate.admit().is_ok());
        gate.set_conditions(vec![Box::new(AlwaysDeny)]);
        assert!(gate.admit().is_err());
    }
}

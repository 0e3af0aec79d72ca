//! Audit module — tamper-evident hash-chained event log (SPEC_FULL.md §4.2)

mod anchor;
mod log;
mod redact;

pub use anchor::{maybe_create_anchor, Anchor};
pub use log::{AuditLogger, AuditRecord, VerifyReport};
pub use redact::{NoopRedactor, Redactor, SecretRedactor};

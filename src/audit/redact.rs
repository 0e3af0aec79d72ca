//! Redaction hook applied to `task`/`error` fields before hashing (SPEC_FULL.md §4.2)

use regex::Regex;

/// Masks sensitive substrings in a field value before it enters the hash chain.
///
/// Implementations must be deterministic: the same input always produces the same
/// output, or chain verification would fail against its own prior runs.
pub trait Redactor: Send + Sync {
    fn redact(&self, field: &str, value: &str) -> String;
}

/// Default: passes every field through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRedactor;

impl Redactor for NoopRedactor {
    fn redact(&self, _field: &str, value: &str) -> String {
        value.to_string()
    }
}

/// Masks common secret shapes (API keys, bearer tokens) in `task` and `error` text.
///
/// Defense in depth, not this system's focus: a task description or Runner error
/// should never legitimately contain a live credential, but redacting them here keeps
/// the audit log safe to share even if one slips through.
pub struct SecretRedactor {
    patterns: Vec<Regex>,
}

impl SecretRedactor {
    pub fn new() -> Self {
        let patterns = vec![
            Regex::new(r"sk-[A-Za-z0-9]{16,}").unwrap(),
            Regex::new(r"(?i)bearer\s+[A-Za-z0-9._-]{10,}").unwrap(),
            Regex::new(r"(?i)(api[_-]?key|token|secret)\s*[:=]\s*\S+").unwrap(),
        ];
        Self { patterns }
    }
}

impl Default for SecretRedactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Redactor for SecretRedactor {
    fn redact(&self, _field: &str, value: &str) -> String {
        let mut out = value.to_string();
        for pattern in &self.patterns {
            out = pattern.replace_all(&out, "[REDACTED]").into_owned();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_redactor_passes_through() {
        assert_eq!(NoopRedactor.redact("task", "hello sk-aaaaaaaaaaaaaaaaaaaa"), "hello sk-aaaaaaaaaaaaaaaaaaaa");
    }

    #[test]
    fn secret_redactor_masks_api_key_shape() {
        let redactor = SecretRedactor::new();
        let out = redactor.redact("task", "use sk-abcdefghijklmnopqrstuvwx to call the API");
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains("sk-abcdefghijklmnopqrstuvwx"));
    }

    #[test]
    fn secret_redactor_masks_bearer_token() {
        let redactor = SecretRedactor::new();
        let out = redactor.redact("error", "request failed: Authorization: Bearer abcdef1234567890");
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn secret_redactor_leaves_ordinary_text_alone() {
        let redactor = SecretRedactor::new();
        let out = redactor.redact("task", "build the login page");
        assert_eq!(out, "build the login page");
    }
}

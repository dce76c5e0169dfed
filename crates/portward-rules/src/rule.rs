//! The persisted rules document
//!
//! The on-disk format uses PascalCase field names so documents written by
//! earlier deployments keep parsing unchanged.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default save interval when the document omits `SaveDuration`.
pub const DEFAULT_SAVE_DURATION: u64 = 600;

/// Rules document errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read rules file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse rules file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("failed to write rules file {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

/// One forwarding rule
///
/// Identity is the index in the document's `Rules` array; it is stable for
/// the process lifetime. Only `quota` changes at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Rule {
    /// Label for logs only
    pub name: String,
    /// Local TCP port to listen on
    pub listen: u16,
    /// Forward address, "host:port"
    pub forward: String,
    /// Remaining byte allowance; negative means exhausted
    pub quota: i64,
    /// Expiry as epoch seconds; 0 = never
    #[serde(default)]
    pub expire_date: i64,
    /// Simultaneous connection limit; 0 = unlimited
    #[serde(default)]
    pub simultaneous: usize,
}

impl Rule {
    /// Whether the quota is spent (strictly negative; a quota of exactly 0
    /// still admits).
    pub fn is_exhausted(&self) -> bool {
        self.quota < 0
    }

    /// Whether the rule has expired as of `now` (epoch seconds).
    pub fn is_expired(&self, now: i64) -> bool {
        self.expire_date != 0 && self.expire_date < now
    }
}

/// The whole persisted document: process settings plus the ordered rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RulesFile {
    /// Seconds between periodic saves
    #[serde(default = "default_save_duration")]
    pub save_duration: u64,
    /// Idle timeout in seconds; negative disables idle enforcement
    #[serde(default = "default_timeout")]
    pub timeout: i64,
    pub rules: Vec<Rule>,
}

fn default_save_duration() -> u64 {
    DEFAULT_SAVE_DURATION
}

fn default_timeout() -> i64 {
    -1
}

impl RulesFile {
    /// Load the document from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Write the document back, overwriting in place.
    ///
    /// The write is not atomic; a crash mid-write can corrupt the file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        // Serialization of this document cannot fail: no maps, no non-string
        // keys. Treat a failure as an I/O-level invalid-data error anyway.
        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        std::fs::write(path, json).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    /// Idle timeout as a duration, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.timeout < 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout as u64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rule() -> Rule {
        Rule {
            name: "web".to_string(),
            listen: 8080,
            forward: "10.0.0.5:80".to_string(),
            quota: 1_000_000,
            expire_date: 0,
            simultaneous: 2,
        }
    }

    #[test]
    fn test_parse_pascal_case_document() {
        let json = r#"{
            "SaveDuration": 120,
            "Timeout": 30,
            "Rules": [
                {
                    "Name": "ssh",
                    "Listen": 2222,
                    "Forward": "192.168.1.10:22",
                    "Quota": 5000000000,
                    "ExpireDate": 1735689600,
                    "Simultaneous": 3
                }
            ]
        }"#;

        let doc: RulesFile = serde_json::from_str(json).unwrap();
        assert_eq!(doc.save_duration, 120);
        assert_eq!(doc.timeout, 30);
        assert_eq!(doc.rules.len(), 1);

        let rule = &doc.rules[0];
        assert_eq!(rule.name, "ssh");
        assert_eq!(rule.listen, 2222);
        assert_eq!(rule.forward, "192.168.1.10:22");
        assert_eq!(rule.quota, 5_000_000_000);
        assert_eq!(rule.expire_date, 1_735_689_600);
        assert_eq!(rule.simultaneous, 3);
    }

    #[test]
    fn test_document_defaults() {
        let json = r#"{
            "Rules": [
                { "Name": "a", "Listen": 9000, "Forward": "127.0.0.1:80", "Quota": 100 }
            ]
        }"#;

        let doc: RulesFile = serde_json::from_str(json).unwrap();
        assert_eq!(doc.save_duration, DEFAULT_SAVE_DURATION);
        assert!(doc.idle_timeout().is_none());
        assert_eq!(doc.rules[0].expire_date, 0);
        assert_eq!(doc.rules[0].simultaneous, 0);
    }

    #[test]
    fn test_idle_timeout_disabled_by_negative() {
        let doc = RulesFile {
            save_duration: 600,
            timeout: -1,
            rules: vec![],
        };
        assert!(doc.idle_timeout().is_none());

        let doc = RulesFile { timeout: 5, ..doc };
        assert_eq!(doc.idle_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_round_trip_preserves_quota_and_expiry() {
        let doc = RulesFile {
            save_duration: 300,
            timeout: 15,
            rules: vec![
                Rule {
                    quota: -250,
                    expire_date: 1_700_000_000,
                    ..sample_rule()
                },
                sample_rule(),
            ],
        };

        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"ExpireDate\""));
        assert!(json.contains("\"SaveDuration\""));

        let parsed: RulesFile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.save_duration, 300);
        assert_eq!(parsed.timeout, 15);
        for (a, b) in parsed.rules.iter().zip(doc.rules.iter()) {
            assert_eq!(a.quota, b.quota);
            assert_eq!(a.expire_date, b.expire_date);
        }
    }

    #[test]
    fn test_load_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let doc = RulesFile {
            save_duration: 600,
            timeout: -1,
            rules: vec![sample_rule()],
        };
        doc.save(&path).unwrap();

        let loaded = RulesFile::load(&path).unwrap();
        assert_eq!(loaded.rules.len(), 1);
        assert_eq!(loaded.rules[0].quota, doc.rules[0].quota);
        assert_eq!(loaded.rules[0].forward, doc.rules[0].forward);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = RulesFile::load(&dir.path().join("nope.json"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result = RulesFile::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_exhaustion_and_expiry_predicates() {
        let mut rule = sample_rule();
        assert!(!rule.is_exhausted());

        rule.quota = 0;
        assert!(!rule.is_exhausted(), "a quota of exactly 0 still admits");

        rule.quota = -1;
        assert!(rule.is_exhausted());

        rule.expire_date = 0;
        assert!(!rule.is_expired(1_700_000_000), "0 means never");

        rule.expire_date = 1_600_000_000;
        assert!(rule.is_expired(1_700_000_000));
        assert!(!rule.is_expired(1_500_000_000));
    }
}

//! Persisting consumed quota back to the rules document
//!
//! The task wakes on a periodic interval and whenever a listener requests an
//! immediate save (quota or expiry reached). Each wake snapshots the rule
//! table and overwrites the document in place. A failed write is logged and
//! ignored; persistence never blocks or crashes the data plane.

use portward_rules::{ConfigError, RuleTable, RulesFile};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{trace, warn};

/// Cloneable handle for requesting an immediate save.
#[derive(Clone, Default)]
pub struct PersistHandle {
    notify: Arc<Notify>,
}

impl PersistHandle {
    pub fn request_save(&self) {
        self.notify.notify_one();
    }
}

/// Serialize the current rule state together with the process settings and
/// overwrite the rules document. Only quota values change between saves;
/// everything else passes through as loaded.
pub fn save_snapshot(
    table: &RuleTable,
    path: &Path,
    save_duration: u64,
    timeout: i64,
) -> Result<(), ConfigError> {
    let doc = RulesFile {
        save_duration,
        timeout,
        rules: table.snapshot(),
    };
    doc.save(path)
}

/// Background task writing the rule table to disk, periodically and on
/// request.
pub struct PersistenceTask {
    table: Arc<RuleTable>,
    path: PathBuf,
    save_duration: u64,
    timeout: i64,
    handle: PersistHandle,
}

impl PersistenceTask {
    pub fn new(
        table: Arc<RuleTable>,
        path: PathBuf,
        save_duration: u64,
        timeout: i64,
        handle: PersistHandle,
    ) -> Self {
        Self {
            table,
            path,
            save_duration,
            timeout,
            handle,
        }
    }

    pub async fn run(self) {
        let period = Duration::from_secs(self.save_duration.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the first save
        // happens one full period in (or on request).
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.handle.notify.notified() => {}
            }
            self.save_once();
        }
    }

    fn save_once(&self) {
        match save_snapshot(&self.table, &self.path, self.save_duration, self.timeout) {
            Ok(()) => trace!("saved rules to {}", self.path.display()),
            Err(e) => warn!("error re-writing rules: {}", e),
        }
    }
}

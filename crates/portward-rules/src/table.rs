//! Shared rule state
//!
//! Two services back the data plane: [`RuleTable`] (quota and expiry per
//! rule) and [`ConnectionCounter`] (active half-connection units per rule).
//! Each owns one coarse lock; every critical section is O(1) apart from the
//! snapshot clone, so contention is bounded by the transfer-completion rate.
//! No task ever holds both locks at once.

use crate::Rule;
use std::sync::RwLock;

/// The mutable part of a rule, as seen by admission checks.
#[derive(Debug, Clone, Copy)]
pub struct RuleStatus {
    pub quota: i64,
    pub expire_date: i64,
}

impl RuleStatus {
    pub fn is_exhausted(&self) -> bool {
        self.quota < 0
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expire_date != 0 && self.expire_date < now
    }
}

/// Shared registry of rules, guarded by one reader/writer lock.
///
/// Quota only ever decreases; nothing in this process resets it. Rules are
/// never added or removed after construction.
pub struct RuleTable {
    rules: RwLock<Vec<Rule>>,
}

impl RuleTable {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current quota and expiry for a rule.
    pub fn status(&self, index: usize) -> RuleStatus {
        let rules = self.rules.read().unwrap();
        RuleStatus {
            quota: rules[index].quota,
            expire_date: rules[index].expire_date,
        }
    }

    /// Full clone of one rule (static fields included).
    pub fn rule(&self, index: usize) -> Rule {
        self.rules.read().unwrap()[index].clone()
    }

    /// Subtract transferred bytes from a rule's quota. May drive the quota
    /// negative; there is no floor and no error.
    pub fn charge(&self, index: usize, bytes: u64) {
        let mut rules = self.rules.write().unwrap();
        rules[index].quota -= bytes as i64;
    }

    /// Clone of the whole rule collection, for persistence.
    pub fn snapshot(&self) -> Vec<Rule> {
        self.rules.read().unwrap().clone()
    }
}

/// Active connection counters, one per rule, in half-connection units: an
/// established session contributes 2 (one per direction), and each direction
/// releases its unit independently when it terminates.
pub struct ConnectionCounter {
    counts: RwLock<Vec<u32>>,
}

impl ConnectionCounter {
    pub fn new(len: usize) -> Self {
        Self {
            counts: RwLock::new(vec![0; len]),
        }
    }

    /// Current half-connection units for a rule.
    pub fn active_units(&self, index: usize) -> u32 {
        self.counts.read().unwrap()[index]
    }

    /// Admission predicate: true iff the rule has a limit and the rule is at
    /// or over it. `limit` is in sessions; the counter is in units.
    pub fn would_exceed(&self, index: usize, limit: usize) -> bool {
        if limit == 0 {
            return false;
        }
        self.counts.read().unwrap()[index] as usize >= limit * 2
    }

    /// Reserve both directions of a new session in one critical section, so
    /// a concurrent admission check never observes a half-reserved session.
    pub fn reserve(&self, index: usize) -> u32 {
        let mut counts = self.counts.write().unwrap();
        counts[index] += 2;
        counts[index]
    }

    /// Release one direction. Never goes below zero.
    pub fn release(&self, index: usize) -> u32 {
        let mut counts = self.counts.write().unwrap();
        counts[index] = counts[index].saturating_sub(1);
        counts[index]
    }
}

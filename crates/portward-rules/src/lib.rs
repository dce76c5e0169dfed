//! Forwarding rules and shared rule state
//!
//! This crate owns the persisted rules document (a JSON file mapping listen
//! ports to forward addresses, each with a byte quota, optional expiry date
//! and optional connection limit) and the two pieces of state the data plane
//! shares: the quota table and the active-connection counters.

mod rule;
mod table;

pub use rule::{ConfigError, Rule, RulesFile, DEFAULT_SAVE_DURATION};
pub use table::{ConnectionCounter, RuleStatus, RuleTable};

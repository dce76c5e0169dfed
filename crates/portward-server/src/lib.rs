//! The forwarding engine
//!
//! One listener task per rule, one session per accepted connection, two
//! directional copy tasks per session. Sessions charge transferred bytes to
//! the shared [`portward_rules::RuleTable`] when each direction completes,
//! so quota enforcement is soft: it blocks future connections, never one
//! already running. A background task persists consumed quota back to the
//! rules document.

mod persist;
mod pipe;
mod server;

pub use persist::{save_snapshot, PersistHandle, PersistenceTask};
pub use pipe::{copy_direction, PipeEnd};
pub use server::{Forwarder, ForwarderConfig, ServerError};

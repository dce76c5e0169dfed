//! Per-rule listeners and session handling
//!
//! The [`Forwarder`] binds one listening socket per admissible rule and runs
//! an accept loop for each. Every accept re-checks quota and expiry against
//! the shared table (the startup pre-check is not authoritative once
//! transfers start landing); an exhausted or expired rule closes its
//! listener for the remainder of the process, so further clients are
//! refused instead of silently stalled.

use crate::persist::PersistHandle;
use crate::pipe::{copy_direction, PipeEnd};
use portward_rules::{ConnectionCounter, Rule, RuleTable};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Forwarding engine errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind port {port} for rule \"{name}\": {source}")]
    Bind {
        port: u16,
        name: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Per-direction inactivity deadline; `None` disables idle enforcement
    pub idle_timeout: Option<Duration>,
    /// Upper bound on the outbound connect to a rule's forward address
    pub dial_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            dial_timeout: Duration::from_secs(10),
        }
    }
}

/// The forwarding engine: binds rule listeners and drives sessions.
///
/// Cheap to clone; all shared state sits behind `Arc`s, so tests can run an
/// isolated instance against their own table and counters.
#[derive(Clone)]
pub struct Forwarder {
    table: Arc<RuleTable>,
    counters: Arc<ConnectionCounter>,
    persist: PersistHandle,
    config: ForwarderConfig,
}

impl Forwarder {
    pub fn new(
        table: Arc<RuleTable>,
        counters: Arc<ConnectionCounter>,
        persist: PersistHandle,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            table,
            counters,
            persist,
            config,
        }
    }

    /// Bind one rule's listen socket and spawn its accept loop.
    ///
    /// Returns `None` when the rule is already exhausted or expired at
    /// startup: such a rule is permanently inactive for this process run
    /// and never gets a bound socket.
    pub async fn start_rule(&self, index: usize) -> Result<Option<SocketAddr>, ServerError> {
        let rule = self.table.rule(index);

        if rule.is_exhausted() {
            warn!(
                "skipping forward on port {}: quota for rule \"{}\" is already spent",
                rule.listen, rule.name
            );
            return Ok(None);
        }
        if rule.is_expired(chrono::Utc::now().timestamp()) {
            warn!(
                "skipping forward on port {}: rule \"{}\" has expired",
                rule.listen, rule.name
            );
            return Ok(None);
        }

        let listener = TcpListener::bind(("0.0.0.0", rule.listen))
            .await
            .map_err(|source| ServerError::Bind {
                port: rule.listen,
                name: rule.name.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            port: rule.listen,
            name: rule.name.clone(),
            source,
        })?;

        debug!(
            "bound port {} for rule \"{}\" forwarding to {}",
            local_addr.port(),
            rule.name,
            rule.forward
        );

        let forwarder = self.clone();
        tokio::spawn(forwarder.accept_loop(listener, index, rule));

        Ok(Some(local_addr))
    }

    async fn accept_loop(self, listener: TcpListener, index: usize, rule: Rule) {
        loop {
            let accepted = listener.accept().await;

            // Re-check under the lock: the startup state is stale as soon
            // as a transfer completes somewhere.
            let status = self.table.status(index);
            if status.is_exhausted() {
                warn!(
                    "quota reached for port {} pointing to {}",
                    rule.listen, rule.forward
                );
                if let Ok((conn, _)) = accepted {
                    drop(conn);
                }
                self.persist.request_save();
                break;
            }
            if status.is_expired(chrono::Utc::now().timestamp()) {
                warn!(
                    "expire date reached for port {} pointing to {}",
                    rule.listen, rule.forward
                );
                if let Ok((conn, _)) = accepted {
                    drop(conn);
                }
                self.persist.request_save();
                break;
            }

            match accepted {
                Ok((stream, peer)) => {
                    let session = self.clone();
                    let rule = rule.clone();
                    tokio::spawn(async move {
                        session.handle_connection(stream, peer, index, rule).await;
                    });
                }
                Err(e) => {
                    warn!("error accepting connection on port {}: {}", rule.listen, e);
                }
            }
        }

        // Dropping the listener closes the socket; new clients are refused
        // for the remainder of the process.
        debug!("listener on port {} closed", rule.listen);
    }

    async fn handle_connection(self, inbound: TcpStream, peer: SocketAddr, index: usize, rule: Rule) {
        if self.counters.would_exceed(index, rule.simultaneous) {
            info!(
                "blocking connection from {} on port {}: connection limit reached ({} active)",
                peer,
                rule.listen,
                self.counters.active_units(index) / 2
            );
            return;
        }

        let outbound = match tokio::time::timeout(
            self.config.dial_timeout,
            TcpStream::connect(&rule.forward),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("error dialing {} for port {}: {}", rule.forward, rule.listen, e);
                return;
            }
            Err(_) => {
                warn!("timed out dialing {} for port {}", rule.forward, rule.listen);
                return;
            }
        };

        // Reserve both directions before either pipe starts so a concurrent
        // admission check never sees a half-reserved session.
        let units = self.counters.reserve(index);
        trace!("accepted connection from {}; {} active units now", peer, units);

        let (client_read, client_write) = inbound.into_split();
        let (upstream_read, upstream_write) = outbound.into_split();
        let session = CancellationToken::new();

        let inbound_pipe = tokio::spawn(self.clone().run_direction(
            index,
            client_read,
            upstream_write,
            session.clone(),
        ));
        let outbound_pipe = tokio::spawn(self.clone().run_direction(
            index,
            upstream_read,
            client_write,
            session,
        ));

        let _ = tokio::join!(inbound_pipe, outbound_pipe);
        trace!("session from {} closed", peer);
    }

    async fn run_direction(
        self,
        index: usize,
        mut src: OwnedReadHalf,
        mut dst: OwnedWriteHalf,
        session: CancellationToken,
    ) {
        let (bytes, end) =
            copy_direction(&mut src, &mut dst, self.config.idle_timeout, &session).await;

        match end {
            PipeEnd::Timeout => debug!("connection idle timeout after {} bytes", bytes),
            PipeEnd::Io(e) => trace!("transfer ended with error after {} bytes: {}", bytes, e),
            PipeEnd::Eof | PipeEnd::PeerClosed => {
                trace!("transfer finished, {} bytes moved", bytes);
            }
        }

        // Charged in bulk at completion, whatever the cause: bytes moved
        // before a timeout count exactly like bytes moved before EOF.
        self.table.charge(index, bytes);
        let units = self.counters.release(index);
        trace!("closed one direction; {} active units now", units);
    }
}

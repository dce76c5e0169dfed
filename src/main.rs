//! portward - TCP port forwarder with per-rule byte quotas
//!
//! Reads a rules document, binds one listener per rule and forwards traffic
//! to each rule's target address while tracking quota, expiry and
//! simultaneous-connection limits. Consumed quota is written back to the
//! document periodically and on shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portward_rules::{ConnectionCounter, RuleTable, RulesFile};
use portward_server::{save_snapshot, Forwarder, ForwarderConfig, PersistHandle, PersistenceTask};

/// Quota-enforcing TCP port forwarder
#[derive(Parser, Debug)]
#[command(name = "portward")]
#[command(about = "Forward TCP ports with per-rule byte quotas, expiry dates and connection limits")]
#[command(version)]
struct Cli {
    /// Rules file path
    #[arg(long, default_value = "rules.json", env = "PORTWARD_CONFIG")]
    config: PathBuf,

    /// Verbosity: 0 silent, 1 quota/expiry and errors, 2 admission
    /// rejections, 3 idle-timeout drops, 4 full trace
    #[arg(long, default_value_t = 1)]
    verbose: u8,

    /// Skip the final rules save on shutdown
    #[arg(long)]
    no_exit_save: bool,

    /// Timeout for dialing a rule's forward address, in seconds
    #[arg(long, default_value_t = 10)]
    dial_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let rules_file = RulesFile::load(&cli.config)
        .with_context(|| format!("cannot read rules from {}", cli.config.display()))?;

    match rules_file.idle_timeout() {
        Some(timeout) => info!("idle timeout set to {:?}", timeout),
        None => info!("idle timeout disabled"),
    }

    let table = Arc::new(RuleTable::new(rules_file.rules.clone()));
    let counters = Arc::new(ConnectionCounter::new(table.len()));

    let persist = PersistHandle::default();
    let persistence = PersistenceTask::new(
        table.clone(),
        cli.config.clone(),
        rules_file.save_duration,
        rules_file.timeout,
        persist.clone(),
    );
    tokio::spawn(persistence.run());

    let forwarder = Forwarder::new(
        table.clone(),
        counters,
        persist,
        ForwarderConfig {
            idle_timeout: rules_file.idle_timeout(),
            dial_timeout: Duration::from_secs(cli.dial_timeout),
        },
    );

    // Startup announcements print unconditionally: operators at the default
    // verbosity still need to see which ports actually bound.
    let mut started = 0;
    for index in 0..table.len() {
        let rule = table.rule(index);
        if let Some(addr) = forwarder
            .start_rule(index)
            .await
            .with_context(|| format!("cannot bind port {} for rule \"{}\"", rule.listen, rule.name))?
        {
            println!("Forwarding from port {} to {}", addr.port(), rule.forward);
            started += 1;
        }
    }
    println!("{} of {} rules active; Ctrl+C to stop", started, table.len());

    shutdown_signal().await;
    info!("shutdown signal received");

    if !cli.no_exit_save {
        if let Err(e) = save_snapshot(
            &table,
            &cli.config,
            rules_file.save_duration,
            rules_file.timeout,
        ) {
            warn!("error saving rules on exit: {}", e);
        }
    }

    info!("exiting");
    Ok(())
}

/// Wait for an interrupt or termination request.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("error listening for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!("error installing SIGTERM handler: {}", e);
                    ctrl_c.await;
                    return;
                }
            };

        tokio::select! {
            () = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}

/// Map the verbosity tier to a tracing level; `RUST_LOG` overrides it.
fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => "off",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

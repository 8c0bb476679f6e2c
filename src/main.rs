//! digest-bench: a TCP throughput benchmark
//!
//! Two roles share one readiness-driven reactor:
//! - client: floods a server with fixed-size random payloads at a set rate
//!   and verifies every digest echoed back
//! - server: digests each payload and writes the digest back, pausing reads
//!   on connections whose response backlog is full
//!
//! Configuration via CLI arguments or TOML file.

mod client;
mod config;
mod digest;
mod error;
mod runtime;
mod server;
mod stats;

use client::Client;
use config::{Config, Role};
use server::Server;
use stats::{ReportKind, Reporter, Stats};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        digest = config.digest.algorithm(),
        report_interval_secs = config.report_interval.as_secs(),
        "Starting digest-bench"
    );

    let stats = Stats::new();
    match config.role {
        Role::Client(ref client) => {
            let client = Client::connect(client, config.digest.clone(), Arc::clone(&stats))?;
            let mut reporter = Reporter::spawn(ReportKind::Client, stats, config.report_interval)?;
            let result = client.run();
            reporter.stop();
            result?;
        }
        Role::Server(ref server) => {
            let server = Server::bind(server, config.digest.clone(), Arc::clone(&stats))?;
            let mut reporter = Reporter::spawn(ReportKind::Server, stats, config.report_interval)?;
            let result = server.run();
            reporter.stop();
            result?;
        }
    }

    Ok(())
}

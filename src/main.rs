//! meshrpc - peer-authoritative entity RPC engine
//!
//! Headless host executable: runs a scripted loopback session and prints its
//! summary.

mod config;
mod session;

use anyhow::{Context, Result};
use config::HostConfig;
use session::DemoSession;
use std::{env, path::PathBuf};
use tracing::info;

fn main() -> Result<()> {
    // Initialize tracing with WARN level by default (can be overridden via RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    info!("Starting meshrpc v{}", env!("CARGO_PKG_VERSION"));

    let cli = CliOptions::parse(env::args().skip(1));
    if cli.help {
        print_usage();
        return Ok(());
    }

    let mut config = match cli.config.as_deref() {
        Some(path) => HostConfig::load_from_path(path),
        None => HostConfig::load(),
    };
    cli.apply(&mut config);

    info!(
        peers = config.session.peers,
        ticks = config.session.ticks,
        tick_rate_hz = config.session.tick_rate_hz,
        "Running loopback session"
    );
    let mut demo = DemoSession::new(config.rpc.clone(), &config.session)?;
    let summary = demo.run(config.session.ticks)?;

    let json = serde_json::to_string_pretty(&summary).context("Failed to encode session summary")?;
    println!("{json}");
    Ok(())
}

fn print_usage() {
    println!(
        "Usage: meshrpc [--config <path>] [--peers <n>] [--ticks <n>] [--traffic-log <path>]"
    );
}

#[derive(Debug, Default)]
struct CliOptions {
    help: bool,
    config: Option<PathBuf>,
    peers: Option<u16>,
    ticks: Option<u64>,
    traffic_log: Option<PathBuf>,
}

impl CliOptions {
    fn parse<I: Iterator<Item = String>>(mut args: I) -> Self {
        let mut opts = CliOptions::default();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--help" | "-h" => opts.help = true,
                "--config" => {
                    if let Some(path) = args.next() {
                        opts.config = Some(PathBuf::from(path));
                    } else {
                        tracing::error!("--config requires a file path");
                    }
                }
                "--peers" => {
                    if let Some(raw) = args.next() {
                        match raw.parse::<u16>() {
                            Ok(value) => opts.peers = Some(value),
                            Err(err) => {
                                tracing::error!(%err, value = %raw, "--peers must be an integer");
                            }
                        }
                    } else {
                        tracing::error!("--peers requires an integer");
                    }
                }
                "--ticks" => {
                    if let Some(raw) = args.next() {
                        match raw.parse::<u64>() {
                            Ok(value) => opts.ticks = Some(value),
                            Err(err) => {
                                tracing::error!(%err, value = %raw, "--ticks must be an integer");
                            }
                        }
                    } else {
                        tracing::error!("--ticks requires an integer");
                    }
                }
                "--traffic-log" => {
                    if let Some(path) = args.next() {
                        opts.traffic_log = Some(PathBuf::from(path));
                    } else {
                        tracing::error!("--traffic-log requires a file path");
                    }
                }
                other => tracing::warn!(arg = other, "Ignoring unknown argument"),
            }
        }

        opts
    }

    fn apply(&self, config: &mut HostConfig) {
        if let Some(peers) = self.peers {
            config.session.peers = peers;
        }
        if let Some(ticks) = self.ticks {
            config.session.ticks = ticks;
        }
        if let Some(path) = &self.traffic_log {
            config.session.traffic_log = Some(path.clone());
        }
    }
}

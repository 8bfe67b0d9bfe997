// src/main.rs

//! Entry point: parses the command line, loads the daemon configuration,
//! sets up reloadable logging, and hands off to `server::run`.

use anyhow::Result;
use quorumlb::config::DaemonConfig;
use quorumlb::server;
use std::env;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--version") {
        println!("quorumlb {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let mut config = match DaemonConfig::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    if args.iter().any(|a| a == "--dryrun") {
        for service in &mut config.services {
            service.dry_run = true;
        }
    }

    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if args.iter().any(|a| a == "--debug") {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    });

    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    let reload_handle = Arc::new(reload_handle);

    if let Err(e) = server::run(config, reload_handle).await {
        error!("quorumlb runtime error: {e}");
        return Err(e);
    }

    Ok(())
}

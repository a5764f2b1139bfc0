#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::Parser;
use courier::{Courier, CourierConfig, find_config_file};
use courier_common::logging;

/// Dispatch broker for publish/subscribe destinations
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(version)]
struct Cli {
    /// Configuration file, overriding the COURIER_CONFIG lookup
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => find_config_file()?,
    };
    let config = CourierConfig::load(&config_path)?;

    if cli.check {
        println!(
            "{}: {} destination(s), node {}",
            config_path.display(),
            config.destinations.len(),
            config.cluster.node_id
        );
        return Ok(());
    }

    logging::init();

    Courier::start(config).await?.run().await
}

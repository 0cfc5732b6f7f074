//! # EVO CANopen Binary
//!
//! CANopen master for CiA 402 drives.
//!
//! # Usage
//!
//! ```bash
//! # Run against the simulated bus
//! evo_canopen --config config/canopen.toml --simulate
//!
//! # Run with a specific transport driver
//! evo_canopen --config /etc/evo/canopen.toml --driver virtual
//!
//! # Verbose logging, skip node bring-up
//! evo_canopen -s -v --no-bringup
//! ```

use clap::Parser;
use evo_canopen::transport::virtual_bus;
use evo_canopen::{CanopenCore, TransportRegistry};
use evo_common::canopen::consts::DEFAULT_CONFIG_PATH;
use evo_common::consts::LOG_FILTER_ENV;
use evo_common::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Main-thread poll period while the loops run.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// EVO CANopen - CANopen master for CiA 402 drives
#[derive(Parser, Debug)]
#[command(name = "evo_canopen")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "CANopen master: NMT, CiA 402, SDO, SYNC/PDO and node guarding")]
#[command(long_about = None)]
struct Args {
    /// Path to the network configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the simulated bus (overrides --driver and the config)
    #[arg(short = 's', long)]
    simulate: bool,

    /// Transport driver (defaults to bus.driver from the config)
    #[arg(short, long)]
    driver: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    /// Start the loops without resetting and enabling the nodes
    #[arg(long)]
    no_bringup: bool,
}

fn main() {
    if let Err(e) = run() {
        error!("CANopen startup failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let loaded = CanopenCore::load_config(&args.config);
    let level = match (&loaded, args.verbose) {
        (_, true) => LogLevel::Debug,
        (Ok(config), false) => config.shared.log_level,
        (Err(_), false) => LogLevel::Info,
    };
    setup_tracing(&args, level);

    info!("EVO CANopen v{} starting...", env!("CARGO_PKG_VERSION"));

    let config: NetworkConfig = loaded?;
    info!(
        "Network: {} node(s) on {}, SYNC every {} ms",
        config.nodes.len(),
        config.bus.device,
        config.bus.sync_interval_ms
    );
    let driver = if args.simulate {
        info!("Simulation mode enabled");
        virtual_bus::DRIVER_NAME.to_string()
    } else {
        args.driver.clone().unwrap_or_else(|| config.bus.driver.clone())
    };

    let mut core = CanopenCore::new(config)?;
    let running = core.running_flag();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })?;

    core.open(&TransportRegistry::with_builtin(), &driver)?;
    core.start()?;

    if args.no_bringup {
        info!("Bring-up skipped");
    } else if let Err(e) = core.bring_up() {
        error!("Bring-up failed: {}", e);
        if let Err(stop) = core.shutdown() {
            error!("Loop error during shutdown: {}", stop);
        }
        return Err(e.into());
    }

    let running = core.running_flag();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(IDLE_POLL);
    }

    let stopped = core.shutdown();
    let snapshot = core.diagnostics();
    if args.json {
        info!("Diagnostics: {}", serde_json::to_string(&snapshot)?);
    } else {
        info!("Diagnostics: {:?}", snapshot);
    }
    stopped?;
    info!("EVO CANopen shutdown complete");
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments.
///
/// `RUST_LOG` overrides the level taken from the config file.
fn setup_tracing(args: &Args, level: LogLevel) {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    if args.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

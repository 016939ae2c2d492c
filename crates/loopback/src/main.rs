//! usg-loopback
//!
//! Example gadget: a vendor-specific device that echoes every bulk transfer
//! it receives on its OUT endpoint back to the host, byte-reversed, on its
//! IN endpoint.

mod config;
mod control;
mod device;
mod logging;
mod worker;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use clap::error::ErrorKind;
use config::LoopbackConfig;
use gadget::{GadgetFs, Session};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tracing::{error, info};
use worker::Loopback;

/// Vendor and product id of the emulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UsbIds {
    vendor: u16,
    product: u16,
}

fn parse_ids(s: &str) -> std::result::Result<UsbIds, String> {
    let (vendor, product) = s
        .split_once(':')
        .ok_or_else(|| format!("expected VEND:PROD, got '{}'", s))?;
    let hex = |part: &str| {
        let digits = part.trim_start_matches("0x").trim_start_matches("0X");
        u16::from_str_radix(digits, 16).map_err(|e| format!("invalid id '{}': {}", part, e))
    };
    Ok(UsbIds {
        vendor: hex(vendor)?,
        product: hex(product)?,
    })
}

#[derive(Parser, Debug)]
#[command(name = "usg-loopback")]
#[command(author, version, about = "USB gadget that echoes bulk transfers reversed")]
#[command(long_about = "
Registers a vendor-specific USB device with gadgetfs. Bytes the host writes
to the bulk OUT endpoint come back reversed on the bulk IN endpoint.

EXAMPLES:
    # Run as 0525:a4a0
    usg-loopback 0525:a4a0

    # Log every dispatched event
    usg-loopback --debug=1 0525:a4a0

CONFIGURATION:
    1. Path specified with --config
    2. ~/.config/usg/loopback.toml
    3. Built-in defaults
")]
struct Args {
    /// Vendor and product id in hex
    #[arg(value_name = "VEND:PROD", value_parser = parse_ids, required_unless_present = "save_config")]
    ids: Option<UsbIds>,

    /// Debug level (1 logs events, 2 logs raw control traffic)
    #[arg(short, long, value_name = "LEVEL", default_value_t = 0)]
    debug: u32,

    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    if args.save_config {
        let config = LoopbackConfig::default();
        let path = LoopbackConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config {
        Some(path) => LoopbackConfig::load(Some(path)).context("Failed to load configuration")?,
        None => LoopbackConfig::load_or_default(),
    };

    let log_level = logging::level_for_debug(args.debug).unwrap_or(config.logging.level.as_str());
    logging::setup_logging(log_level).context("Failed to setup logging")?;

    info!("usg-loopback v{}", env!("CARGO_PKG_VERSION"));

    let ids = args.ids.ok_or_else(|| anyhow!("VEND:PROD is required"))?;
    let session = Arc::new(open_session(&config, ids).context("Couldn't open device.")?);
    session.set_debug_level(args.debug);

    let mut loopback = Loopback::new(&config.device, &config.transfer);
    session.set_event_callback(move |session, event| loopback.handle_event(session, event));

    let shutdown = Arc::new(AtomicBool::new(false));
    let (exit_tx, exit_rx) = async_channel::bounded(1);
    let control = control::spawn_control_loop(session.clone(), shutdown.clone(), exit_tx)
        .context("Failed to spawn control loop")?;

    info!("Press Ctrl+C to shutdown");

    let result = tokio::select! {
        signal = signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(e) => error!("Error waiting for Ctrl+C: {}", e),
            }
            Ok(())
        }
        failure = exit_rx.recv() => match failure {
            Ok(reason) => Err(anyhow!("Control loop failed: {}", reason)),
            Err(_) => Ok(()),
        },
    };

    shutdown.store(true, Ordering::SeqCst);
    if let Err(e) = control.join() {
        error!("Control loop thread panicked: {:?}", e);
    }
    session.close();

    info!("Shutdown complete");
    result
}

fn open_session(config: &LoopbackConfig, ids: UsbIds) -> Result<Session> {
    let device = device::loopback_device(&config.device, ids.vendor, ids.product);

    let mut backend = GadgetFs::new(config.gadget_path()?);
    if let Some(controller) = &config.gadget.controller {
        backend = backend.with_controller(controller.clone());
    }

    let session = Session::open_with(&device, backend)?;
    info!(
        "Registered {:04x}:{:04x} with gadgetfs at {}",
        ids.vendor, ids.product, config.gadget.path
    );
    Ok(session)
}

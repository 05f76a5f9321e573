//! mausb-host daemon
//!
//! Registers the configured bus ids, binds matching USB devices for export
//! and serves the match_busid and command control endpoints until Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use common::{HostBridge, HostCommand, create_host_bridge, setup_logging};
use host::HostModule;
use host::config::{self, HostConfig};
use host::control::{CommandChannel, ControlHandler, SpawnLauncher, serve};
use host::service;
use host::usb::{BindPolicy, spawn_usb_worker};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mausb-host")]
#[command(author, version, about = "MA-USB host - export local USB devices")]
#[command(long_about = "
Host-side control plane for exporting local USB devices over MA-USB.

EXAMPLES:
    # Run with default config
    mausb-host

    # Run with custom config
    mausb-host --config /path/to/host.toml

    # List USB devices and their bus ids
    mausb-host --list-devices

    # Run with debug logging
    mausb-host --log-level debug

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/mausb-host/host.toml
    3. /etc/mausb-host/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Run as systemd service
    #[arg(long)]
    service: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config {
        Some(ref path) => config::load_config(&path.to_string_lossy())
            .context("Failed to load configuration")?,
        None => HostConfig::load_or_default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("mausb-host v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let exported = config.exported_busids()?;
    let mut module =
        HostModule::init(&config.pool, &exported).context("Failed to initialize host module")?;

    // Listing only enumerates; it must not detach drivers or claim interfaces
    let policy = if args.list_devices {
        BindPolicy::ListOnly
    } else {
        BindPolicy::Bind
    };
    let (bridge, worker) = create_host_bridge();
    let usb_worker_handle = spawn_usb_worker(worker, module.matcher().clone(), policy)
        .context("Failed to spawn USB worker thread")?;

    let result = if args.list_devices {
        list_devices_mode(bridge.clone()).await
    } else {
        if args.service || config.host.service_mode {
            info!("Running in service mode");
        }
        run(&config, &mut module, bridge.clone()).await
    };

    // Endpoints go first so no request races the teardown below
    module.unregister_endpoints();

    info!("Shutting down USB subsystem...");
    if let Err(e) = shutdown_usb_worker(&bridge).await {
        error!("Error shutting down USB worker: {:#}", e);
    }
    match usb_worker_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("USB worker exited with error: {}", e),
        Err(e) => error!("USB worker thread panicked: {:?}", e),
    }

    let report = module.shutdown();
    if report.leaked_objects > 0 {
        warn!("{} cache objects were still live at shutdown", report.leaked_objects);
    }

    result
}

/// List USB devices and exit
async fn list_devices_mode(bridge: HostBridge) -> Result<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(HostCommand::ListDevices { response: tx })
        .await
        .context("Failed to send ListDevices command")?;

    let devices = rx.await.context("Failed to receive device list")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {:<12} {:04x}:{:04x}  Bus {:03} Device {:03}{}",
            device.busid,
            device.vendor_id,
            device.product_id,
            device.bus_number,
            device.device_address,
            if device.exported { "  [exported]" } else { "" }
        );
    }

    Ok(())
}

/// Serve the control endpoints until Ctrl+C
async fn run(config: &HostConfig, module: &mut HostModule, bridge: HostBridge) -> Result<()> {
    let attribute = serve(
        &config.control.attribute_path(),
        ControlHandler::Attribute {
            attribute: module.attribute(),
            rescan: Some(bridge.clone()),
        },
    )?;
    module.register_endpoint(attribute);

    let commands = Arc::new(CommandChannel::new(
        config.helpers.clone(),
        Arc::new(SpawnLauncher),
    ));
    let command = serve(&config.control.command_path(), ControlHandler::Command(commands))?;
    module.register_endpoint(command);

    let events = tokio::spawn(log_events(bridge));

    if service::is_systemd() {
        info!("Running under systemd");
    }
    let watchdog = service::spawn_watchdog_task();
    service::notify_ready().context("Failed to notify systemd ready")?;
    service::notify_status(&format!(
        "Serving {} registered bus ids",
        module.registry().len()
    ))
    .context("Failed to send status to systemd")?;

    info!("Press Ctrl+C to shutdown");
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    service::notify_stopping().context("Failed to notify systemd stopping")?;
    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }
    events.abort();

    Ok(())
}

async fn log_events(bridge: HostBridge) {
    while let Ok(event) = bridge.recv_event().await {
        info!("{:?}", event);
    }
}

/// Shutdown USB worker thread gracefully
async fn shutdown_usb_worker(bridge: &HostBridge) -> Result<()> {
    bridge
        .send_command(HostCommand::Shutdown)
        .await
        .context("Failed to send Shutdown command")?;
    Ok(())
}

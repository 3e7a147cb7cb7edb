//! Prints kernel uevents as the hotplug subsystem decodes them.

use std::path::PathBuf;

use anyhow::{Context, Result};
use arcbox_hotplug::devnode::coldboot_candidates;
use arcbox_hotplug::linux::{UeventSocket, KERNEL_GROUP, UDEV_GROUP};
use arcbox_hotplug::monitor::{self, UeventHandler};
use arcbox_hotplug::{HotplugConfig, UeventMessage};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "arcbox-uevent-monitor")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Additional configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also show udev-monitor broadcasts.
    #[arg(long)]
    udev: bool,

    /// List the devices a coldboot walk of this sysfs devices tree would
    /// trigger, then exit.
    #[arg(long, value_name = "DIR")]
    coldboot: Option<PathBuf>,
}

/// Logs every decoded message.
struct EventLogger;

impl UeventHandler for EventLogger {
    fn handle(&mut self, raw: &[u8]) {
        match UeventMessage::decode(raw) {
            Ok(event) => info!(
                kernel = event.is_kernel(),
                action = event.action(),
                subsystem = event.subsystem(),
                devname = event.devname(),
                major = event.major(),
                minor = event.minor(),
                "{}",
                event.devpath()
            ),
            Err(e) => debug!("Undecodable message ({} bytes): {}", raw.len(), e),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arcbox_hotplug=info,arcbox_uevent_monitor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(Args::parse()).await
}

async fn run(args: Args) -> Result<()> {
    if let Some(dir) = args.coldboot {
        return list_coldboot(&dir);
    }

    let config = match &args.config {
        Some(path) => HotplugConfig::load_from(path),
        None => HotplugConfig::load(),
    }
    .context("Failed to load hotplug configuration")?;

    let mut groups = KERNEL_GROUP;
    if args.udev || config.udev_monitor {
        groups |= UDEV_GROUP;
    }
    let socket = UeventSocket::open(groups, config.receive_buffer_size)
        .context("Failed to open uevent socket")?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
        }
        shutdown.cancel();
    });

    monitor::run(socket, &mut EventLogger, config.settle_interval(), cancel)
        .await
        .context("Uevent monitor failed")
}

fn list_coldboot(dir: &std::path::Path) -> Result<()> {
    let candidates = coldboot_candidates(dir)
        .with_context(|| format!("Failed to walk {}", dir.display()))?;
    for candidate in &candidates {
        println!(
            "{}:{}\t{}",
            candidate.major,
            candidate.minor,
            candidate.uevent_path.display()
        );
    }
    info!(devices = candidates.len(), "Coldboot walk finished");
    Ok(())
}

//! Single-threaded uevent reactor.
//!
//! Waits on socket readability, a settle tick and cancellation. Every
//! callback runs to completion before the next one starts.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::linux::{is_trusted_sender, UeventSocket};
use crate::subsystem::HotplugSubsystem;
use crate::uevent::UEVENT_BUFFER_SIZE;

/// Consumer of raw uevent datagrams.
pub trait UeventHandler {
    /// Handles one datagram.
    fn handle(&mut self, raw: &[u8]);

    /// Called on every settle tick.
    fn tick(&mut self) {}
}

/// Shared subsystem as driven by the reactor.
impl UeventHandler for Arc<Mutex<HotplugSubsystem>> {
    fn handle(&mut self, raw: &[u8]) {
        let mut subsystem = self.lock().unwrap_or_else(PoisonError::into_inner);
        match subsystem.handle_message(raw) {
            Ok(()) => {}
            Err(e) if e.is_malformed() => debug!("Dropping uevent: {}", e),
            Err(e) => warn!("Could not handle uevent: {}", e),
        }
    }

    fn tick(&mut self) {
        let mut subsystem = self.lock().unwrap_or_else(PoisonError::into_inner);
        if subsystem.pending_netifs() > 0 {
            subsystem.poll_pending_netifs();
        }
    }
}

/// Reads uevents from `socket` until `cancel` fires.
///
/// # Errors
///
/// Returns an error if the socket cannot be registered with the runtime
/// or polling it fails.
pub async fn run<H: UeventHandler>(
    socket: UeventSocket,
    handler: &mut H,
    settle_interval: Duration,
    cancel: CancellationToken,
) -> io::Result<()> {
    let socket = AsyncFd::new(socket)?;
    let mut buf = vec![0u8; UEVENT_BUFFER_SIZE];

    let mut settle = tokio::time::interval(settle_interval);
    settle.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Uevent monitor started");

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                info!("Uevent monitor shutting down");
                break;
            }

            readable = socket.readable() => {
                let mut guard = readable?;
                match guard.try_io(|inner| inner.get_ref().recv(&mut buf)) {
                    Ok(Ok((len, sender))) => {
                        let raw = &buf[..len];
                        if is_trusted_sender(raw, sender) {
                            handler.handle(raw);
                        } else {
                            warn!(sender, len, "Dropping uevent not sent by the kernel");
                        }
                    }
                    Ok(Err(e)) => warn!("Could not read uevent: {}", e),
                    Err(_would_block) => continue,
                }
            }

            _ = settle.tick() => handler.tick(),
        }
    }

    Ok(())
}

//! USB hotplug resolution.
//!
//! Matches `usb_device` events against the registered USB mappings and
//! grants or revokes device cgroup access for the owning containers.

use std::fs;
use std::io;

use tracing::{debug, info, trace, warn};

use crate::subsystem::HotplugSubsystem;
use crate::uevent::UeventMessage;

/// Outcome of a resolver for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fully handled; no node creation or forwarding for this event.
    Consumed,
    /// Not handled; general dispatch still runs.
    Continue,
}

impl HotplugSubsystem {
    /// Resolves a USB device event against the mapping table.
    pub(crate) fn handle_usb_event(&mut self, event: &UeventMessage) -> Disposition {
        if event.subsystem() != "usb" || event.devtype() != "usb_device" {
            return Disposition::Continue;
        }

        match event.action() {
            "remove" => self.usb_remove(event),
            "add" => self.usb_add(event),
            _ => Disposition::Continue,
        }
    }

    fn usb_remove(&mut self, event: &UeventMessage) -> Disposition {
        if self.tokens.detach(event.devpath()) {
            debug!(devpath = event.devpath(), "Handled token detachment");
            return Disposition::Consumed;
        }

        let devnum = (event.major(), event.minor());
        for mapping in self.mappings.usb() {
            if !mapping.device.is_bound() || mapping.device.devnum() != devnum {
                continue;
            }
            info!(
                container = %mapping.container,
                device = %mapping.device,
                "Denying access to unplugged usb device"
            );
            if let Err(e) = self.host.device_deny(&mapping.container, devnum.0, devnum.1) {
                warn!(
                    container = %mapping.container,
                    "Could not deny access to {}:{}: {}", devnum.0, devnum.1, e
                );
            }
        }

        Disposition::Continue
    }

    fn usb_add(&mut self, event: &UeventMessage) -> Disposition {
        let serial_path = self.config.sysfs_path(event.devpath()).join("serial");
        let serial = match read_serial(&serial_path) {
            Ok(s) if !s.is_empty() => s,
            Ok(_) => {
                trace!(path = %serial_path.display(), "Empty usb serial");
                return Disposition::Continue;
            }
            Err(e) => {
                trace!(path = %serial_path.display(), "No usb serial: {}", e);
                return Disposition::Continue;
            }
        };

        if self.tokens.attach(&serial, event.devpath()) {
            debug!(serial = %serial, "Handled token attachment");
            return Disposition::Consumed;
        }

        let (vendor, product) = event.usb_ids();
        let devnum = (event.major(), event.minor());
        debug!(
            "Got new usb device {:04x}:{:04x} serial {} ({}:{})",
            vendor, product, serial, devnum.0, devnum.1
        );

        let host = &self.host;
        for mapping in self.mappings.usb_mut() {
            if !mapping.device.matches(vendor, product, &serial) {
                continue;
            }
            mapping.device.bind(devnum.0, devnum.1);
            info!(
                container = %mapping.container,
                device = %mapping.device,
                assign = mapping.device.assign,
                "Allowing access to usb device"
            );
            if let Err(e) =
                host.device_allow(&mapping.container, devnum.0, devnum.1, mapping.device.assign)
            {
                warn!(
                    container = %mapping.container,
                    "Could not allow access to {}:{}: {}", devnum.0, devnum.1, e
                );
            }
        }

        Disposition::Continue
    }
}

/// Reads a sysfs `serial` attribute, dropping one trailing newline.
fn read_serial(path: &std::path::Path) -> io::Result<String> {
    let mut serial = fs::read_to_string(path)?;
    if serial.ends_with('\n') {
        serial.pop();
    }
    Ok(serial)
}

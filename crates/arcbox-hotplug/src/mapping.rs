//! Device mapping registry.
//!
//! Tracks which USB devices and physical network interfaces are passed
//! through to which container. Entries are maintained out-of-band by the
//! container lifecycle (start registers, stop unregisters) and consulted by
//! the USB resolver and the interface migrator. Duplicate registrations are
//! kept; every duplicate matches.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{HotplugError, Result};
use crate::host::ContainerId;

/// A 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Returns the raw octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = HotplugError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);

        for octet in &mut octets {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| HotplugError::InvalidMac(s.to_string()))?;
            *octet =
                u8::from_str_radix(part, 16).map_err(|_| HotplugError::InvalidMac(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(HotplugError::InvalidMac(s.to_string()));
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Physical network interface configuration of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnetConfig {
    /// Interface selector: an interface name or a MAC address string.
    pub name: String,
    /// Keep the physical interface on the host behind a filtering bridge.
    #[serde(default)]
    pub mac_filter: bool,
}

impl PnetConfig {
    /// Creates a configuration for moving an interface as-is.
    #[must_use]
    pub fn new(name: impl Into<String>, mac_filter: bool) -> Self {
        Self {
            name: name.into(),
            mac_filter,
        }
    }
}

/// USB device passed through to a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB vendor id.
    pub vendor: u16,
    /// USB product id.
    pub product: u16,
    /// iSerial string.
    pub serial: String,
    /// Exclusive assignment instead of shared allow-listing.
    pub assign: bool,
    major: i32,
    minor: i32,
}

impl UsbDevice {
    /// Creates a descriptor that is not yet bound to a device node.
    #[must_use]
    pub fn new(vendor: u16, product: u16, serial: impl Into<String>, assign: bool) -> Self {
        Self {
            vendor,
            product,
            serial: serial.into(),
            assign,
            major: -1,
            minor: -1,
        }
    }

    /// Resolved `(major, minor)`, `(-1, -1)` until the device shows up.
    #[must_use]
    pub const fn devnum(&self) -> (i32, i32) {
        (self.major, self.minor)
    }

    /// Returns true once a device node number has been bound.
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.major >= 0 && self.minor >= 0
    }

    /// Binds the device node number seen on the bus.
    pub fn bind(&mut self, major: i32, minor: i32) {
        self.major = major;
        self.minor = minor;
    }

    /// Returns true if vendor, product and serial all match exactly.
    #[must_use]
    pub fn matches(&self, vendor: u16, product: u16, serial: &str) -> bool {
        self.vendor == vendor && self.product == product && self.serial == serial
    }
}

impl fmt::Display for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} '{}' [c {}:{}]",
            self.vendor, self.product, self.serial, self.major, self.minor
        )
    }
}

/// A USB device mapped to a container.
#[derive(Debug, Clone)]
pub struct UsbMapping {
    /// Owning container.
    pub container: ContainerId,
    /// Device descriptor; its devnum is updated as the device comes and goes.
    pub device: UsbDevice,
}

/// A physical network interface mapped to a container by MAC.
#[derive(Debug, Clone)]
pub struct NetdevMapping {
    /// Owning container.
    pub container: ContainerId,
    /// Interface configuration.
    pub pnet: PnetConfig,
    /// MAC the selector resolved to.
    pub mac: MacAddr,
}

impl NetdevMapping {
    /// Creates a mapping; the selector must be a MAC address string.
    ///
    /// # Errors
    ///
    /// Returns [`HotplugError::InvalidMac`] if the selector is not a MAC.
    pub fn new(container: ContainerId, pnet: PnetConfig) -> Result<Self> {
        let mac = pnet.name.parse()?;
        Ok(Self {
            container,
            pnet,
            mac,
        })
    }
}

/// Registry of container ↔ device associations.
#[derive(Debug, Default)]
pub struct DeviceMappings {
    usb: Vec<UsbMapping>,
    net: Vec<NetdevMapping>,
}

impl DeviceMappings {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a USB device to a container.
    pub fn register_usb(&mut self, container: &ContainerId, device: &UsbDevice) {
        info!(
            container = %container,
            device = %device,
            assign = device.assign,
            "Registered usb device"
        );
        self.usb.push(UsbMapping {
            container: container.clone(),
            device: device.clone(),
        });
    }

    /// Removes the first mapping of `device` for `container`.
    ///
    /// # Errors
    ///
    /// Returns [`HotplugError::MappingNotFound`] if no mapping matches.
    pub fn unregister_usb(&mut self, container: &ContainerId, device: &UsbDevice) -> Result<UsbDevice> {
        let pos = self
            .usb
            .iter()
            .position(|m| {
                &m.container == container
                    && m.device.matches(device.vendor, device.product, &device.serial)
            })
            .ok_or_else(|| {
                HotplugError::MappingNotFound(format!("usb device {device} for {container}"))
            })?;

        let removed = self.usb.remove(pos);
        info!(
            container = %container,
            device = %removed.device,
            "Unregistered usb device"
        );
        Ok(removed.device)
    }

    /// Maps a physical interface, selected by MAC, to a container.
    ///
    /// # Errors
    ///
    /// Returns [`HotplugError::InvalidMac`] if the selector is not a MAC.
    pub fn register_net(&mut self, container: &ContainerId, pnet: &PnetConfig) -> Result<MacAddr> {
        let mapping = NetdevMapping::new(container.clone(), pnet.clone())?;
        let mac = mapping.mac;
        info!(container = %container, mac = %mac, "Registered netdev");
        self.net.push(mapping);
        Ok(mac)
    }

    /// Removes the first netdev mapping of `mac` for `container`.
    ///
    /// # Errors
    ///
    /// Returns [`HotplugError::MappingNotFound`] if no mapping matches.
    pub fn unregister_net(&mut self, container: &ContainerId, mac: MacAddr) -> Result<()> {
        let pos = self
            .net
            .iter()
            .position(|m| &m.container == container && m.mac == mac)
            .ok_or_else(|| HotplugError::MappingNotFound(format!("netdev {mac} for {container}")))?;

        self.net.remove(pos);
        info!(container = %container, mac = %mac, "Unregistered netdev");
        Ok(())
    }

    /// USB mappings in registration order.
    #[must_use]
    pub fn usb(&self) -> &[UsbMapping] {
        &self.usb
    }

    pub(crate) fn usb_mut(&mut self) -> &mut [UsbMapping] {
        &mut self.usb
    }

    /// Netdev mappings in registration order.
    #[must_use]
    pub fn net(&self) -> &[NetdevMapping] {
        &self.net
    }

    /// First netdev mapping for `mac`.
    #[must_use]
    pub fn find_net(&self, mac: MacAddr) -> Option<&NetdevMapping> {
        self.net.iter().find(|m| m.mac == mac)
    }
}

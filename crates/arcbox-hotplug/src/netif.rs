//! Physical network interface migration.
//!
//! A physical NIC that appears on the host is renamed to a collision-free
//! `cml{eth,wlan}N` name, matched against the netdev mappings by MAC (falling
//! back to the core container) and moved into the target container's network
//! namespace. The renamed `add` event is then replayed inside that namespace
//! so the container's own udev sees the interface under its new name.
//!
//! Wireless interfaces are not classifiable until sysfs has settled, so new
//! interfaces are parked in a pending queue that the reactor polls on a short
//! interval.

use tracing::{debug, error, info, warn};

use crate::error::{HotplugError, Result};
use crate::host::{ContainerId, NetInterfaces};
use crate::mapping::PnetConfig;
use crate::subsystem::HotplugSubsystem;
use crate::uevent::{UeventField, UeventMessage};

const RENAME_PREFIX: &str = "cml";

/// Naming class of a physical interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Wired ethernet.
    Eth,
    /// Wireless LAN.
    Wlan,
}

impl InterfaceKind {
    /// Name infix.
    #[must_use]
    pub const fn infix(self) -> &'static str {
        match self {
            Self::Eth => "eth",
            Self::Wlan => "wlan",
        }
    }

    /// Kind implied by a net uevent `DEVTYPE`.
    #[must_use]
    pub fn from_devtype(devtype: &str) -> Self {
        if devtype == "wlan" { Self::Wlan } else { Self::Eth }
    }
}

/// Hands out `cml{eth,wlan}N` names.
///
/// One counter per kind; counters only move forward, so a name is never
/// handed out twice during the lifetime of the subsystem, even if the
/// rename it was generated for failed.
#[derive(Debug, Default)]
pub struct InterfaceRenamer {
    eth: u32,
    wlan: u32,
}

impl InterfaceRenamer {
    /// Creates a renamer with both counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the next name for `kind`.
    pub fn next_name(&mut self, kind: InterfaceKind) -> String {
        let idx = match kind {
            InterfaceKind::Eth => &mut self.eth,
            InterfaceKind::Wlan => &mut self.wlan,
        };
        let name = format!("{RENAME_PREFIX}{}{}", kind.infix(), *idx);
        *idx += 1;
        name
    }

    /// Renames `old` on the host to the next name for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`HotplugError::Rename`] if the host rename fails; the
    /// reserved name is not reused.
    pub fn rename(
        &mut self,
        net: &dyn NetInterfaces,
        old: &str,
        kind: InterfaceKind,
    ) -> Result<String> {
        let new = self.next_name(kind);
        rename_host(net, old, &new)?;
        Ok(new)
    }
}

fn rename_host(net: &dyn NetInterfaces, old: &str, new: &str) -> Result<()> {
    info!("Renaming {} to {}", old, new);
    net.rename(old, new)
        .map_err(|e| HotplugError::Rename(format!("{old} -> {new}: {e}")))
}

/// Host-visible physical interface names.
#[derive(Debug, Default, Clone)]
pub struct PhysicalInterfaces {
    names: Vec<String>,
}

impl PhysicalInterfaces {
    /// Creates a registry from the interfaces found at startup.
    #[must_use]
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            names: names.into_iter().collect(),
        }
    }

    /// Adds a name if it is not tracked yet.
    pub fn add(&mut self, name: &str) {
        if !self.contains(name) {
            self.names.push(name.to_string());
        }
    }

    /// Removes a name; returns false if it was not tracked.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.names.len();
        self.names.retain(|n| n != name);
        self.names.len() != before
    }

    /// Replaces `old` with `new` in place; returns false if `old` was not tracked.
    pub fn rename(&mut self, old: &str, new: &str) -> bool {
        match self.names.iter_mut().find(|n| n.as_str() == old) {
            Some(n) => {
                *n = new.to_string();
                true
            }
            None => false,
        }
    }

    /// Whether `name` is tracked.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Tracked names in insertion order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A net `add` event waiting for sysfs to settle.
#[derive(Debug, Clone)]
pub(crate) struct PendingNetif {
    pub(crate) event: UeventMessage,
    pub(crate) attempts: u32,
}

/// Replaces the last occurrence of `old` in `haystack`.
///
/// The interface name is the final component of a net devpath, so the last
/// occurrence is the one to rewrite.
#[must_use]
pub fn replace_last(haystack: &str, old: &str, new: &str) -> Option<String> {
    if old.is_empty() {
        return None;
    }
    let pos = haystack.rfind(old)?;
    let mut out = String::with_capacity(haystack.len() + new.len());
    out.push_str(&haystack[..pos]);
    out.push_str(new);
    out.push_str(&haystack[pos + old.len()..]);
    Some(out)
}

impl HotplugSubsystem {
    /// Whether a kernel event announces a new physical NIC to migrate.
    pub(crate) fn is_physical_net_add(&self, event: &UeventMessage) -> bool {
        event.action() == "add"
            && event.subsystem() == "net"
            && !event.devpath().contains("virtual")
            && !self.host.is_hosted_mode()
    }

    /// Records a new interface and parks its event until sysfs is ready.
    pub(crate) fn defer_netif(&mut self, event: &UeventMessage) {
        self.phys.add(event.interface());
        debug!(
            ifname = event.interface(),
            "Deferring new physical interface until sysfs settles"
        );
        self.pending.push(PendingNetif {
            event: event.clone(),
            attempts: 0,
        });
    }

    /// Number of interfaces waiting for sysfs.
    #[must_use]
    pub fn pending_netifs(&self) -> usize {
        self.pending.len()
    }

    /// Runs one settle tick over every pending interface.
    ///
    /// Interfaces that are ready are migrated (successfully or not) and
    /// leave the queue. Wireless interfaces sysfs does not yet report as
    /// wireless stay queued until `netif_settle_max_attempts` is reached.
    /// Returns the number of interfaces still pending.
    pub fn poll_pending_netifs(&mut self) -> usize {
        let max_attempts = self.config.netif_settle_max_attempts;
        let pending = std::mem::take(&mut self.pending);

        for mut entry in pending {
            let event = &entry.event;
            if event.devtype() == "wlan" && !self.net.is_wifi(event.interface()) {
                entry.attempts += 1;
                if entry.attempts >= max_attempts {
                    warn!(
                        ifname = event.interface(),
                        attempts = entry.attempts,
                        "Interface never became ready in sysfs, leaving it on the host"
                    );
                } else {
                    self.pending.push(entry);
                }
                continue;
            }

            match self.netdev_move(event) {
                Ok(container) => info!(container = %container, "Moved net interface to target"),
                Err(e) => warn!(ifname = event.interface(), "Did not move net interface: {}", e),
            }
        }

        self.pending.len()
    }

    /// Moves the interface named by `event` into its target container.
    pub(crate) fn netdev_move(&mut self, event: &UeventMessage) -> Result<ContainerId> {
        let ifname = event.interface();
        let mac = self.net.mac_address(ifname).map_err(|e| {
            error!(ifname, "Interface with no mac, skipping: {}", e);
            e
        })?;

        let (target, pnet) = match self.mappings.find_net(mac) {
            Some(mapping) => (
                self.host.container(&mapping.container),
                Some(mapping.pnet.clone()),
            ),
            None => (self.host.core_container(), None),
        };
        let target = target.ok_or_else(|| {
            HotplugError::InvalidState(format!("no target container for {ifname} ({mac})"))
        })?;

        if !target.state.accepts_netif() {
            warn!(
                container = %target.name,
                state = %target.state,
                "Target container is not running, skip moving {}", ifname
            );
            return Err(HotplugError::InvalidState(format!(
                "container {} is {}",
                target.name, target.state
            )));
        }

        let kind = InterfaceKind::from_devtype(event.devtype());
        let renamed = self.rename_event_interface(event, kind)?;
        let pnet = pnet.unwrap_or_else(|| PnetConfig::new(renamed.interface(), false));

        self.host.add_net_iface(&target.id, &pnet).map_err(|e| {
            error!("Cannot move '{}' to {}: {}", mac, target.name, e);
            HotplugError::Host(e)
        })?;
        info!(
            "Moved phys network interface '{}' (mac: {}) to {}",
            renamed.interface(),
            mac,
            target.name
        );

        // A filtered interface stays on the host behind a bridge; the
        // container never sees the physical device.
        if pnet.mac_filter {
            return Ok(target.id);
        }

        match self
            .injector
            .inject(renamed.as_bytes(), target.pid, target.has_userns)
        {
            Ok(()) => debug!(container = %target.name, "Injected uevent into netns"),
            Err(e) => warn!(
                container = %target.name,
                "Could not inject uevent into netns: {}", e
            ),
        }

        Ok(target.id)
    }

    /// Renames the host interface and rewrites `INTERFACE` and `DEVPATH`.
    ///
    /// The rewritten event is built before the host rename, so a devpath
    /// that does not carry the interface name leaves the host untouched.
    fn rename_event_interface(
        &mut self,
        event: &UeventMessage,
        kind: InterfaceKind,
    ) -> Result<UeventMessage> {
        let old = event.interface();
        let new = self.renamer.next_name(kind);

        let devpath = replace_last(event.devpath(), old, &new).ok_or_else(|| {
            HotplugError::InvalidReplacement(format!(
                "{old} not found in devpath {}",
                event.devpath()
            ))
        })?;
        let renamed = event
            .replace_field(UeventField::Interface, &new)?
            .replace_field(UeventField::Devpath, &devpath)?;

        rename_host(self.net.as_ref(), old, &new)?;
        if !self.phys.rename(old, &new) {
            self.phys.add(&new);
        }

        debug!(ifname = %new, devpath = %devpath, "Injected renamed interface into uevent");
        Ok(renamed)
    }

    /// Renames every tracked physical interface to the `cml` scheme.
    pub(crate) fn rename_existing_interfaces(&mut self) {
        let names = self.phys.names().to_vec();
        for old in names {
            let kind = if self.net.is_wifi(&old) {
                InterfaceKind::Wlan
            } else {
                InterfaceKind::Eth
            };
            match self.renamer.rename(self.net.as_ref(), &old, kind) {
                Ok(new) => {
                    self.phys.rename(&old, &new);
                }
                Err(e) => error!("Failed to rename interface {}: {}", old, e),
            }
        }
    }
}

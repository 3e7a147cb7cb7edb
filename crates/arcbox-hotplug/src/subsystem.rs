//! Hotplug subsystem context and event dispatch.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::HotplugConfig;
use crate::error::Result;
use crate::host::{
    ContainerHost, ContainerId, NamespaceInjector, NetInterfaces, NoTokens, TokenSubsystem,
};
use crate::mapping::{DeviceMappings, MacAddr, PnetConfig, UsbDevice};
use crate::netif::{InterfaceRenamer, PendingNetif, PhysicalInterfaces};
use crate::uevent::{UeventField, UeventMessage};
use crate::usb::Disposition;

/// Mutable state of the hotplug subsystem plus its collaborators.
///
/// All registries and the rename counters live here; every component
/// receives the context explicitly. Share it behind a mutex when lifecycle
/// callers run on other threads than the reactor.
pub struct HotplugSubsystem {
    pub(crate) config: HotplugConfig,
    pub(crate) host: Arc<dyn ContainerHost>,
    pub(crate) tokens: Arc<dyn TokenSubsystem>,
    pub(crate) net: Arc<dyn NetInterfaces>,
    pub(crate) injector: Arc<dyn NamespaceInjector>,
    pub(crate) mappings: DeviceMappings,
    pub(crate) renamer: InterfaceRenamer,
    pub(crate) phys: PhysicalInterfaces,
    pub(crate) pending: Vec<PendingNetif>,
}

impl fmt::Debug for HotplugSubsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotplugSubsystem")
            .field("config", &self.config)
            .field("mappings", &self.mappings)
            .field("renamer", &self.renamer)
            .field("phys", &self.phys)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl HotplugSubsystem {
    /// Creates a subsystem with no token subsystem and no known interfaces.
    #[must_use]
    pub fn new(
        config: HotplugConfig,
        host: Arc<dyn ContainerHost>,
        net: Arc<dyn NetInterfaces>,
        injector: Arc<dyn NamespaceInjector>,
    ) -> Self {
        Self {
            config,
            host,
            tokens: Arc::new(NoTokens),
            net,
            injector,
            mappings: DeviceMappings::new(),
            renamer: InterfaceRenamer::new(),
            phys: PhysicalInterfaces::default(),
            pending: Vec::new(),
        }
    }

    /// Sets the security token collaborator.
    #[must_use]
    pub fn with_tokens(mut self, tokens: Arc<dyn TokenSubsystem>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Seeds the physical interface registry.
    #[must_use]
    pub fn with_physical_interfaces(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.phys = PhysicalInterfaces::new(names);
        self
    }

    /// Renames the interfaces present at startup to the `cml` scheme.
    ///
    /// Call once before the uevent socket starts delivering events.
    pub fn init(&mut self) {
        info!(
            interfaces = self.phys.names().len(),
            "Initializing hotplug subsystem"
        );
        self.rename_existing_interfaces();
    }

    /// Drops pending interface migrations.
    pub fn deinit(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                pending = self.pending.len(),
                "Dropping interfaces still waiting for sysfs"
            );
        }
        self.pending.clear();
        info!("Hotplug subsystem stopped");
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &HotplugConfig {
        &self.config
    }

    /// Registered device mappings.
    #[must_use]
    pub const fn mappings(&self) -> &DeviceMappings {
        &self.mappings
    }

    /// Host physical interface registry.
    #[must_use]
    pub const fn physical_interfaces(&self) -> &PhysicalInterfaces {
        &self.phys
    }

    /// Maps a USB device to a container.
    pub fn register_usb(&mut self, container: &ContainerId, device: &UsbDevice) {
        self.mappings.register_usb(container, device);
    }

    /// Removes a USB mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if no mapping matches.
    pub fn unregister_usb(&mut self, container: &ContainerId, device: &UsbDevice) -> Result<UsbDevice> {
        self.mappings.unregister_usb(container, device)
    }

    /// Maps a physical interface to a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the selector is not a MAC address.
    pub fn register_net(&mut self, container: &ContainerId, pnet: &PnetConfig) -> Result<MacAddr> {
        self.mappings.register_net(container, pnet)
    }

    /// Removes a netdev mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if no mapping matches.
    pub fn unregister_net(&mut self, container: &ContainerId, mac: MacAddr) -> Result<()> {
        self.mappings.unregister_net(container, mac)
    }

    /// Decodes one datagram from the uevent socket and dispatches it.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram is not a valid uevent. Failures
    /// while handling a valid event are logged, not returned.
    pub fn handle_message(&mut self, buf: &[u8]) -> Result<()> {
        let event = UeventMessage::decode(buf)?;
        if event.is_kernel() {
            self.handle_kernel_event(&event);
        } else {
            trace!(
                action = event.action(),
                devpath = event.devpath(),
                "Ignoring udev-monitor message"
            );
        }
        Ok(())
    }

    /// Dispatches a decoded kernel event.
    pub fn handle_kernel_event(&mut self, event: &UeventMessage) {
        if !matches!(event.action(), "add" | "remove" | "change") {
            trace!(action = event.action(), "Ignoring uevent action");
            return;
        }

        if self.handle_usb_event(event) == Disposition::Consumed {
            trace!("Event fully handled by usb resolver");
            return;
        }

        if let Some(container) = Uuid::parse_str(event.synth_uuid())
            .ok()
            .and_then(|uuid| self.host.container_by_uuid(&uuid))
        {
            trace!(synth_uuid = event.synth_uuid(), "Got synthetic uevent");
            let forwarded = match event.replace_field(UeventField::SynthUuid, "0") {
                Ok(e) => e,
                Err(e) => {
                    error!("Failed to mask out container uuid from SYNTH_UUID: {}", e);
                    return;
                }
            };
            if let Err(e) = self.device_node_and_forward(&forwarded, &container) {
                error!(container = %container.name, "Could not handle synthetic uevent: {}", e);
            }
            return;
        }

        if self.is_physical_net_add(event) {
            self.defer_netif(event);
            return;
        }

        debug!(
            action = event.action(),
            devpath = event.devpath(),
            "Forwarding uevent to containers"
        );
        for container in self.host.containers() {
            if let Err(e) = self.device_node_and_forward(event, &container) {
                error!(container = %container.name, "Could not forward uevent: {}", e);
            }
        }
    }
}

//! Interfaces to the collaborators around the hotplug subsystem.
//!
//! The container lifecycle, the security token subsystem, host network
//! interface helpers and the namespace injection primitive are all reached
//! through traits so the event logic can run against real kernel plumbing
//! (see [`crate::linux`]) or against mocks in tests.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{InjectError, Result};
use crate::mapping::{MacAddr, PnetConfig};

/// Container identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container ID from a string.
    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the ID as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Container lifecycle state as reported by the container host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Not running.
    Stopped,
    /// Start requested.
    Starting,
    /// Init is running, services still coming up.
    Booting,
    /// Fully up.
    Running,
    /// Freeze requested.
    Freezing,
    /// Frozen.
    Frozen,
    /// Exited but not yet reaped.
    Zombie,
    /// Stop requested.
    ShuttingDown,
    /// Running in setup mode.
    Setup,
    /// Restart in progress.
    Rebooting,
}

impl ContainerState {
    /// States in which a physical interface may be moved in.
    #[must_use]
    pub const fn accepts_netif(self) -> bool {
        matches!(self, Self::Booting | Self::Running | Self::Starting)
    }

    /// States in which device nodes are materialized and events forwarded.
    #[must_use]
    pub const fn accepts_device_nodes(self) -> bool {
        matches!(self, Self::Booting | Self::Running | Self::Setup)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Booting => "booting",
            Self::Running => "running",
            Self::Freezing => "freezing",
            Self::Frozen => "frozen",
            Self::Zombie => "zombie",
            Self::ShuttingDown => "shutting_down",
            Self::Setup => "setup",
            Self::Rebooting => "rebooting",
        };
        f.write_str(s)
    }
}

/// Snapshot of the container attributes the subsystem needs.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Container ID.
    pub id: ContainerId,
    /// Human readable name, for logs.
    pub name: String,
    /// Container UUID, used for coldboot `SYNTH_UUID` tagging.
    pub uuid: Uuid,
    /// Current state.
    pub state: ContainerState,
    /// Pid of the container init (namespace owner).
    pub pid: i32,
    /// Host path of the container root filesystem.
    pub rootdir: PathBuf,
    /// Whether the container runs in its own user namespace.
    pub has_userns: bool,
}

/// Container lifecycle collaborator.
///
/// Implemented by the container manager; device cgroup and network calls
/// return plain string errors that the subsystem logs.
pub trait ContainerHost: Send + Sync {
    /// All known containers.
    fn containers(&self) -> Vec<ContainerInfo>;

    /// Looks up a container by ID.
    fn container(&self, id: &ContainerId) -> Option<ContainerInfo>;

    /// The always-present management container.
    fn core_container(&self) -> Option<ContainerInfo>;

    /// Looks up a container by UUID.
    fn container_by_uuid(&self, uuid: &Uuid) -> Option<ContainerInfo>;

    /// Whether the device cgroup of the container currently allows `major:minor`.
    fn is_device_allowed(&self, id: &ContainerId, major: i32, minor: i32) -> bool;

    /// Grants device cgroup access; `assign` makes it exclusive.
    fn device_allow(
        &self,
        id: &ContainerId,
        major: i32,
        minor: i32,
        assign: bool,
    ) -> std::result::Result<(), String>;

    /// Revokes device cgroup access.
    fn device_deny(&self, id: &ContainerId, major: i32, minor: i32)
        -> std::result::Result<(), String>;

    /// Applies the container's user namespace id shift to `path`.
    fn shift_ids(&self, id: &ContainerId, path: &Path) -> std::result::Result<(), String>;

    /// Moves (or bridges) a physical interface into the container.
    fn add_net_iface(&self, id: &ContainerId, pnet: &PnetConfig)
        -> std::result::Result<(), String>;

    /// Whether container network management is globally suspended.
    fn is_hosted_mode(&self) -> bool;
}

/// USB security token collaborator.
pub trait TokenSubsystem: Send + Sync {
    /// Offers an attached USB device; returns true if it is a container token.
    fn attach(&self, serial: &str, devpath: &str) -> bool;

    /// Offers a detached USB device; returns true if it was a container token.
    fn detach(&self, devpath: &str) -> bool;
}

/// Token subsystem that never claims a device.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTokens;

impl TokenSubsystem for NoTokens {
    fn attach(&self, _serial: &str, _devpath: &str) -> bool {
        false
    }

    fn detach(&self, _devpath: &str) -> bool {
        false
    }
}

/// Host network interface helpers.
pub trait NetInterfaces: Send + Sync {
    /// MAC address of an interface.
    ///
    /// # Errors
    ///
    /// Fails if the interface does not exist or has no MAC.
    fn mac_address(&self, ifname: &str) -> Result<MacAddr>;

    /// Whether sysfs reports the interface as wireless.
    fn is_wifi(&self, ifname: &str) -> bool;

    /// Renames an interface in the host network namespace.
    ///
    /// # Errors
    ///
    /// Fails if the rename syscall fails.
    fn rename(&self, old: &str, new: &str) -> Result<()>;
}

/// Delivers a raw uevent into the network namespace of a process.
pub trait NamespaceInjector: Send + Sync {
    /// Sends `raw` to the kernel uevent socket inside the namespaces of `pid`.
    ///
    /// # Errors
    ///
    /// Returns [`InjectError`] if the message could not be delivered.
    fn inject(&self, raw: &[u8], pid: i32, join_userns: bool)
        -> std::result::Result<(), InjectError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        for state in [
            ContainerState::Booting,
            ContainerState::Running,
            ContainerState::Starting,
        ] {
            assert!(state.accepts_netif(), "{state}");
        }
        for state in [ContainerState::Stopped, ContainerState::Setup, ContainerState::Frozen] {
            assert!(!state.accepts_netif(), "{state}");
        }

        assert!(ContainerState::Setup.accepts_device_nodes());
        assert!(ContainerState::Running.accepts_device_nodes());
        assert!(!ContainerState::Starting.accepts_device_nodes());
        assert!(!ContainerState::ShuttingDown.accepts_device_nodes());
    }

    #[test]
    fn test_no_tokens_never_claims() {
        assert!(!NoTokens.attach("0001", "/devices/usb1/1-1"));
        assert!(!NoTokens.detach("/devices/usb1/1-1"));
    }
}

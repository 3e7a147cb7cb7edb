//! Hotplug subsystem configuration.
//!
//! Loaded from multiple sources with the following priority:
//!
//! 1. Environment variables (`ARCBOX_HOTPLUG_*`)
//! 2. An explicit file passed to [`HotplugConfig::load_from`]
//! 3. System config file (`/etc/arcbox/hotplug.toml`)
//! 4. Default values
//!
//! ## Example Configuration File
//!
//! ```toml
//! sysfs_root = "/sys"
//! netif_settle_interval_ms = 100
//! netif_settle_max_attempts = 50
//! receive_buffer_size = 1048576
//! udev_monitor = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

const SYSTEM_CONFIG_PATH: &str = "/etc/arcbox/hotplug.toml";
const ENV_PREFIX: &str = "ARCBOX_HOTPLUG_";

/// Hotplug configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotplugConfig {
    /// Mount point of sysfs.
    pub sysfs_root: PathBuf,
    /// Delay between checks whether a new interface is ready in sysfs.
    pub netif_settle_interval_ms: u64,
    /// Checks before a not-ready interface is given up on.
    pub netif_settle_max_attempts: u32,
    /// Receive buffer size of the uevent socket.
    pub receive_buffer_size: usize,
    /// Also subscribe to udev-monitor broadcasts.
    pub udev_monitor: bool,
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            netif_settle_interval_ms: 100,
            netif_settle_max_attempts: 50,
            receive_buffer_size: 1024 * 1024,
            udev_monitor: false,
        }
    }
}

impl HotplugConfig {
    /// Loads configuration from the system file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be parsed.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    /// Loads configuration with an additional file layered over the system file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
    }

    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Interval of the interface settle timer.
    #[must_use]
    pub const fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.netif_settle_interval_ms)
    }

    /// Path of a sysfs entry given a kernel `DEVPATH`.
    #[must_use]
    pub fn sysfs_path(&self, devpath: &str) -> PathBuf {
        self.sysfs_root.join(devpath.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HotplugConfig::default();
        assert_eq!(config.sysfs_root, PathBuf::from("/sys"));
        assert_eq!(config.settle_interval(), Duration::from_millis(100));
        assert_eq!(config.netif_settle_max_attempts, 50);
        assert!(!config.udev_monitor);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hotplug.toml");
        std::fs::write(
            &path,
            "sysfs_root = \"/tmp/fake-sys\"\nnetif_settle_max_attempts = 3\n",
        )
        .unwrap();

        let config = HotplugConfig::load_from(&path).unwrap();
        assert_eq!(config.sysfs_root, PathBuf::from("/tmp/fake-sys"));
        assert_eq!(config.netif_settle_max_attempts, 3);
        assert_eq!(config.netif_settle_interval_ms, 100);
    }

    #[test]
    fn test_sysfs_path_joins_devpath() {
        let config = HotplugConfig {
            sysfs_root: PathBuf::from("/sys"),
            ..Default::default()
        };
        assert_eq!(
            config.sysfs_path("/devices/usb1/1-2"),
            PathBuf::from("/sys/devices/usb1/1-2")
        );
    }
}

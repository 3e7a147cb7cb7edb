//! Host network interface helpers backed by sysfs and rtnetlink.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{HotplugError, Result};
use crate::host::NetInterfaces;
use crate::mapping::MacAddr;

use super::netlink::RouteNetlink;

/// [`NetInterfaces`] over `<sysfs>/class/net` and a rtnetlink socket.
pub struct SysfsNetInterfaces {
    class_net: PathBuf,
    route: Mutex<RouteNetlink>,
}

impl SysfsNetInterfaces {
    /// Creates the helper for a sysfs mount point.
    ///
    /// # Errors
    ///
    /// Returns an error if the rtnetlink socket cannot be opened.
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            class_net: sysfs_root.into().join("class/net"),
            route: Mutex::new(RouteNetlink::new()?),
        })
    }

    /// Names of the physical interfaces currently present.
    ///
    /// Interfaces without a `device` link (loopback, bridges, veths) are
    /// virtual and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the class directory cannot be read.
    pub fn physical_interfaces(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.class_net)? {
            let entry = entry?;
            if entry.path().join("device").exists() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl NetInterfaces for SysfsNetInterfaces {
    fn mac_address(&self, ifname: &str) -> Result<MacAddr> {
        // Read MAC from /sys/class/net/<ifname>/address
        let path = self.class_net.join(ifname).join("address");
        let content = fs::read_to_string(&path)
            .map_err(|e| HotplugError::InvalidMac(format!("{ifname}: {e}")))?;
        content.trim().parse()
    }

    fn is_wifi(&self, ifname: &str) -> bool {
        let dir = self.class_net.join(ifname);
        dir.join("wireless").exists() || dir.join("phy80211").exists()
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut route = self
            .route
            .lock()
            .map_err(|_| HotplugError::Netlink("rtnetlink handle poisoned".into()))?;
        route.rename_link(old, new)
    }
}

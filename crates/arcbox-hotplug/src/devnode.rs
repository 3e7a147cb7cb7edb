//! Device node materialization and coldboot replay.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, error, info, trace, warn};

use crate::error::{HotplugError, Result};
use crate::host::{ContainerHost, ContainerInfo};
use crate::subsystem::HotplugSubsystem;
use crate::uevent::UeventMessage;

/// A sysfs `uevent` file whose sibling `dev` names a device number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColdbootCandidate {
    /// Path of the writable `uevent` trigger file.
    pub uevent_path: PathBuf,
    /// Device major number.
    pub major: i32,
    /// Device minor number.
    pub minor: i32,
}

/// Parses the contents of a sysfs `dev` file (`major:minor`).
#[must_use]
pub fn parse_devnum(contents: &str) -> Option<(i32, i32)> {
    let (major, minor) = contents.trim().split_once(':')?;
    let major = major.parse::<i32>().ok()?;
    let minor = minor.parse::<i32>().ok()?;
    (major >= 0 && minor >= 0).then_some((major, minor))
}

/// Walks `root` and collects every `uevent` file with a parseable `dev` sibling.
///
/// Symlinks are not followed; sysfs links back into itself from most
/// device directories.
///
/// # Errors
///
/// Returns an error if `root` cannot be read. Unreadable subdirectories
/// are skipped.
pub fn coldboot_candidates(root: &Path) -> io::Result<Vec<ColdbootCandidate>> {
    let mut out = Vec::new();
    walk(root, &mut out)?;
    Ok(out)
}

fn walk(dir: &Path, out: &mut Vec<ColdbootCandidate>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            if let Err(e) = walk(&path, out) {
                trace!(path = %path.display(), "Skipping unreadable sysfs dir: {}", e);
            }
            continue;
        }

        if entry.file_name() != "uevent" {
            continue;
        }

        let Ok(contents) = fs::read_to_string(dir.join("dev")) else {
            continue;
        };
        if let Some((major, minor)) = parse_devnum(&contents) {
            out.push(ColdbootCandidate {
                uevent_path: path,
                major,
                minor,
            });
        }
    }
    Ok(())
}

/// Path of the node for `devname` inside a container root.
///
/// Newer kernels and udev prefix `DEVNAME` with `/dev/`; both forms map to
/// the same node.
///
/// # Errors
///
/// Returns [`HotplugError::DeviceNode`] if the name is empty or has a
/// component that would leave the container's `/dev`.
pub fn node_path(rootdir: &Path, devname: &str) -> Result<PathBuf> {
    let rel = devname.strip_prefix("/dev/").unwrap_or(devname);
    let mut path = rootdir.join("dev");
    let mut depth = 0;
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => {
                path.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(HotplugError::DeviceNode(format!(
                    "refusing device name '{devname}'"
                )));
            }
        }
    }
    if depth == 0 {
        return Err(HotplugError::DeviceNode(format!(
            "empty device name '{devname}'"
        )));
    }
    Ok(path)
}

fn create_device_node(
    host: &dyn ContainerHost,
    container: &ContainerInfo,
    event: &UeventMessage,
    path: &Path,
) -> Result<()> {
    let existing = path.symlink_metadata().ok().map(|meta| meta.file_type());
    if existing.is_some_and(|ft| ft.is_char_device() || ft.is_block_device()) {
        trace!(path = %path.display(), "Node exists, just fixup uids");
    } else {
        if existing.is_some() {
            // Anything else in the node's place belongs to the container.
            debug!(path = %path.display(), "Replacing non-device entry with device node");
            fs::remove_file(path).map_err(|e| {
                HotplugError::DeviceNode(format!("remove {}: {e}", path.display()))
            })?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                HotplugError::DeviceNode(format!("create {}: {e}", parent.display()))
            })?;
        }

        let block = event.devtype() == "disk";
        info!(
            "Creating device node ({} {}:{}) in {}",
            if block { 'b' } else { 'c' },
            event.major(),
            event.minor(),
            path.display()
        );
        mknod(path, block, event.major(), event.minor())?;
    }

    host.shift_ids(&container.id, path).map_err(|e| {
        HotplugError::DeviceNode(format!(
            "fixup uids for {} in {}: {e}",
            path.display(),
            container.name
        ))
    })
}

#[allow(clippy::cast_sign_loss)]
fn mknod(path: &Path, block: bool, major: i32, minor: i32) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| HotplugError::DeviceNode(format!("invalid path {}", path.display())))?;
    let kind = if block { libc::S_IFBLK } else { libc::S_IFCHR };

    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let ret = unsafe {
        libc::mknod(
            c_path.as_ptr(),
            kind | 0o600,
            libc::makedev(major as libc::c_uint, minor as libc::c_uint),
        )
    };
    if ret < 0 {
        return Err(HotplugError::DeviceNode(format!(
            "mknod {}: {}",
            path.display(),
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

impl HotplugSubsystem {
    /// Mirrors a device event into one container.
    ///
    /// Creates or removes the node under the container's `/dev` and replays
    /// the event inside its network namespace. Containers that are not up
    /// and devices the cgroup forbids are skipped silently.
    ///
    /// # Errors
    ///
    /// Returns an error if the device name leaves the container's `/dev`
    /// or the node could not be created; the event is then not replayed.
    pub fn device_node_and_forward(
        &self,
        event: &UeventMessage,
        container: &ContainerInfo,
    ) -> Result<()> {
        if !container.state.accepts_device_nodes() {
            trace!(container = %container.name, state = %container.state, "Skipping container");
            return Ok(());
        }

        let (major, minor) = (event.major(), event.minor());
        if !self.host.is_device_allowed(&container.id, major, minor) {
            trace!(
                "Skipping device '{}' ({},{}) which is forbidden by cgroup",
                event.devname(),
                major,
                minor
            );
            return Ok(());
        }

        if !event.devname().is_empty() {
            let path = node_path(&container.rootdir, event.devname())?;
            match event.action() {
                "add" => create_device_node(self.host.as_ref(), container, event, &path)?,
                "remove" => match fs::remove_file(&path) {
                    Ok(()) => debug!(path = %path.display(), "Removed device node"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %path.display(), "Could not remove device node: {}", e),
                },
                _ => {}
            }
        }

        match self
            .injector
            .inject(event.as_bytes(), container.pid, container.has_userns)
        {
            Ok(()) => trace!(container = %container.name, "Injected uevent into netns"),
            Err(e) => warn!(
                container = %container.name,
                "Could not inject uevent into netns: {}", e
            ),
        }
        Ok(())
    }

    /// Asks the kernel to replay `add` events for devices the container may use.
    ///
    /// Writes `add <uuid>` into every `uevent` file under
    /// `<sysfs_root>/devices` whose device number the container's cgroup
    /// allows. Returns the number of triggered devices.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is unknown or the sysfs devices
    /// tree cannot be read.
    pub fn coldboot_trigger(&self, container: &ContainerInfo) -> Result<usize> {
        let root = self.config.sysfs_root.join("devices");
        let candidates = coldboot_candidates(&root).map_err(|e| {
            warn!("Could not trigger coldboot uevents! No '{}': {}", root.display(), e);
            HotplugError::Io(e)
        })?;

        let trigger = format!("add {}", container.uuid);
        let mut triggered = 0;
        for candidate in candidates {
            if !self
                .host
                .is_device_allowed(&container.id, candidate.major, candidate.minor)
            {
                continue;
            }
            match fs::write(&candidate.uevent_path, &trigger) {
                Ok(()) => {
                    debug!("Trigger event {} <- {}", candidate.uevent_path.display(), trigger);
                    triggered += 1;
                }
                Err(e) => error!(
                    "Could not trigger event {} <- {}: {}",
                    candidate.uevent_path.display(),
                    trigger,
                    e
                ),
            }
        }

        info!(container = %container.name, triggered, "Triggered coldboot uevents");
        Ok(triggered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devnum() {
        assert_eq!(parse_devnum("1:3\n"), Some((1, 3)));
        assert_eq!(parse_devnum("189:128"), Some((189, 128)));
        assert_eq!(parse_devnum("1-3"), None);
        assert_eq!(parse_devnum("a:3"), None);
        assert_eq!(parse_devnum("-1:3"), None);
    }

    #[test]
    fn test_node_path_strips_dev_prefix() {
        let root = Path::new("/var/lib/c1/root");
        assert_eq!(
            node_path(root, "bus/usb/001/002").unwrap(),
            PathBuf::from("/var/lib/c1/root/dev/bus/usb/001/002")
        );
        assert_eq!(
            node_path(root, "/dev/ttyUSB0").unwrap(),
            PathBuf::from("/var/lib/c1/root/dev/ttyUSB0")
        );
        assert_eq!(
            node_path(root, "./input/event3").unwrap(),
            PathBuf::from("/var/lib/c1/root/dev/input/event3")
        );
    }

    #[test]
    fn test_node_path_stays_under_dev() {
        let root = Path::new("/var/lib/c1/root");
        for devname in [
            "../../etc/shadow",
            "bus/../../x",
            "/dev/../etc/passwd",
            "/etc/shadow",
            "//dev/null",
            "/dev/",
            ".",
        ] {
            let err = node_path(root, devname).unwrap_err();
            assert!(
                matches!(err, HotplugError::DeviceNode(_)),
                "{devname}: {err}"
            );
        }
    }

    #[test]
    fn test_candidates_need_dev_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let mem = dir.path().join("virtual/mem/null");
        let bus = dir.path().join("pci0000:00");
        fs::create_dir_all(&mem).unwrap();
        fs::create_dir_all(&bus).unwrap();
        fs::write(mem.join("uevent"), "").unwrap();
        fs::write(mem.join("dev"), "1:3\n").unwrap();
        fs::write(bus.join("uevent"), "").unwrap();

        let found = coldboot_candidates(dir.path()).unwrap();
        assert_eq!(
            found,
            vec![ColdbootCandidate {
                uevent_path: mem.join("uevent"),
                major: 1,
                minor: 3,
            }]
        );
    }

    #[test]
    fn test_candidates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(coldboot_candidates(&dir.path().join("devices")).is_err());
    }
}

//! Linux kernel plumbing for the hotplug subsystem.
//!
//! Real implementations of the collaborator traits: the uevent socket,
//! interface renaming over rtnetlink, sysfs interface helpers and the
//! fork-based namespace injector.

pub mod netlink;
pub mod netns;
pub mod sysnet;
pub mod uevent_socket;

pub use netlink::RouteNetlink;
pub use netns::ForkInjector;
pub use sysnet::SysfsNetInterfaces;
pub use uevent_socket::{is_trusted_sender, UeventSocket, KERNEL_GROUP, UDEV_GROUP};

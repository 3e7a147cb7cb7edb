//! # arcbox-hotplug
//!
//! Kernel uevent mediation for ArcBox containers.
//!
//! The host daemon listens on the kernel uevent multicast socket and decides,
//! per event, what each container gets to see:
//!
//! - **USB passthrough**: registered devices are allowed in the owning
//!   container's device cgroup when they appear, and denied when they leave
//! - **Physical NIC migration**: new host interfaces are renamed to
//!   `cml{eth,wlan}N` and moved into the mapped (or core) container
//! - **Device nodes**: allowed devices get a node under the container's
//!   `/dev` and the event is replayed inside its network namespace
//! - **Coldboot**: devices present before a container started are replayed
//!   as synthetic `add` events
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 arcbox-hotplug                  │
//! │  ┌─────────────────────────────────────────┐   │
//! │  │      monitor (uevent socket reactor)    │   │
//! │  └─────────────────────────────────────────┘   │
//! │                      │                          │
//! │                      ▼                          │
//! │  ┌─────────────────────────────────────────┐   │
//! │  │            HotplugSubsystem             │   │
//! │  │  usb │ netif │ devnode │ mappings       │   │
//! │  └─────────────────────────────────────────┘   │
//! │                      │                          │
//! │                      ▼                          │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────────┐   │
//! │  │Container │ │  sysfs / │ │  namespace   │   │
//! │  │  host    │ │ netlink  │ │  injector    │   │
//! │  └──────────┘ └──────────┘ └──────────────┘   │
//! └─────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod devnode;
pub mod error;
pub mod host;
pub mod mapping;
pub mod netif;
pub mod subsystem;
pub mod uevent;
pub mod usb;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub mod monitor;

pub use config::HotplugConfig;
pub use error::{ChildStatus, HotplugError, InjectError, InjectStep, Result};
pub use host::{
    ContainerHost, ContainerId, ContainerInfo, ContainerState, NamespaceInjector, NetInterfaces,
    NoTokens, TokenSubsystem,
};
pub use mapping::{DeviceMappings, MacAddr, PnetConfig, UsbDevice};
pub use subsystem::HotplugSubsystem;
pub use uevent::{UeventField, UeventMessage};
pub use usb::Disposition;

//! Integration tests for arcbox-hotplug.
//!
//! These tests drive the subsystem with raw uevent datagrams against
//! recording collaborators and a fake sysfs tree.

// ============================================================================
// Test Collaborators
// ============================================================================

mod mocks {
    use std::collections::{HashMap, HashSet};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use arcbox_hotplug::{
        ContainerHost, ContainerId, ContainerInfo, ContainerState, HotplugConfig, HotplugError,
        HotplugSubsystem, InjectError, MacAddr, NamespaceInjector, NetInterfaces, PnetConfig,
        TokenSubsystem,
    };
    use tempfile::TempDir;
    use uuid::Uuid;

    #[derive(Default)]
    pub struct MockHost {
        pub containers: Mutex<Vec<ContainerInfo>>,
        pub allowed: Mutex<HashSet<(String, i32, i32)>>,
        pub allow_calls: Mutex<Vec<(String, i32, i32, bool)>>,
        pub deny_calls: Mutex<Vec<(String, i32, i32)>>,
        pub shifted: Mutex<Vec<PathBuf>>,
        pub net_ifaces: Mutex<Vec<(String, PnetConfig)>>,
        pub hosted_mode: bool,
    }

    impl MockHost {
        pub fn allow(&self, id: &str, major: i32, minor: i32) {
            self.allowed
                .lock()
                .unwrap()
                .insert((id.to_string(), major, minor));
        }
    }

    impl ContainerHost for MockHost {
        fn containers(&self) -> Vec<ContainerInfo> {
            self.containers.lock().unwrap().clone()
        }

        fn container(&self, id: &ContainerId) -> Option<ContainerInfo> {
            self.containers().into_iter().find(|c| &c.id == id)
        }

        fn core_container(&self) -> Option<ContainerInfo> {
            self.container(&ContainerId::from_string("core"))
        }

        fn container_by_uuid(&self, uuid: &Uuid) -> Option<ContainerInfo> {
            self.containers().into_iter().find(|c| &c.uuid == uuid)
        }

        fn is_device_allowed(&self, id: &ContainerId, major: i32, minor: i32) -> bool {
            self.allowed
                .lock()
                .unwrap()
                .contains(&(id.as_str().to_string(), major, minor))
        }

        fn device_allow(
            &self,
            id: &ContainerId,
            major: i32,
            minor: i32,
            assign: bool,
        ) -> Result<(), String> {
            self.allow_calls
                .lock()
                .unwrap()
                .push((id.as_str().to_string(), major, minor, assign));
            Ok(())
        }

        fn device_deny(&self, id: &ContainerId, major: i32, minor: i32) -> Result<(), String> {
            self.deny_calls
                .lock()
                .unwrap()
                .push((id.as_str().to_string(), major, minor));
            Ok(())
        }

        fn shift_ids(&self, _id: &ContainerId, path: &Path) -> Result<(), String> {
            self.shifted.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        fn add_net_iface(&self, id: &ContainerId, pnet: &PnetConfig) -> Result<(), String> {
            self.net_ifaces
                .lock()
                .unwrap()
                .push((id.as_str().to_string(), pnet.clone()));
            Ok(())
        }

        fn is_hosted_mode(&self) -> bool {
            self.hosted_mode
        }
    }

    #[derive(Default)]
    pub struct MockNet {
        pub macs: Mutex<HashMap<String, MacAddr>>,
        pub wifi: Mutex<HashSet<String>>,
        pub renames: Mutex<Vec<(String, String)>>,
        pub refuse_renames: Mutex<bool>,
    }

    impl MockNet {
        pub fn add(&self, ifname: &str, mac: &str, wifi: bool) {
            self.macs
                .lock()
                .unwrap()
                .insert(ifname.to_string(), mac.parse().unwrap());
            if wifi {
                self.wifi.lock().unwrap().insert(ifname.to_string());
            }
        }
    }

    impl NetInterfaces for MockNet {
        fn mac_address(&self, ifname: &str) -> arcbox_hotplug::Result<MacAddr> {
            self.macs
                .lock()
                .unwrap()
                .get(ifname)
                .copied()
                .ok_or_else(|| HotplugError::InvalidMac(ifname.to_string()))
        }

        fn is_wifi(&self, ifname: &str) -> bool {
            self.wifi.lock().unwrap().contains(ifname)
        }

        fn rename(&self, old: &str, new: &str) -> arcbox_hotplug::Result<()> {
            if *self.refuse_renames.lock().unwrap() {
                return Err(HotplugError::Netlink(format!("{old}: EBUSY")));
            }
            let mut macs = self.macs.lock().unwrap();
            if let Some(mac) = macs.remove(old) {
                macs.insert(new.to_string(), mac);
            }
            let mut wifi = self.wifi.lock().unwrap();
            if wifi.remove(old) {
                wifi.insert(new.to_string());
            }
            self.renames
                .lock()
                .unwrap()
                .push((old.to_string(), new.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockInjector {
        pub injected: Mutex<Vec<(Vec<u8>, i32, bool)>>,
    }

    impl MockInjector {
        pub fn pids(&self) -> Vec<i32> {
            self.injected.lock().unwrap().iter().map(|i| i.1).collect()
        }

        pub fn last_text(&self) -> String {
            let injected = self.injected.lock().unwrap();
            let raw = &injected.last().unwrap().0;
            String::from_utf8_lossy(raw).into_owned()
        }
    }

    impl NamespaceInjector for MockInjector {
        fn inject(&self, raw: &[u8], pid: i32, join_userns: bool) -> Result<(), InjectError> {
            self.injected
                .lock()
                .unwrap()
                .push((raw.to_vec(), pid, join_userns));
            Ok(())
        }
    }

    pub struct ClaimingTokens;

    impl TokenSubsystem for ClaimingTokens {
        fn attach(&self, _serial: &str, _devpath: &str) -> bool {
            true
        }

        fn detach(&self, _devpath: &str) -> bool {
            true
        }
    }

    pub fn container(id: &str, state: ContainerState, pid: i32, rootdir: &Path) -> ContainerInfo {
        ContainerInfo {
            id: ContainerId::from_string(id),
            name: id.to_string(),
            uuid: Uuid::new_v4(),
            state,
            pid,
            rootdir: rootdir.to_path_buf(),
            has_userns: true,
        }
    }

    pub fn kernel_event(summary: &str, records: &[&str]) -> Vec<u8> {
        let mut raw = summary.as_bytes().to_vec();
        raw.push(0);
        for record in records {
            raw.extend_from_slice(record.as_bytes());
            raw.push(0);
        }
        raw
    }

    pub struct Fixture {
        pub host: Arc<MockHost>,
        pub net: Arc<MockNet>,
        pub injector: Arc<MockInjector>,
        pub sysfs: TempDir,
        pub rootfs: TempDir,
        pub subsystem: HotplugSubsystem,
    }

    impl Fixture {
        pub fn new(host: MockHost) -> Self {
            Self::with_config(host, |_| {})
        }

        pub fn with_config(host: MockHost, tweak: impl FnOnce(&mut HotplugConfig)) -> Self {
            let sysfs = tempfile::tempdir().unwrap();
            let rootfs = tempfile::tempdir().unwrap();
            let mut config = HotplugConfig {
                sysfs_root: sysfs.path().to_path_buf(),
                ..Default::default()
            };
            tweak(&mut config);

            let host = Arc::new(host);
            let net = Arc::new(MockNet::default());
            let injector = Arc::new(MockInjector::default());
            let subsystem = HotplugSubsystem::new(
                config,
                host.clone(),
                net.clone(),
                injector.clone(),
            );
            Self {
                host,
                net,
                injector,
                sysfs,
                rootfs,
                subsystem,
            }
        }

        pub fn add_container(&self, id: &str, state: ContainerState, pid: i32) -> ContainerInfo {
            let info = container(id, state, pid, self.rootfs.path());
            self.host.containers.lock().unwrap().push(info.clone());
            info
        }
    }
}

// ============================================================================
// USB Hotplug Tests
// ============================================================================

mod usb {
    use std::sync::Arc;

    use arcbox_hotplug::{ContainerId, ContainerState, UsbDevice};

    use super::mocks::{kernel_event, ClaimingTokens, Fixture, MockHost};

    const DEVPATH: &str = "/devices/pci0000:00/0000:00:14.0/usb1/1-2";

    fn write_serial(fx: &Fixture, serial: &str) {
        let dir = fx.sysfs.path().join(DEVPATH.trim_start_matches('/'));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("serial"), serial).unwrap();
    }

    fn usb_event(action: &str, ids: &[&str]) -> Vec<u8> {
        let summary = format!("{action}@{DEVPATH}");
        let action = format!("ACTION={action}");
        let devpath = format!("DEVPATH={DEVPATH}");
        let mut records = vec![
            action.as_str(),
            devpath.as_str(),
            "SUBSYSTEM=usb",
            "DEVTYPE=usb_device",
            "DEVNAME=bus/usb/001/002",
            "MAJOR=189",
            "MINOR=0",
        ];
        records.extend_from_slice(ids);
        kernel_event(&summary, &records)
    }

    fn c1() -> ContainerId {
        ContainerId::from_string("c1")
    }

    /// A registered device is bound and exclusively assigned when it appears.
    #[test]
    fn test_add_assigns_registered_device() {
        let mut fx = Fixture::new(MockHost::default());
        fx.add_container("c1", ContainerState::Running, 100);
        write_serial(&fx, "0001\n");

        let device = UsbDevice::new(0x0951, 0x1666, "0001", true);
        fx.subsystem.register_usb(&c1(), &device);

        fx.subsystem
            .handle_message(&usb_event("add", &["ID_VENDOR_ID=0951", "ID_MODEL_ID=1666"]))
            .unwrap();

        assert_eq!(
            fx.host.allow_calls.lock().unwrap().as_slice(),
            &[("c1".to_string(), 189, 0, true)]
        );
        assert_eq!(fx.subsystem.mappings().usb()[0].device.devnum(), (189, 0));
    }

    /// Vendor and product fall back to the PRODUCT record.
    #[test]
    fn test_add_uses_product_fallback() {
        let mut fx = Fixture::new(MockHost::default());
        write_serial(&fx, "0001\n");

        let device = UsbDevice::new(0x0951, 0x1666, "0001", false);
        fx.subsystem.register_usb(&c1(), &device);

        fx.subsystem
            .handle_message(&usb_event("add", &["PRODUCT=951/1666/100"]))
            .unwrap();

        assert_eq!(
            fx.host.allow_calls.lock().unwrap().as_slice(),
            &[("c1".to_string(), 189, 0, false)]
        );
    }

    /// Serial matching is exact, not prefix based.
    #[test]
    fn test_serial_must_match_exactly() {
        let mut fx = Fixture::new(MockHost::default());
        write_serial(&fx, "ABC1234\n");

        let device = UsbDevice::new(0x1234, 0x5678, "ABC123", true);
        fx.subsystem.register_usb(&c1(), &device);

        fx.subsystem
            .handle_message(&usb_event("add", &["ID_VENDOR_ID=1234", "ID_MODEL_ID=5678"]))
            .unwrap();

        assert!(fx.host.allow_calls.lock().unwrap().is_empty());
        assert!(!fx.subsystem.mappings().usb()[0].device.is_bound());
    }

    /// Without a readable serial the resolver declines.
    #[test]
    fn test_add_without_serial_is_ignored() {
        let mut fx = Fixture::new(MockHost::default());
        let device = UsbDevice::new(0x0951, 0x1666, "", true);
        fx.subsystem.register_usb(&c1(), &device);

        fx.subsystem
            .handle_message(&usb_event("add", &["ID_VENDOR_ID=0951", "ID_MODEL_ID=1666"]))
            .unwrap();

        assert!(fx.host.allow_calls.lock().unwrap().is_empty());
    }

    /// Removing a bound device revokes access for its container.
    #[test]
    fn test_remove_denies_bound_device() {
        let mut fx = Fixture::new(MockHost::default());
        write_serial(&fx, "0001\n");

        let device = UsbDevice::new(0x0951, 0x1666, "0001", true);
        fx.subsystem.register_usb(&c1(), &device);
        fx.subsystem
            .handle_message(&usb_event("add", &["ID_VENDOR_ID=0951", "ID_MODEL_ID=1666"]))
            .unwrap();
        fx.subsystem
            .handle_message(&usb_event("remove", &[]))
            .unwrap();

        assert_eq!(
            fx.host.deny_calls.lock().unwrap().as_slice(),
            &[("c1".to_string(), 189, 0)]
        );
        // The binding is left in place until the next add.
        assert_eq!(fx.subsystem.mappings().usb()[0].device.devnum(), (189, 0));
    }

    /// Token devices are fully handled by the token subsystem.
    #[test]
    fn test_token_claim_stops_processing() {
        let fx = Fixture::new(MockHost::default());
        fx.add_container("c1", ContainerState::Running, 100);
        fx.host.allow("c1", 189, 0);
        write_serial(&fx, "0001\n");
        let mut subsystem = fx.subsystem.with_tokens(Arc::new(ClaimingTokens));

        let device = UsbDevice::new(0x0951, 0x1666, "0001", true);
        subsystem.register_usb(&c1(), &device);
        subsystem
            .handle_message(&usb_event("add", &["ID_VENDOR_ID=0951", "ID_MODEL_ID=1666"]))
            .unwrap();

        assert!(fx.host.allow_calls.lock().unwrap().is_empty());
        assert!(fx.injector.injected.lock().unwrap().is_empty());
    }

    /// A token detachment suppresses the deny and the forwarding.
    #[test]
    fn test_token_detach_stops_processing() {
        let fx = Fixture::new(MockHost::default());
        fx.add_container("c1", ContainerState::Running, 100);
        fx.host.allow("c1", 189, 0);
        let mut subsystem = fx.subsystem.with_tokens(Arc::new(ClaimingTokens));

        let mut device = UsbDevice::new(0x0951, 0x1666, "0001", true);
        device.bind(189, 0);
        subsystem.register_usb(&c1(), &device);
        subsystem
            .handle_message(&usb_event("remove", &[]))
            .unwrap();

        assert!(fx.host.deny_calls.lock().unwrap().is_empty());
        assert!(fx.injector.injected.lock().unwrap().is_empty());
    }
}

// ============================================================================
// Network Interface Migration Tests
// ============================================================================

mod netif {
    use arcbox_hotplug::{ContainerId, ContainerState, PnetConfig};

    use super::mocks::{kernel_event, Fixture, MockHost};

    const PCI: &str = "/devices/pci0000:00/0000:00:19.0/net";

    fn net_add(ifname: &str, devtype: Option<&str>) -> Vec<u8> {
        let devpath = format!("{PCI}/{ifname}");
        let summary = format!("add@{devpath}");
        let devpath_rec = format!("DEVPATH={devpath}");
        let iface = format!("INTERFACE={ifname}");
        let devtype_rec = devtype.map(|d| format!("DEVTYPE={d}"));
        let mut records = vec![
            "ACTION=add",
            devpath_rec.as_str(),
            "SUBSYSTEM=net",
            iface.as_str(),
            "IFINDEX=3",
        ];
        if let Some(d) = &devtype_rec {
            records.push(d.as_str());
        }
        kernel_event(&summary, &records)
    }

    /// An unmapped NIC is renamed and moved into the core container.
    #[test]
    fn test_unmapped_interface_moves_to_core() {
        let mut fx = Fixture::new(MockHost::default());
        let core = fx.add_container("core", ContainerState::Running, 1);
        fx.net.add("eth0", "52:54:00:12:34:56", false);

        fx.subsystem.handle_message(&net_add("eth0", None)).unwrap();
        assert_eq!(fx.subsystem.pending_netifs(), 1);
        assert!(fx.subsystem.physical_interfaces().contains("eth0"));

        assert_eq!(fx.subsystem.poll_pending_netifs(), 0);

        assert_eq!(
            fx.net.renames.lock().unwrap().as_slice(),
            &[("eth0".to_string(), "cmleth0".to_string())]
        );
        let moved = fx.host.net_ifaces.lock().unwrap().clone();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].0, "core");
        assert_eq!(moved[0].1.name, "cmleth0");
        assert!(fx.subsystem.physical_interfaces().contains("cmleth0"));
        assert!(!fx.subsystem.physical_interfaces().contains("eth0"));

        assert_eq!(fx.injector.pids(), vec![core.pid]);
        let text = fx.injector.last_text();
        assert!(text.contains("INTERFACE=cmleth0\0"));
        assert!(text.contains(&format!("DEVPATH={PCI}/cmleth0\0")));
    }

    /// A mapped MAC with filtering moves the NIC without replaying the event.
    #[test]
    fn test_mapped_interface_with_mac_filter() {
        let mut fx = Fixture::new(MockHost::default());
        fx.add_container("core", ContainerState::Running, 1);
        fx.add_container("c1", ContainerState::Running, 200);
        fx.net.add("eth1", "52:54:00:aa:bb:cc", false);

        let c1 = ContainerId::from_string("c1");
        let pnet = PnetConfig::new("52:54:00:AA:BB:CC", true);
        fx.subsystem.register_net(&c1, &pnet).unwrap();

        fx.subsystem.handle_message(&net_add("eth1", None)).unwrap();
        fx.subsystem.poll_pending_netifs();

        let moved = fx.host.net_ifaces.lock().unwrap().clone();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].0, "c1");
        assert!(moved[0].1.mac_filter);
        assert!(fx.injector.injected.lock().unwrap().is_empty());
    }

    /// A refused host rename drops the event and leaves the NIC on the host.
    #[test]
    fn test_failed_rename_drops_event() {
        let mut fx = Fixture::new(MockHost::default());
        fx.add_container("core", ContainerState::Running, 1);
        fx.net.add("eth0", "52:54:00:12:34:56", false);
        *fx.net.refuse_renames.lock().unwrap() = true;

        fx.subsystem.handle_message(&net_add("eth0", None)).unwrap();
        assert_eq!(fx.subsystem.poll_pending_netifs(), 0);

        assert!(fx.host.net_ifaces.lock().unwrap().is_empty());
        assert!(fx.injector.injected.lock().unwrap().is_empty());
        assert_eq!(fx.subsystem.physical_interfaces().names(), ["eth0"]);
    }

    /// A devpath that does not end in the interface name is rejected before
    /// the host interface is touched.
    #[test]
    fn test_devpath_mismatch_keeps_host_name() {
        let mut fx = Fixture::new(MockHost::default());
        fx.add_container("core", ContainerState::Running, 1);
        fx.net.add("eth0", "52:54:00:12:34:56", false);

        let raw = kernel_event(
            &format!("add@{PCI}/enp0s25"),
            &[
                "ACTION=add",
                &format!("DEVPATH={PCI}/enp0s25"),
                "SUBSYSTEM=net",
                "INTERFACE=eth0",
            ],
        );
        fx.subsystem.handle_message(&raw).unwrap();
        assert_eq!(fx.subsystem.poll_pending_netifs(), 0);

        assert!(fx.net.renames.lock().unwrap().is_empty());
        assert!(fx.host.net_ifaces.lock().unwrap().is_empty());
        assert!(fx.injector.injected.lock().unwrap().is_empty());
        assert_eq!(fx.subsystem.physical_interfaces().names(), ["eth0"]);
    }

    /// A target that is not running leaves the NIC on the host.
    #[test]
    fn test_stopped_target_is_skipped() {
        let mut fx = Fixture::new(MockHost::default());
        fx.add_container("core", ContainerState::Stopped, 1);
        fx.net.add("eth0", "52:54:00:12:34:56", false);

        fx.subsystem.handle_message(&net_add("eth0", None)).unwrap();
        assert_eq!(fx.subsystem.poll_pending_netifs(), 0);

        assert!(fx.net.renames.lock().unwrap().is_empty());
        assert!(fx.host.net_ifaces.lock().unwrap().is_empty());
        assert!(fx.subsystem.physical_interfaces().contains("eth0"));
    }

    /// Wireless NICs wait for sysfs, then get consecutive wlan names.
    #[test]
    fn test_wifi_interfaces_get_consecutive_names() {
        let mut fx = Fixture::new(MockHost::default());
        fx.add_container("core", ContainerState::Running, 1);

        for i in 0..3 {
            let name = format!("wlan{i}");
            fx.net.add(&name, &format!("02:00:00:00:00:0{i}"), false);
            fx.subsystem
                .handle_message(&net_add(&name, Some("wlan")))
                .unwrap();
        }

        // Not yet classified as wireless by sysfs.
        assert_eq!(fx.subsystem.poll_pending_netifs(), 3);

        for i in 0..3 {
            fx.net.wifi.lock().unwrap().insert(format!("wlan{i}"));
        }
        assert_eq!(fx.subsystem.poll_pending_netifs(), 0);

        let names: Vec<String> = fx
            .host
            .net_ifaces
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.name.clone())
            .collect();
        assert_eq!(names, ["cmlwlan0", "cmlwlan1", "cmlwlan2"]);
    }

    /// Interfaces that never settle are dropped after the retry budget.
    #[test]
    fn test_unsettled_interface_is_dropped() {
        let mut fx = Fixture::with_config(MockHost::default(), |c| {
            c.netif_settle_max_attempts = 3;
        });
        fx.add_container("core", ContainerState::Running, 1);
        fx.net.add("wlan0", "02:00:00:00:00:01", false);

        fx.subsystem
            .handle_message(&net_add("wlan0", Some("wlan")))
            .unwrap();
        assert_eq!(fx.subsystem.poll_pending_netifs(), 1);
        assert_eq!(fx.subsystem.poll_pending_netifs(), 1);
        assert_eq!(fx.subsystem.poll_pending_netifs(), 0);

        assert!(fx.net.renames.lock().unwrap().is_empty());
    }

    /// Virtual interfaces are forwarded, not migrated.
    #[test]
    fn test_virtual_interface_is_not_migrated() {
        let mut fx = Fixture::new(MockHost::default());
        fx.add_container("core", ContainerState::Running, 1);

        let raw = kernel_event(
            "add@/devices/virtual/net/veth0",
            &[
                "ACTION=add",
                "DEVPATH=/devices/virtual/net/veth0",
                "SUBSYSTEM=net",
                "INTERFACE=veth0",
            ],
        );
        fx.subsystem.handle_message(&raw).unwrap();

        assert_eq!(fx.subsystem.pending_netifs(), 0);
        assert!(!fx.subsystem.physical_interfaces().contains("veth0"));
    }

    /// Hosted mode leaves every NIC on the host.
    #[test]
    fn test_hosted_mode_disables_migration() {
        let mut fx = Fixture::new(MockHost {
            hosted_mode: true,
            ..Default::default()
        });
        fx.add_container("core", ContainerState::Running, 1);
        fx.net.add("eth0", "52:54:00:12:34:56", false);

        fx.subsystem.handle_message(&net_add("eth0", None)).unwrap();
        assert_eq!(fx.subsystem.pending_netifs(), 0);
    }

    /// Interfaces present at startup are renamed in place.
    #[test]
    fn test_init_renames_existing_interfaces() {
        let fx = Fixture::new(MockHost::default());
        fx.net.add("eth0", "52:54:00:12:34:56", false);
        fx.net.add("wlan0", "02:00:00:00:00:01", true);

        let mut subsystem = fx
            .subsystem
            .with_physical_interfaces(["eth0".to_string(), "wlan0".to_string()]);
        subsystem.init();

        assert_eq!(
            subsystem.physical_interfaces().names(),
            ["cmleth0", "cmlwlan0"]
        );
    }

    /// Registration rejects selectors that are not MAC addresses.
    #[test]
    fn test_register_net_requires_mac() {
        let mut fx = Fixture::new(MockHost::default());
        let c1 = ContainerId::from_string("c1");
        assert!(fx
            .subsystem
            .register_net(&c1, &PnetConfig::new("eth0", false))
            .is_err());

        let mac = fx
            .subsystem
            .register_net(&c1, &PnetConfig::new("52:54:00:12:34:56", false))
            .unwrap();
        fx.subsystem.unregister_net(&c1, mac).unwrap();
        assert!(fx.subsystem.unregister_net(&c1, mac).is_err());
    }
}

// ============================================================================
// Device Node and Coldboot Tests
// ============================================================================

mod devnode {
    use std::fs;
    use std::os::unix::fs::{symlink, FileTypeExt, MetadataExt};
    use std::path::Path;

    use arcbox_hotplug::ContainerState;
    use arcbox_hotplug::UeventMessage;

    use super::mocks::{container, kernel_event, Fixture, MockHost};

    fn is_root() -> bool {
        // SAFETY: geteuid has no preconditions.
        unsafe { libc::geteuid() == 0 }
    }

    fn mem_event(action: &str, extra: &[&str]) -> Vec<u8> {
        let summary = format!("{action}@/devices/virtual/mem/null");
        let action = format!("ACTION={action}");
        let mut records = vec![
            action.as_str(),
            "DEVPATH=/devices/virtual/mem/null",
            "SUBSYSTEM=mem",
            "DEVNAME=null",
            "MAJOR=1",
            "MINOR=3",
        ];
        records.extend_from_slice(extra);
        kernel_event(&summary, &records)
    }

    /// An existing device node only gets its ownership fixed, every time.
    #[test]
    fn test_existing_node_is_idempotent() {
        let fx = Fixture::new(MockHost::default());
        // Rooted at the host root so the node is the host's /dev/null.
        let c1 = container("c1", ContainerState::Running, 100, Path::new("/"));
        fx.host.allow("c1", 1, 3);

        let event = UeventMessage::decode(&mem_event("add", &[])).unwrap();
        fx.subsystem.device_node_and_forward(&event, &c1).unwrap();
        fx.subsystem.device_node_and_forward(&event, &c1).unwrap();

        let node = Path::new("/dev/null").to_path_buf();
        assert_eq!(fx.host.shifted.lock().unwrap().as_slice(), &[node.clone(), node]);
        assert_eq!(fx.injector.pids(), vec![100, 100]);
    }

    /// Device names that climb out of /dev are refused before any node work.
    #[test]
    fn test_devname_outside_dev_is_rejected() {
        let fx = Fixture::new(MockHost::default());
        let c1 = fx.add_container("c1", ContainerState::Running, 100);
        fx.host.allow("c1", 1, 3);

        let victim = fx.rootfs.path().join("victim");
        fs::write(&victim, "host data").unwrap();

        let raw = kernel_event(
            "add@/devices/virtual/mem/null",
            &[
                "ACTION=add",
                "DEVPATH=/devices/virtual/mem/null",
                "SUBSYSTEM=mem",
                "DEVNAME=../victim",
                "MAJOR=1",
                "MINOR=3",
            ],
        );
        let event = UeventMessage::decode(&raw).unwrap();
        assert!(fx.subsystem.device_node_and_forward(&event, &c1).is_err());

        assert!(fx.host.shifted.lock().unwrap().is_empty());
        assert!(fx.injector.injected.lock().unwrap().is_empty());
        assert_eq!(fs::read_to_string(&victim).unwrap(), "host data");
    }

    /// A symlink planted in the container's /dev is never followed.
    #[test]
    fn test_symlink_node_is_replaced() {
        let fx = Fixture::new(MockHost::default());
        let c1 = fx.add_container("c1", ContainerState::Running, 100);
        fx.host.allow("c1", 1, 3);

        let victim = fx.rootfs.path().join("victim");
        fs::write(&victim, "host data").unwrap();
        let node = fx.rootfs.path().join("dev/null");
        fs::create_dir_all(node.parent().unwrap()).unwrap();
        symlink(&victim, &node).unwrap();

        let event = UeventMessage::decode(&mem_event("add", &[])).unwrap();
        let result = fx.subsystem.device_node_and_forward(&event, &c1);

        // Without CAP_MKNOD the replacement node cannot be created.
        assert_eq!(result.is_ok(), is_root());
        match fs::symlink_metadata(&node) {
            Ok(meta) => assert!(meta.file_type().is_char_device()),
            Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
        }
        assert!(fs::symlink_metadata(&victim).unwrap().file_type().is_file());
        assert!(!fx.host.shifted.lock().unwrap().contains(&victim));
    }

    /// Add creates a character node, or a block node for disks.
    #[test]
    fn test_add_creates_device_nodes() {
        // This test requires root privileges
        if !is_root() {
            eprintln!("Skipping test: requires root privileges");
            return;
        }

        let fx = Fixture::new(MockHost::default());
        let c1 = fx.add_container("c1", ContainerState::Running, 100);
        fx.host.allow("c1", 1, 3);
        fx.host.allow("c1", 8, 16);

        let event = UeventMessage::decode(&mem_event("add", &[])).unwrap();
        fx.subsystem.device_node_and_forward(&event, &c1).unwrap();

        let disk = kernel_event(
            "add@/devices/pci0000:00/host0/block/sdb",
            &[
                "ACTION=add",
                "DEVPATH=/devices/pci0000:00/host0/block/sdb",
                "SUBSYSTEM=block",
                "DEVTYPE=disk",
                "DEVNAME=sdb",
                "MAJOR=8",
                "MINOR=16",
            ],
        );
        let event = UeventMessage::decode(&disk).unwrap();
        fx.subsystem.device_node_and_forward(&event, &c1).unwrap();

        let null = fs::symlink_metadata(fx.rootfs.path().join("dev/null")).unwrap();
        assert!(null.file_type().is_char_device());
        assert_eq!(null.rdev(), libc::makedev(1, 3));

        let sdb = fs::symlink_metadata(fx.rootfs.path().join("dev/sdb")).unwrap();
        assert!(sdb.file_type().is_block_device());
        assert_eq!(sdb.rdev(), libc::makedev(8, 16));
        assert_eq!(sdb.mode() & 0o777, 0o600);

        assert_eq!(fx.host.shifted.lock().unwrap().len(), 2);
        assert_eq!(fx.injector.pids(), vec![100, 100]);
    }

    /// Remove unlinks the node and tolerates it being gone already.
    #[test]
    fn test_remove_unlinks_node() {
        let fx = Fixture::new(MockHost::default());
        let c1 = fx.add_container("c1", ContainerState::Running, 100);
        fx.host.allow("c1", 1, 3);

        let node = fx.rootfs.path().join("dev/null");
        fs::create_dir_all(node.parent().unwrap()).unwrap();
        fs::write(&node, "").unwrap();

        let event = UeventMessage::decode(&mem_event("remove", &[])).unwrap();
        fx.subsystem.device_node_and_forward(&event, &c1).unwrap();
        assert!(!node.exists());
        fx.subsystem.device_node_and_forward(&event, &c1).unwrap();
        assert_eq!(fx.injector.pids().len(), 2);
    }

    /// Forbidden devices and stopped containers are skipped.
    #[test]
    fn test_forward_respects_state_and_cgroup() {
        let fx = Fixture::new(MockHost::default());
        let running = fx.add_container("c1", ContainerState::Running, 100);
        let stopped = fx.add_container("c2", ContainerState::Stopped, 200);
        fx.host.allow("c2", 1, 3);

        let event = UeventMessage::decode(&mem_event("change", &[])).unwrap();
        fx.subsystem.device_node_and_forward(&event, &running).unwrap();
        fx.subsystem.device_node_and_forward(&event, &stopped).unwrap();

        assert!(fx.injector.injected.lock().unwrap().is_empty());
    }

    /// General events are forwarded to every eligible container.
    #[test]
    fn test_change_event_is_broadcast() {
        let mut fx = Fixture::new(MockHost::default());
        fx.add_container("c1", ContainerState::Running, 100);
        fx.add_container("c2", ContainerState::Setup, 200);
        fx.add_container("c3", ContainerState::Booting, 300);
        fx.host.allow("c1", 1, 3);
        fx.host.allow("c2", 1, 3);

        fx.subsystem.handle_message(&mem_event("change", &[])).unwrap();

        assert_eq!(fx.injector.pids(), vec![100, 200]);
    }

    /// Actions other than add, remove and change are ignored.
    #[test]
    fn test_other_actions_are_ignored() {
        let mut fx = Fixture::new(MockHost::default());
        fx.add_container("c1", ContainerState::Running, 100);
        fx.host.allow("c1", 1, 3);

        fx.subsystem.handle_message(&mem_event("bind", &[])).unwrap();
        fx.subsystem.handle_message(&mem_event("online", &[])).unwrap();

        assert!(fx.injector.injected.lock().unwrap().is_empty());
    }

    /// Synthetic events go to the requesting container with the uuid masked.
    #[test]
    fn test_synthetic_event_targets_one_container() {
        let mut fx = Fixture::new(MockHost::default());
        let c1 = fx.add_container("c1", ContainerState::Running, 100);
        fx.add_container("c2", ContainerState::Running, 200);
        fx.host.allow("c1", 1, 3);
        fx.host.allow("c2", 1, 3);

        let synth = format!("SYNTH_UUID={}", c1.uuid);
        fx.subsystem
            .handle_message(&mem_event("change", &[synth.as_str()]))
            .unwrap();

        assert_eq!(fx.injector.pids(), vec![100]);
        let text = fx.injector.last_text();
        assert!(text.contains("SYNTH_UUID=0\0"));
        assert!(!text.contains(&c1.uuid.to_string()));
    }

    /// Coldboot writes the trigger only for devices the container may use.
    #[test]
    fn test_coldboot_triggers_allowed_devices() {
        let fx = Fixture::new(MockHost::default());
        let c1 = fx.add_container("c1", ContainerState::Running, 100);
        fx.host.allow("c1", 1, 3);

        let devices = fx.sysfs.path().join("devices/virtual/mem");
        for (name, dev) in [("null", "1:3\n"), ("zero", "1:5\n")] {
            fs::create_dir_all(devices.join(name)).unwrap();
            fs::write(devices.join(name).join("dev"), dev).unwrap();
            fs::write(devices.join(name).join("uevent"), "").unwrap();
        }

        let triggered = fx.subsystem.coldboot_trigger(&c1).unwrap();
        assert_eq!(triggered, 1);
        assert_eq!(
            fs::read_to_string(devices.join("null/uevent")).unwrap(),
            format!("add {}", c1.uuid)
        );
        assert_eq!(fs::read_to_string(devices.join("zero/uevent")).unwrap(), "");
    }
}

// ============================================================================
// Message Handling Tests
// ============================================================================

mod messages {
    use arcbox_hotplug::uevent::UdevHeader;
    use arcbox_hotplug::ContainerState;

    use super::mocks::{Fixture, MockHost};

    /// udev-monitor broadcasts are decoded but never dispatched.
    #[test]
    fn test_udev_messages_are_not_dispatched() {
        let mut fx = Fixture::new(MockHost::default());
        fx.add_container("c1", ContainerState::Running, 100);
        fx.host.allow("c1", 1, 3);

        let props = b"ACTION=change\0DEVPATH=/devices/virtual/mem/null\0SUBSYSTEM=mem\0MAJOR=1\0MINOR=3\0";
        let mut raw = UdevHeader::new(u32::try_from(props.len()).unwrap())
            .to_bytes()
            .to_vec();
        raw.extend_from_slice(props);

        fx.subsystem.handle_message(&raw).unwrap();
        assert!(fx.injector.injected.lock().unwrap().is_empty());
    }

    /// Garbage is reported as malformed.
    #[test]
    fn test_garbage_is_rejected() {
        let mut fx = Fixture::new(MockHost::default());
        let err = fx.subsystem.handle_message(b"hello world\0").unwrap_err();
        assert!(err.is_malformed());

        let mut bad_magic = UdevHeader::new(0).to_bytes().to_vec();
        bad_magic[8] = 0;
        bad_magic.extend_from_slice(&[0u8; 32]);
        let err = fx.subsystem.handle_message(&bad_magic).unwrap_err();
        assert!(err.is_malformed());
    }
}

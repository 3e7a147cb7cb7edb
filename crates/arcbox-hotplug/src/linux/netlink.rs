//! Netlink message framing and the rtnetlink link rename.
//!
//! Two netlink families are used: `NETLINK_ROUTE` to rename host interfaces
//! and `NETLINK_KOBJECT_UEVENT` to replay uevents inside a container's
//! network namespace. Both share the request/ack framing below.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::debug;

use crate::error::{HotplugError, Result};

// Netlink protocols
const NETLINK_ROUTE: i32 = 0;

// Netlink message types
const RTM_NEWLINK: u16 = 16;
/// Message type the kernel accepts for uevent injection.
pub(crate) const UEVENT_SEND: u16 = 16;

// Netlink flags
pub(crate) const NLM_F_REQUEST: u16 = 0x0001;
pub(crate) const NLM_F_ACK: u16 = 0x0004;

// Attribute types for RTM_NEWLINK
const IFLA_IFNAME: u16 = 3;

const NLMSG_HDR_LEN: usize = mem::size_of::<NlMsgHdr>();
const IFINFO_LEN: usize = mem::size_of::<IfInfoMsg>();

/// Netlink message header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct NlMsgHdr {
    pub(crate) nlmsg_len: u32,
    pub(crate) nlmsg_type: u16,
    pub(crate) nlmsg_flags: u16,
    pub(crate) nlmsg_seq: u32,
    pub(crate) nlmsg_pid: u32,
}

impl NlMsgHdr {
    fn to_bytes(self) -> [u8; NLMSG_HDR_LEN] {
        let mut out = [0u8; NLMSG_HDR_LEN];
        out[0..4].copy_from_slice(&self.nlmsg_len.to_ne_bytes());
        out[4..6].copy_from_slice(&self.nlmsg_type.to_ne_bytes());
        out[6..8].copy_from_slice(&self.nlmsg_flags.to_ne_bytes());
        out[8..12].copy_from_slice(&self.nlmsg_seq.to_ne_bytes());
        out[12..16].copy_from_slice(&self.nlmsg_pid.to_ne_bytes());
        out
    }

    fn from_bytes(buf: &[u8]) -> Option<Self> {
        let b = buf.get(..NLMSG_HDR_LEN)?;
        Some(Self {
            nlmsg_len: u32::from_ne_bytes([b[0], b[1], b[2], b[3]]),
            nlmsg_type: u16::from_ne_bytes([b[4], b[5]]),
            nlmsg_flags: u16::from_ne_bytes([b[6], b[7]]),
            nlmsg_seq: u32::from_ne_bytes([b[8], b[9], b[10], b[11]]),
            nlmsg_pid: u32::from_ne_bytes([b[12], b[13], b[14], b[15]]),
        })
    }
}

/// Interface info message.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct IfInfoMsg {
    ifi_family: u8,
    _pad: u8,
    ifi_type: u16,
    ifi_index: i32,
    ifi_flags: u32,
    ifi_change: u32,
}

impl IfInfoMsg {
    fn to_bytes(self) -> [u8; IFINFO_LEN] {
        let mut out = [0u8; IFINFO_LEN];
        out[0] = self.ifi_family;
        out[1] = self._pad;
        out[2..4].copy_from_slice(&self.ifi_type.to_ne_bytes());
        out[4..8].copy_from_slice(&self.ifi_index.to_ne_bytes());
        out[8..12].copy_from_slice(&self.ifi_flags.to_ne_bytes());
        out[12..16].copy_from_slice(&self.ifi_change.to_ne_bytes());
        out
    }
}

/// Builds a netlink request frame around `payload`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn request_frame(msg_type: u16, flags: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(NLMSG_HDR_LEN + payload.len());
    let hdr = NlMsgHdr {
        nlmsg_len: (NLMSG_HDR_LEN + payload.len()) as u32,
        nlmsg_type: msg_type,
        nlmsg_flags: flags,
        nlmsg_seq: seq,
        nlmsg_pid: 0,
    };
    msg.extend_from_slice(&hdr.to_bytes());
    msg.extend_from_slice(payload);
    msg
}

/// Frame that asks the kernel to broadcast `raw` as a uevent.
pub(crate) fn uevent_send_frame(raw: &[u8]) -> Vec<u8> {
    request_frame(UEVENT_SEND, NLM_F_REQUEST | NLM_F_ACK, 1, raw)
}

/// Checks a kernel reply for an `NLMSG_ERROR` with a non-zero code.
///
/// Returns the negated errno of a failed request.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn ack_error(reply: &[u8]) -> Option<i32> {
    let hdr = NlMsgHdr::from_bytes(reply)?;
    if hdr.nlmsg_type != libc::NLMSG_ERROR as u16 {
        return None;
    }
    let code = reply.get(NLMSG_HDR_LEN..NLMSG_HDR_LEN + 4)?;
    let code = i32::from_ne_bytes([code[0], code[1], code[2], code[3]]);
    (code != 0).then_some(code)
}

/// Appends a NUL-terminated string attribute, padded to 4 bytes.
#[allow(clippy::cast_possible_truncation)]
fn add_attr_string(msg: &mut Vec<u8>, attr_type: u16, value: &str) {
    let value_bytes = value.as_bytes();
    let attr_len = 4 + value_bytes.len() + 1;
    let padded_len = (attr_len + 3) & !3;

    msg.extend_from_slice(&(attr_len as u16).to_ne_bytes());
    msg.extend_from_slice(&attr_type.to_ne_bytes());
    msg.extend_from_slice(value_bytes);
    msg.push(0);
    msg.extend(std::iter::repeat(0).take(padded_len - attr_len));
}

/// Opens and binds a raw netlink socket of `protocol`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn open_netlink(protocol: i32, groups: u32) -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the result is checked below.
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            protocol,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by socket(2) and is owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = groups;

    // SAFETY: addr is a valid sockaddr_nl and outlives the call.
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Sends `msg` on `fd` and waits for the kernel acknowledgement.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn send_and_ack(fd: RawFd, msg: &[u8]) -> Result<()> {
    // SAFETY: msg is a valid buffer of msg.len() bytes.
    let ret = unsafe { libc::send(fd, msg.as_ptr().cast::<libc::c_void>(), msg.len(), 0) };
    if ret < 0 {
        return Err(HotplugError::Netlink(format!(
            "failed to send netlink message: {}",
            io::Error::last_os_error()
        )));
    }

    let mut buf = [0u8; 4096];
    // SAFETY: buf is a valid writable buffer of buf.len() bytes.
    let len = unsafe { libc::recv(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len(), 0) };
    if len < 0 {
        return Err(HotplugError::Netlink(format!(
            "failed to receive netlink response: {}",
            io::Error::last_os_error()
        )));
    }

    if let Some(code) = ack_error(&buf[..len as usize]) {
        return Err(HotplugError::Netlink(format!(
            "netlink error: {}",
            io::Error::from_raw_os_error(-code)
        )));
    }
    Ok(())
}

/// rtnetlink handle used to rename host interfaces.
pub struct RouteNetlink {
    fd: OwnedFd,
    seq: u32,
}

impl RouteNetlink {
    /// Opens a `NETLINK_ROUTE` socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    pub fn new() -> Result<Self> {
        let fd = open_netlink(NETLINK_ROUTE, 0).map_err(|e| {
            HotplugError::Netlink(format!("failed to create netlink socket: {e}"))
        })?;
        Ok(Self { fd, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Renames the interface `old` to `new`.
    ///
    /// # Errors
    ///
    /// Returns an error if `old` does not exist or the kernel refuses the
    /// rename (e.g. the link is up or `new` is taken).
    #[allow(clippy::cast_possible_wrap)]
    pub fn rename_link(&mut self, old: &str, new: &str) -> Result<()> {
        let ifindex = self.get_ifindex(old)?;
        let seq = self.next_seq();

        let ifinfo = IfInfoMsg {
            ifi_family: 0,
            _pad: 0,
            ifi_type: 0,
            ifi_index: ifindex as i32,
            ifi_flags: 0,
            ifi_change: 0,
        };
        let mut payload = ifinfo.to_bytes().to_vec();
        add_attr_string(&mut payload, IFLA_IFNAME, new);

        let msg = request_frame(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq, &payload);
        send_and_ack(self.fd.as_raw_fd(), &msg)?;
        debug!(ifindex, "Renamed link {} to {}", old, new);
        Ok(())
    }

    /// Gets the interface index by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface is not found.
    pub fn get_ifindex(&self, name: &str) -> Result<u32> {
        let c_name = CString::new(name).map_err(|e| HotplugError::Netlink(e.to_string()))?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if ifindex == 0 {
            return Err(HotplugError::Netlink(format!("interface not found: {name}")));
        }
        Ok(ifindex)
    }
}

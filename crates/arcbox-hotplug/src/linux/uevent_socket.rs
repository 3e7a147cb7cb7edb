//! Kernel uevent multicast socket.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use tracing::debug;

use super::netlink::open_netlink;
use crate::error::{HotplugError, Result};
use crate::uevent::UDEV_MONITOR_TAG;

/// Multicast group of raw kernel uevents.
pub const KERNEL_GROUP: u32 = 1;
/// Multicast group of udev-monitor rebroadcasts.
pub const UDEV_GROUP: u32 = 2;

/// Non-blocking `NETLINK_KOBJECT_UEVENT` socket.
#[derive(Debug)]
pub struct UeventSocket {
    fd: OwnedFd,
}

impl UeventSocket {
    /// Opens a socket subscribed to `groups` with a receive buffer of `rcvbuf` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created, bound or configured.
    pub fn open(groups: u32, rcvbuf: usize) -> Result<Self> {
        let fd = open_netlink(libc::NETLINK_KOBJECT_UEVENT, groups).map_err(|e| {
            HotplugError::Netlink(format!("failed to create uevent socket: {e}"))
        })?;
        let socket = Self { fd };
        socket.set_nonblocking()?;
        socket.set_rcvbuf(rcvbuf)?;
        debug!(groups, rcvbuf, "Opened uevent socket");
        Ok(socket)
    }

    fn set_nonblocking(&self) -> Result<()> {
        let fd = self.fd.as_raw_fd();
        // SAFETY: fcntl on a descriptor we own.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: fcntl on a descriptor we own.
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn set_rcvbuf(&self, size: usize) -> Result<()> {
        let value = size as libc::c_int;
        // SAFETY: value is a valid c_int and outlives the call.
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                std::ptr::addr_of!(value).cast::<libc::c_void>(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Reads one datagram into `buf`.
    ///
    /// Returns the datagram length and the sender's netlink port id, which
    /// is 0 for messages from the kernel. Returns `WouldBlock` when no
    /// message is queued.
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, u32)> {
        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        // SAFETY: buf is a valid writable buffer of buf.len() bytes and
        // addr/addr_len describe a writable sockaddr_nl.
        let len = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                0,
                std::ptr::addr_of_mut!(addr).cast::<libc::sockaddr>(),
                &mut addr_len,
            )
        };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((len as usize, addr.nl_pid))
    }

    /// Netlink port id the kernel assigned to this socket.
    ///
    /// # Errors
    ///
    /// Returns an error if `getsockname` fails.
    #[allow(clippy::cast_possible_truncation)]
    pub fn port_id(&self) -> io::Result<u32> {
        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        // SAFETY: addr/addr_len describe a writable sockaddr_nl.
        let ret = unsafe {
            libc::getsockname(
                self.fd.as_raw_fd(),
                std::ptr::addr_of_mut!(addr).cast::<libc::sockaddr>(),
                &mut addr_len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(addr.nl_pid)
    }
}

/// Whether a datagram from netlink port `sender` may be dispatched.
///
/// Any local process can unicast to our port, so kernel-format uevents are
/// only accepted from the kernel itself. udev-monitor rebroadcasts come from
/// udevd and are never acted upon.
#[must_use]
pub fn is_trusted_sender(raw: &[u8], sender: u32) -> bool {
    sender == 0 || raw.starts_with(UDEV_MONITOR_TAG)
}

impl AsRawFd for UeventSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Unicasts `msg` from a fresh userspace socket to netlink port `port`.
#[cfg(test)]
pub(crate) fn unicast(port: u32, msg: &[u8]) -> io::Result<()> {
    let sender = open_netlink(libc::NETLINK_KOBJECT_UEVENT, 0)?;
    // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
    let mut dest: libc::sockaddr_nl = unsafe { mem::zeroed() };
    dest.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    dest.nl_pid = port;
    // SAFETY: msg and dest are valid for the duration of the call.
    let sent = unsafe {
        libc::sendto(
            sender.as_raw_fd(),
            msg.as_ptr().cast::<libc::c_void>(),
            msg.len(),
            0,
            std::ptr::addr_of!(dest).cast::<libc::sockaddr>(),
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

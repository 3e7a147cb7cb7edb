//! Uevent replay inside another process's namespaces.
//!
//! A uevent can only be delivered to a network namespace by a process that
//! lives in it, so the injector forks a short-lived child that joins the
//! target namespaces and re-sends the message to its local kernel. The
//! child reports failure only through its exit status.

use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sched::{setns, CloneFlags};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, setgid, setgroups, setuid, ForkResult, Gid, Pid, Uid};
use tracing::trace;

use super::netlink::{ack_error, open_netlink, uevent_send_frame};
use crate::error::{ChildStatus, InjectError, InjectStep};
use crate::host::NamespaceInjector;

/// Everything the child needs, allocated before `fork`.
struct Prepared {
    user_ns: Option<CString>,
    net_ns: CString,
    frame: Vec<u8>,
}

impl Prepared {
    fn new(raw: &[u8], pid: i32, join_userns: bool) -> Result<Self, InjectError> {
        let ns_path = |ns: &str| {
            CString::new(format!("/proc/{pid}/ns/{ns}"))
                .map_err(|e| InjectError::Prepare(e.to_string()))
        };
        Ok(Self {
            user_ns: if join_userns { Some(ns_path("user")?) } else { None },
            net_ns: ns_path("net")?,
            frame: uevent_send_frame(raw),
        })
    }
}

/// Fork-based [`NamespaceInjector`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkInjector;

impl ForkInjector {
    /// Creates an injector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl NamespaceInjector for ForkInjector {
    fn inject(&self, raw: &[u8], pid: i32, join_userns: bool) -> Result<(), InjectError> {
        let prepared = Prepared::new(raw, pid, join_userns)?;

        // SAFETY: the child only issues async-signal-safe syscalls on
        // buffers prepared above and leaves through _exit.
        let child = match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => child,
            Ok(ForkResult::Child) => {
                let code = match run_child(&prepared) {
                    Ok(()) => 0,
                    Err(step) => step.exit_code(),
                };
                // SAFETY: terminate the child without running parent destructors.
                unsafe { libc::_exit(code) };
            }
            Err(e) => return Err(InjectError::Fork(io::Error::from(e))),
        };

        let status = wait_child(child)?;
        trace!(target_pid = pid, child = child.as_raw(), %status, "Injection child finished");
        if status.is_success() {
            Ok(())
        } else {
            Err(InjectError::Child { pid, status })
        }
    }
}

fn wait_child(child: Pid) -> Result<ChildStatus, InjectError> {
    loop {
        match waitpid(child, None) {
            Ok(status) => return Ok(ChildStatus::from(status)),
            Err(Errno::EINTR) => {}
            Err(e) => return Err(InjectError::Wait(io::Error::from(e))),
        }
    }
}

/// Joins the namespace behind `path`.
fn join_ns(
    path: &CString,
    nstype: CloneFlags,
    open: InjectStep,
    join: InjectStep,
) -> Result<(), InjectStep> {
    // SAFETY: path is a valid NUL-terminated string.
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(open);
    }
    // SAFETY: fd was just opened and is owned here.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    setns(&fd, nstype).map_err(|_| join)
}

/// Child side of the injection. Must not allocate.
fn run_child(prepared: &Prepared) -> Result<(), InjectStep> {
    if let Some(user_ns) = &prepared.user_ns {
        join_ns(
            user_ns,
            CloneFlags::CLONE_NEWUSER,
            InjectStep::OpenUserNs,
            InjectStep::JoinUserNs,
        )?;
        // Joining a user namespace drops privileges; become its root.
        setuid(Uid::from_raw(0)).map_err(|_| InjectStep::SetUid)?;
        setgid(Gid::from_raw(0)).map_err(|_| InjectStep::SetGid)?;
        setgroups(&[]).map_err(|_| InjectStep::SetGroups)?;
    }

    join_ns(
        &prepared.net_ns,
        CloneFlags::CLONE_NEWNET,
        InjectStep::OpenNetNs,
        InjectStep::JoinNetNs,
    )?;

    let sock = open_netlink(libc::NETLINK_KOBJECT_UEVENT, 0).map_err(|_| InjectStep::OpenSocket)?;
    let fd = sock.as_raw_fd();
    let frame = &prepared.frame;

    // SAFETY: frame is a valid buffer of frame.len() bytes.
    let sent = unsafe { libc::send(fd, frame.as_ptr().cast::<libc::c_void>(), frame.len(), 0) };
    if sent < 0 {
        return Err(InjectStep::Send);
    }

    let mut reply = [0u8; 1024];
    // SAFETY: reply is a valid writable buffer.
    let len = unsafe { libc::recv(fd, reply.as_mut_ptr().cast::<libc::c_void>(), reply.len(), 0) };
    if len < 0 {
        return Err(InjectStep::Ack);
    }
    #[allow(clippy::cast_sign_loss)]
    let len = len as usize;
    if ack_error(&reply[..len]).is_some() {
        return Err(InjectStep::Ack);
    }
    Ok(())
}

//! Error types for hotplug mediation.

use std::fmt;

use nix::sys::wait::WaitStatus;
use thiserror::Error;

/// Result type alias for hotplug operations.
pub type Result<T> = std::result::Result<T, HotplugError>;

/// Errors that can occur while mediating device events.
///
/// None of these are fatal to the daemon: callers log them and drop the
/// event that caused them.
#[derive(Debug, Error)]
pub enum HotplugError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// udev-monitor header failed validation.
    #[error("malformed udev header: {0}")]
    MalformedHeader(String),

    /// Buffer is neither a kernel uevent nor a udev-monitor message.
    #[error("unrecognized message")]
    UnrecognizedMessage,

    /// Message would exceed the fixed uevent buffer capacity.
    #[error("message too large: {len} bytes (max {max})")]
    MessageTooLarge {
        /// Resulting length.
        len: usize,
        /// Capacity.
        max: usize,
    },

    /// The field to replace is not present in the message.
    #[error("field {0} not present in uevent")]
    FieldAbsent(&'static str),

    /// Replacement value cannot be written into a record.
    #[error("invalid replacement: {0}")]
    InvalidReplacement(String),

    /// A selector did not resolve to a MAC address.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// Unregistration target does not exist.
    #[error("mapping not found: {0}")]
    MappingNotFound(String),

    /// Network interface rename failed.
    #[error("rename error: {0}")]
    Rename(String),

    /// Device node creation failed.
    #[error("device node error: {0}")]
    DeviceNode(String),

    /// Netlink error.
    #[error("netlink error: {0}")]
    Netlink(String),

    /// Namespace injection failed.
    #[error("namespace injection failed: {0}")]
    Inject(#[from] InjectError),

    /// Target container is not in a state that accepts the operation.
    #[error("invalid container state: {0}")]
    InvalidState(String),

    /// The container host collaborator refused an operation.
    #[error("container host error: {0}")]
    Host(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),
}

impl HotplugError {
    /// Returns true for errors caused by the message bytes themselves.
    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::MalformedHeader(_) | Self::UnrecognizedMessage | Self::MessageTooLarge { .. }
        )
    }
}

/// Step of the namespace injection sequence run by the forked child.
///
/// Each step owns a distinct exit status so the parent can tell which
/// syscall failed without sharing any memory with the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum InjectStep {
    /// open(`/proc/<pid>/ns/user`)
    OpenUserNs = 10,
    /// setns(CLONE_NEWUSER)
    JoinUserNs = 11,
    /// setuid(0)
    SetUid = 12,
    /// setgid(0)
    SetGid = 13,
    /// setgroups(0, NULL)
    SetGroups = 14,
    /// open(`/proc/<pid>/ns/net`)
    OpenNetNs = 15,
    /// setns(CLONE_NEWNET)
    JoinNetNs = 16,
    /// socket/bind of the uevent netlink socket.
    OpenSocket = 17,
    /// sendto kernel.
    Send = 18,
    /// Receiving or checking the kernel acknowledgement.
    Ack = 19,
}

impl InjectStep {
    const ALL: [Self; 10] = [
        Self::OpenUserNs,
        Self::JoinUserNs,
        Self::SetUid,
        Self::SetGid,
        Self::SetGroups,
        Self::OpenNetNs,
        Self::JoinNetNs,
        Self::OpenSocket,
        Self::Send,
        Self::Ack,
    ];

    /// Exit status used by the child for this step.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        self as i32
    }

    /// Maps a child exit status back to the failed step.
    #[must_use]
    pub fn from_exit_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|step| step.exit_code() == code)
    }
}

impl fmt::Display for InjectStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OpenUserNs => "open user namespace",
            Self::JoinUserNs => "join user namespace",
            Self::SetUid => "setuid",
            Self::SetGid => "setgid",
            Self::SetGroups => "setgroups",
            Self::OpenNetNs => "open network namespace",
            Self::JoinNetNs => "join network namespace",
            Self::OpenSocket => "open uevent socket",
            Self::Send => "send uevent",
            Self::Ack => "kernel acknowledgement",
        };
        f.write_str(name)
    }
}

/// How the injection child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// Exited with status 0.
    Success,
    /// Exited at a known step.
    Failed(InjectStep),
    /// Exited with a status that maps to no step.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
}

impl From<WaitStatus> for ChildStatus {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, 0) => Self::Success,
            WaitStatus::Exited(_, code) => {
                InjectStep::from_exit_code(code).map_or(Self::Exited(code), Self::Failed)
            }
            WaitStatus::Signaled(_, signal, _) => Self::Signaled(signal as i32),
            _ => Self::Exited(-1),
        }
    }
}

impl ChildStatus {
    /// Returns true if the child completed every step.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failed(step) => write!(f, "child failed at {step}"),
            Self::Exited(code) => write!(f, "child exited with status {code}"),
            Self::Signaled(sig) => write!(f, "child killed by signal {sig}"),
        }
    }
}

/// Errors from the fork-based namespace injection primitive.
///
/// Kept apart from [`HotplugError`] because a child failure is reported
/// only through its exit status.
#[derive(Debug, Error)]
pub enum InjectError {
    /// Preparing the request failed before forking.
    #[error("prepare: {0}")]
    Prepare(String),

    /// fork(2) failed.
    #[error("fork failed: {0}")]
    Fork(std::io::Error),

    /// waitpid(2) failed.
    #[error("waitpid failed: {0}")]
    Wait(std::io::Error),

    /// Child terminated unsuccessfully.
    #[error("target pid {pid}: {status}")]
    Child {
        /// Pid whose namespaces were joined.
        pid: i32,
        /// Termination status of the child.
        status: ChildStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_step_exit_codes_roundtrip() {
        for step in InjectStep::ALL {
            assert_eq!(InjectStep::from_exit_code(step.exit_code()), Some(step));
        }
        assert_eq!(InjectStep::from_exit_code(1), None);
    }

    #[test]
    fn test_child_status_decoding() {
        use nix::sys::signal::Signal;
        use nix::unistd::Pid;

        let pid = Pid::from_raw(1234);
        assert_eq!(
            ChildStatus::from(WaitStatus::Exited(pid, 0)),
            ChildStatus::Success
        );
        assert_eq!(
            ChildStatus::from(WaitStatus::Exited(pid, 16)),
            ChildStatus::Failed(InjectStep::JoinNetNs)
        );
        assert_eq!(
            ChildStatus::from(WaitStatus::Exited(pid, 3)),
            ChildStatus::Exited(3)
        );
        assert_eq!(
            ChildStatus::from(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            ChildStatus::Signaled(libc::SIGKILL)
        );
        assert_eq!(
            ChildStatus::from(WaitStatus::Stopped(pid, Signal::SIGSTOP)),
            ChildStatus::Exited(-1)
        );
    }

    #[test]
    fn test_malformed_classification() {
        assert!(HotplugError::UnrecognizedMessage.is_malformed());
        assert!(HotplugError::MalformedHeader("short".into()).is_malformed());
        assert!(!HotplugError::Rename("eth0".into()).is_malformed());
    }

    #[test]
    fn test_inject_error_display() {
        let err = InjectError::Child {
            pid: 42,
            status: ChildStatus::Failed(InjectStep::Ack),
        };
        assert_eq!(
            err.to_string(),
            "target pid 42: child failed at kernel acknowledgement"
        );
    }
}

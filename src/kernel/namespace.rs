/// Namespace flag selection and UTS configuration
use crate::types::{Result, RuntimeError};
use nix::sched::CloneFlags;

/// Clone flags for a container launch.
///
/// PID, UTS, mount, IPC and network namespaces are always private; the user
/// namespace is added only when id mapping is configured.
pub fn clone_flags(user_ns: bool) -> CloneFlags {
    let mut flags = CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWNET;
    if user_ns {
        flags |= CloneFlags::CLONE_NEWUSER;
    }
    flags
}

/// Set the hostname inside the child's UTS namespace
pub fn set_hostname(hostname: &str) -> Result<()> {
    nix::unistd::sethostname(hostname)
        .map_err(|e| RuntimeError::Namespace(format!("sethostname failed: {}", e)))
}

/// Namespaces `exec` joins, in join order. The user namespace is handled
/// separately because joining it is conditional.
pub const JOINABLE_NAMESPACES: &[(&str, CloneFlags)] = &[
    ("mnt", CloneFlags::CLONE_NEWNS),
    ("uts", CloneFlags::CLONE_NEWUTS),
    ("ipc", CloneFlags::CLONE_NEWIPC),
    ("net", CloneFlags::CLONE_NEWNET),
    ("pid", CloneFlags::CLONE_NEWPID),
];

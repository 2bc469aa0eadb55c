/// Typed container launch configuration
///
/// The JSON file format (see `parser`) carries booleans like `use_pivot_root`
/// and `use_seccomp`; here those collapse into closed enums so the boot driver
/// dispatches on variants instead of flag combinations.
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Immutable configuration for a single container launch
#[derive(Clone, Debug)]
pub struct ContainerConfig {
    /// Unique name among live containers on this host
    pub name: String,
    /// Hostname set inside the UTS namespace
    pub hostname: String,
    /// Host-absolute directory that becomes the container root
    pub rootfs: PathBuf,
    /// Workload executable, resolved inside the container
    pub command: String,
    pub args: Vec<String>,
    pub resources: ResourceLimits,
    pub security: SecurityConfig,
    pub network: NetworkConfig,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceLimits {
    /// memory.max in bytes; None imposes no limit
    pub memory_bytes: Option<u64>,
    /// pids.max; None imposes no limit
    pub max_pids: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct SecurityConfig {
    pub isolation: RootStrategy,
    pub readonly_root: bool,
    pub tmpfs: TmpfsConfig,
    pub bind_mounts: Vec<BindMount>,
    pub user_ns: UserNsConfig,
    pub caps: CapConfig,
    pub seccomp: SeccompProfile,
}

/// How the child transitions into the container root.
///
/// Chroot is the fallback for environments without pivot_root support (WSL);
/// it is a variant rather than a flag so the boot driver dispatches on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootStrategy {
    PivotRoot,
    Chroot,
}

#[derive(Clone, Copy, Debug)]
pub struct TmpfsConfig {
    pub enabled: bool,
    pub size_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub readonly: bool,
}

/// One uid_map/gid_map line: maps `count` ids starting at `inner` in the
/// container to ids starting at `outer` on the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub inner: u32,
    pub outer: u32,
    pub count: u32,
}

#[derive(Clone, Debug)]
pub struct UserNsConfig {
    pub enabled: bool,
    pub uid_maps: Vec<IdMap>,
    pub gid_maps: Vec<IdMap>,
    /// Uid/gid the child switches to after the maps are in place
    pub container_uid: u32,
    pub container_gid: u32,
}

#[derive(Clone, Debug, Default)]
pub struct CapConfig {
    /// When set, every capability is dropped except the listed ones.
    /// None leaves the inherited capability sets untouched.
    pub drop_all_then_keep: Option<Vec<Capability>>,
}

/// Capabilities the runtime can retain for a container.
/// Discriminants are the kernel capability numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum Capability {
    CapChown = 0,
    CapDacOverride = 1,
    CapFowner = 3,
    CapFsetid = 4,
    CapKill = 5,
    CapSetgid = 6,
    CapSetuid = 7,
    CapSetpcap = 8,
    CapNetBindService = 10,
    CapNetRaw = 13,
    CapSysChroot = 18,
    CapMknod = 27,
    CapAuditWrite = 29,
    CapSetfcap = 31,
}

impl Capability {
    pub fn number(self) -> u32 {
        self as u32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeccompProfile {
    Off,
    /// Kernel strict mode: only read, write, exit, sigreturn
    Strict,
    /// BPF denylist returning EPERM on a fixed set of host-management syscalls
    DefaultDeny,
}

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub enabled: bool,
    pub bridge_name: String,
    /// Subnet behind the bridge, CIDR notation
    pub subnet: String,
    pub gateway: Ipv4Addr,
    /// Explicit container IP; None derives one from the container PID
    pub container_ip: Option<Ipv4Addr>,
    pub port_forwards: Vec<PortForward>,
    pub dns: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortForward {
    pub host_port: u16,
    pub container_port: u16,
}

pub const DEFAULT_HOSTNAME: &str = "mun-os-container";
pub const DEFAULT_BRIDGE: &str = "mun-bridge0";
pub const DEFAULT_SUBNET: &str = "172.18.0.0/24";
pub const DEFAULT_GATEWAY: Ipv4Addr = Ipv4Addr::new(172, 18, 0, 1);
pub const DEFAULT_TMPFS_MB: u64 = 64;

impl Default for TmpfsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size_bytes: DEFAULT_TMPFS_MB * 1024 * 1024,
        }
    }
}

impl Default for UserNsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            uid_maps: Vec::new(),
            gid_maps: Vec::new(),
            container_uid: 0,
            container_gid: 0,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            isolation: RootStrategy::PivotRoot,
            readonly_root: false,
            tmpfs: TmpfsConfig::default(),
            bind_mounts: Vec::new(),
            user_ns: UserNsConfig::default(),
            caps: CapConfig::default(),
            seccomp: SeccompProfile::DefaultDeny,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bridge_name: DEFAULT_BRIDGE.to_string(),
            subnet: DEFAULT_SUBNET.to_string(),
            gateway: DEFAULT_GATEWAY,
            container_ip: None,
            port_forwards: Vec::new(),
            dns: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_numbers_match_kernel_values() {
        assert_eq!(Capability::CapChown.number(), 0);
        assert_eq!(Capability::CapNetRaw.number(), 13);
        assert_eq!(Capability::CapSetfcap.number(), 31);
    }

    #[test]
    fn capability_deserializes_from_kernel_names() {
        let cap: Capability = serde_json::from_str("\"CAP_NET_BIND_SERVICE\"").unwrap();
        assert_eq!(cap, Capability::CapNetBindService);
    }

    #[test]
    fn tmpfs_default_is_64_mib() {
        let tmpfs = TmpfsConfig::default();
        assert!(tmpfs.enabled);
        assert_eq!(tmpfs.size_bytes, 64 * 1024 * 1024);
    }
}

/// JSON configuration file parsing and override resolution
///
/// Precedence, lowest to highest: file values, environment variables,
/// command-line flags. The file schema mirrors the documented JSON layout
/// (`use_pivot_root`, `seccomp_profile`, ...); `build` folds it into the
/// typed `ContainerConfig` the launcher consumes.
use crate::config::types::{
    BindMount, CapConfig, Capability, ContainerConfig, IdMap, NetworkConfig, PortForward,
    ResourceLimits, RootStrategy, SeccompProfile, SecurityConfig, TmpfsConfig, UserNsConfig,
    DEFAULT_BRIDGE, DEFAULT_GATEWAY, DEFAULT_HOSTNAME, DEFAULT_TMPFS_MB,
};
use crate::types::{Result, RuntimeError};
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

pub const ENV_MEMORY_LIMIT: &str = "MUN_OS_MEMORY_LIMIT";
pub const ENV_PROCESS_LIMIT: &str = "MUN_OS_PROCESS_LIMIT";

const MAX_MEMORY_LIMIT_MB: u64 = 1_000_000;
const MAX_PROCESS_LIMIT: u32 = 100_000;

/// On-disk configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub hostname: Option<String>,
    pub rootfs_path: Option<PathBuf>,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub resources: ResourcesSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub network: NetworkSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourcesSection {
    #[serde(default)]
    pub memory_limit_mb: u64,
    #[serde(default)]
    pub process_limit: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecuritySection {
    #[serde(default = "default_true")]
    pub use_pivot_root: bool,
    #[serde(default)]
    pub readonly_rootfs: bool,
    #[serde(default)]
    pub use_user_namespace: bool,
    #[serde(default)]
    pub uid_mappings: Vec<MappingEntry>,
    #[serde(default)]
    pub gid_mappings: Vec<MappingEntry>,
    #[serde(default)]
    pub container_uid: u32,
    #[serde(default)]
    pub container_gid: u32,
    #[serde(default = "default_true")]
    pub drop_capabilities: bool,
    #[serde(default = "default_keep_capabilities")]
    pub keep_capabilities: Vec<Capability>,
    #[serde(default = "default_true")]
    pub use_seccomp: bool,
    #[serde(default = "default_seccomp_profile")]
    pub seccomp_profile: String,
    #[serde(default)]
    pub bind_mounts: Vec<BindMountEntry>,
    #[serde(default = "default_true")]
    pub setup_tmpfs: bool,
    #[serde(default = "default_tmpfs_size_mb")]
    pub tmpfs_size_mb: u64,
}

impl Default for SecuritySection {
    fn default() -> Self {
        SecuritySection {
            use_pivot_root: true,
            readonly_rootfs: false,
            use_user_namespace: false,
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            container_uid: 0,
            container_gid: 0,
            drop_capabilities: true,
            keep_capabilities: default_keep_capabilities(),
            use_seccomp: true,
            seccomp_profile: default_seccomp_profile(),
            bind_mounts: Vec::new(),
            setup_tmpfs: true,
            tmpfs_size_mb: DEFAULT_TMPFS_MB,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSection {
    #[serde(default)]
    pub enable_networking: bool,
    #[serde(default = "default_bridge_name")]
    pub bridge_name: String,
    pub container_ip: Option<String>,
    #[serde(default = "default_gateway_ip")]
    pub gateway_ip: String,
    #[serde(default)]
    pub port_mappings: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_dns: bool,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            enable_networking: false,
            bridge_name: default_bridge_name(),
            container_ip: None,
            gateway_ip: default_gateway_ip(),
            port_mappings: Vec::new(),
            enable_dns: true,
        }
    }
}

/// uid_map/gid_map entry; accepts both the documented field names and the
/// container_id/host_id/range spelling older config files used.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MappingEntry {
    #[serde(alias = "container_id")]
    pub inner: u32,
    #[serde(alias = "host_id")]
    pub outer: u32,
    #[serde(default = "default_map_count", alias = "range")]
    pub count: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindMountEntry {
    pub source: PathBuf,
    pub target: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

fn default_true() -> bool {
    true
}

fn default_map_count() -> u32 {
    1
}

fn default_keep_capabilities() -> Vec<Capability> {
    vec![Capability::CapNetRaw]
}

fn default_seccomp_profile() -> String {
    "default".to_string()
}

fn default_bridge_name() -> String {
    DEFAULT_BRIDGE.to_string()
}

fn default_gateway_ip() -> String {
    DEFAULT_GATEWAY.to_string()
}

fn default_tmpfs_size_mb() -> u64 {
    DEFAULT_TMPFS_MB
}

/// Values supplied on the command line, overriding file and environment
#[derive(Debug, Default)]
pub struct Overrides {
    pub name: Option<String>,
    pub rootfs: Option<PathBuf>,
    pub hostname: Option<String>,
    pub memory_mb: Option<u64>,
    pub max_pids: Option<u32>,
    /// Bare trailing argv: command followed by its arguments
    pub command: Vec<String>,
}

/// Load and parse a configuration file
pub fn load_file(path: &Path) -> Result<FileConfig> {
    let data = fs::read_to_string(path).map_err(|e| {
        RuntimeError::Config(format!("could not read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&data).map_err(|e| {
        RuntimeError::Config(format!("could not parse config file {}: {}", path.display(), e))
    })
}

/// Fold file, environment, and CLI values into a launch configuration.
///
/// `config_path` names the file `file` came from; its stem becomes the
/// container name when no explicit name is given.
pub fn build(
    file: Option<FileConfig>,
    config_path: Option<&Path>,
    overrides: &Overrides,
) -> Result<ContainerConfig> {
    let file = file.unwrap_or_default();

    let hostname = overrides
        .hostname
        .clone()
        .or(file.hostname)
        .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string());

    let name = overrides
        .name
        .clone()
        .or_else(|| {
            config_path
                .and_then(|p| p.file_stem())
                .map(|s| s.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| hostname.clone());

    let rootfs = overrides
        .rootfs
        .clone()
        .or(file.rootfs_path)
        .ok_or_else(|| RuntimeError::Config("'rootfs_path' is a required field".to_string()))?;

    let (command, args) = if let Some((cmd, rest)) = overrides.command.split_first() {
        (cmd.clone(), rest.to_vec())
    } else {
        let cmd = file
            .command
            .ok_or_else(|| RuntimeError::Config("'command' is a required field".to_string()))?;
        (cmd, file.args)
    };

    let memory_mb = overrides
        .memory_mb
        .or_else(|| env_limit_mb())
        .unwrap_or(file.resources.memory_limit_mb);
    let max_pids = overrides
        .max_pids
        .or_else(|| env_process_limit())
        .unwrap_or(file.resources.process_limit);

    let resources = ResourceLimits {
        memory_bytes: (memory_mb > 0).then(|| memory_mb * 1024 * 1024),
        max_pids: (max_pids > 0).then_some(max_pids),
    };

    let security = build_security(file.security)?;
    let network = build_network(file.network)?;

    Ok(ContainerConfig {
        name,
        hostname,
        rootfs,
        command,
        args,
        resources,
        security,
        network,
    })
}

/// Load only the network section of a config file. Teardown paths use this
/// so removing stale DNAT rules does not require the rest of the launch
/// configuration to still be valid.
pub fn load_network(path: &Path) -> Result<NetworkConfig> {
    let file = load_file(path)?;
    build_network(file.network)
}

fn build_security(sec: SecuritySection) -> Result<SecurityConfig> {
    let isolation = if sec.use_pivot_root && !running_under_wsl() {
        RootStrategy::PivotRoot
    } else {
        RootStrategy::Chroot
    };

    let seccomp = if !sec.use_seccomp {
        SeccompProfile::Off
    } else {
        match sec.seccomp_profile.as_str() {
            "strict" => SeccompProfile::Strict,
            "default" => SeccompProfile::DefaultDeny,
            other => {
                return Err(RuntimeError::Config(format!(
                    "unknown seccomp profile '{}' (expected 'default' or 'strict')",
                    other
                )))
            }
        }
    };

    let user_ns = resolve_user_ns(&sec);

    Ok(SecurityConfig {
        isolation,
        readonly_root: sec.readonly_rootfs,
        tmpfs: TmpfsConfig {
            enabled: sec.setup_tmpfs,
            size_bytes: sec.tmpfs_size_mb * 1024 * 1024,
        },
        bind_mounts: sec
            .bind_mounts
            .into_iter()
            .map(|b| BindMount {
                source: b.source,
                target: b.target,
                readonly: b.readonly,
            })
            .collect(),
        user_ns,
        caps: CapConfig {
            drop_all_then_keep: sec.drop_capabilities.then_some(sec.keep_capabilities),
        },
        seccomp,
    })
}

fn resolve_user_ns(sec: &SecuritySection) -> UserNsConfig {
    if !sec.use_user_namespace {
        return UserNsConfig::default();
    }

    let to_idmap = |entries: &[MappingEntry]| -> Vec<IdMap> {
        entries
            .iter()
            .map(|m| IdMap {
                inner: m.inner,
                outer: m.outer,
                count: m.count,
            })
            .collect()
    };

    let mut uid_maps = to_idmap(&sec.uid_mappings);
    let mut gid_maps = to_idmap(&sec.gid_mappings);

    // With no explicit maps, map container root onto the invoking user.
    if uid_maps.is_empty() {
        uid_maps.push(IdMap {
            inner: 0,
            outer: nix::unistd::geteuid().as_raw(),
            count: 1,
        });
    }
    if gid_maps.is_empty() {
        gid_maps.push(IdMap {
            inner: 0,
            outer: nix::unistd::getegid().as_raw(),
            count: 1,
        });
    }

    UserNsConfig {
        enabled: true,
        uid_maps,
        gid_maps,
        container_uid: sec.container_uid,
        container_gid: sec.container_gid,
    }
}

fn build_network(net: NetworkSection) -> Result<NetworkConfig> {
    let gateway: Ipv4Addr = strip_netmask(&net.gateway_ip).parse().map_err(|_| {
        RuntimeError::Config(format!("invalid gateway IP '{}'", net.gateway_ip))
    })?;

    let container_ip = match net.container_ip.as_deref() {
        Some(ip) => Some(strip_netmask(ip).parse().map_err(|_| {
            RuntimeError::Config(format!("invalid container IP '{}'", ip))
        })?),
        None => None,
    };

    let port_forwards = net
        .port_mappings
        .iter()
        .map(|m| parse_port_mapping(m))
        .collect::<Result<Vec<_>>>()?;

    // Subnet is the /24 the gateway sits in.
    let o = gateway.octets();
    let subnet = format!("{}.{}.{}.0/24", o[0], o[1], o[2]);

    Ok(NetworkConfig {
        enabled: net.enable_networking,
        bridge_name: net.bridge_name,
        subnet,
        gateway,
        container_ip,
        port_forwards,
        dns: net.enable_dns,
    })
}

/// Parse a "host:container" port mapping
pub fn parse_port_mapping(mapping: &str) -> Result<PortForward> {
    let (host, container) = mapping.split_once(':').ok_or_else(|| {
        RuntimeError::Config(format!(
            "invalid port mapping '{}' (expected 'host:container')",
            mapping
        ))
    })?;
    let host_port = host
        .parse()
        .map_err(|_| RuntimeError::Config(format!("invalid host port '{}'", host)))?;
    let container_port = container
        .parse()
        .map_err(|_| RuntimeError::Config(format!("invalid container port '{}'", container)))?;
    Ok(PortForward {
        host_port,
        container_port,
    })
}

fn strip_netmask(ip: &str) -> &str {
    ip.split_once('/').map_or(ip, |(addr, _)| addr)
}

fn env_limit_mb() -> Option<u64> {
    parse_env_limit(ENV_MEMORY_LIMIT, MAX_MEMORY_LIMIT_MB as i64).map(|v| v as u64)
}

fn env_process_limit() -> Option<u32> {
    parse_env_limit(ENV_PROCESS_LIMIT, MAX_PROCESS_LIMIT as i64).map(|v| v as u32)
}

/// Read an integer limit from the environment, clamped to [0, max].
/// Unparseable values are ignored with a warning.
fn parse_env_limit(var: &str, max: i64) -> Option<i64> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<i64>() {
        Ok(value) => Some(value.clamp(0, max)),
        Err(_) => {
            log::warn!("ignoring unparseable {}={}", var, raw);
            None
        }
    }
}

/// True when running under WSL, where pivot_root is unreliable
pub fn running_under_wsl() -> bool {
    fs::read_to_string("/proc/version")
        .map(|v| {
            let v = v.to_lowercase();
            v.contains("microsoft") || v.contains("wsl")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_from_json(json: &str) -> Result<ContainerConfig> {
        let file: FileConfig = serde_json::from_str(json).unwrap();
        build(Some(file), None, &Overrides::default())
    }

    #[test]
    fn minimal_config_gets_documented_defaults() {
        let config = build_from_json(
            r#"{"rootfs_path": "/tmp/alpine", "command": "/bin/sh"}"#,
        )
        .unwrap();

        assert_eq!(config.hostname, "mun-os-container");
        assert_eq!(config.name, "mun-os-container");
        assert_eq!(config.command, "/bin/sh");
        assert!(config.args.is_empty());
        assert_eq!(config.resources.memory_bytes, None);
        assert_eq!(config.resources.max_pids, None);
        assert!(!config.network.enabled);
        assert_eq!(config.network.bridge_name, "mun-bridge0");
        assert_eq!(config.security.seccomp, SeccompProfile::DefaultDeny);
        assert!(config.security.tmpfs.enabled);
        assert_eq!(config.security.tmpfs.size_bytes, 64 * 1024 * 1024);
        assert_eq!(
            config.security.caps.drop_all_then_keep,
            Some(vec![Capability::CapNetRaw])
        );
    }

    #[test]
    fn missing_rootfs_is_rejected() {
        let err = build_from_json(r#"{"command": "/bin/sh"}"#).unwrap_err();
        assert!(err.to_string().contains("rootfs_path"));
    }

    #[test]
    fn missing_command_is_rejected() {
        let err = build_from_json(r#"{"rootfs_path": "/tmp/alpine"}"#).unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn cli_argv_overrides_file_command() {
        let file: FileConfig = serde_json::from_str(
            r#"{"rootfs_path": "/r", "command": "/bin/sh", "args": ["-c", "true"]}"#,
        )
        .unwrap();
        let overrides = Overrides {
            command: vec!["/bin/echo".to_string(), "hello".to_string()],
            ..Overrides::default()
        };
        let config = build(Some(file), None, &overrides).unwrap();
        assert_eq!(config.command, "/bin/echo");
        assert_eq!(config.args, vec!["hello".to_string()]);
    }

    #[test]
    fn name_defaults_to_config_file_stem() {
        let file: FileConfig =
            serde_json::from_str(r#"{"rootfs_path": "/r", "command": "/bin/sh"}"#).unwrap();
        let config = build(
            Some(file),
            Some(Path::new("/etc/mun-os/webapp.json")),
            &Overrides::default(),
        )
        .unwrap();
        assert_eq!(config.name, "webapp");
    }

    #[test]
    fn memory_limit_converts_to_bytes() {
        let config = build_from_json(
            r#"{"rootfs_path": "/r", "command": "/bin/sh",
                "resources": {"memory_limit_mb": 32, "process_limit": 10}}"#,
        )
        .unwrap();
        assert_eq!(config.resources.memory_bytes, Some(32 * 1024 * 1024));
        assert_eq!(config.resources.max_pids, Some(10));
    }

    #[test]
    fn strict_seccomp_profile_is_recognized() {
        let config = build_from_json(
            r#"{"rootfs_path": "/r", "command": "/bin/sh",
                "security": {"use_seccomp": true, "seccomp_profile": "strict"}}"#,
        )
        .unwrap();
        assert_eq!(config.security.seccomp, SeccompProfile::Strict);
    }

    #[test]
    fn disabled_seccomp_wins_over_profile() {
        let config = build_from_json(
            r#"{"rootfs_path": "/r", "command": "/bin/sh",
                "security": {"use_seccomp": false, "seccomp_profile": "strict"}}"#,
        )
        .unwrap();
        assert_eq!(config.security.seccomp, SeccompProfile::Off);
    }

    #[test]
    fn unknown_seccomp_profile_is_rejected() {
        let err = build_from_json(
            r#"{"rootfs_path": "/r", "command": "/bin/sh",
                "security": {"seccomp_profile": "bogus"}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn port_mappings_parse_host_colon_container() {
        let pf = parse_port_mapping("8080:80").unwrap();
        assert_eq!(pf.host_port, 8080);
        assert_eq!(pf.container_port, 80);

        assert!(parse_port_mapping("8080").is_err());
        assert!(parse_port_mapping("x:80").is_err());
        assert!(parse_port_mapping("8080:y").is_err());
    }

    #[test]
    fn gateway_netmask_is_stripped() {
        let config = build_from_json(
            r#"{"rootfs_path": "/r", "command": "/bin/sh",
                "network": {"enable_networking": true, "gateway_ip": "172.18.0.1/24"}}"#,
        )
        .unwrap();
        assert_eq!(config.network.gateway, Ipv4Addr::new(172, 18, 0, 1));
        assert_eq!(config.network.subnet, "172.18.0.0/24");
    }

    #[test]
    fn user_ns_defaults_map_root_to_invoking_user() {
        let config = build_from_json(
            r#"{"rootfs_path": "/r", "command": "/bin/sh",
                "security": {"use_user_namespace": true}}"#,
        )
        .unwrap();
        let user_ns = &config.security.user_ns;
        assert!(user_ns.enabled);
        assert_eq!(user_ns.uid_maps.len(), 1);
        assert_eq!(user_ns.uid_maps[0].inner, 0);
        assert_eq!(user_ns.uid_maps[0].count, 1);
        assert_eq!(user_ns.container_uid, 0);
    }

    #[test]
    fn mapping_entries_accept_legacy_field_names() {
        let entry: MappingEntry =
            serde_json::from_str(r#"{"container_id": 0, "host_id": 1000, "range": 1}"#).unwrap();
        assert_eq!(entry.inner, 0);
        assert_eq!(entry.outer, 1000);
        assert_eq!(entry.count, 1);
    }

    #[test]
    fn env_limits_are_clamped_and_bad_values_ignored() {
        // A test-local variable name keeps this free of cross-test races.
        std::env::set_var("MUN_OS_TEST_LIMIT", "2000000");
        assert_eq!(parse_env_limit("MUN_OS_TEST_LIMIT", 1_000_000), Some(1_000_000));

        std::env::set_var("MUN_OS_TEST_LIMIT", "-5");
        assert_eq!(parse_env_limit("MUN_OS_TEST_LIMIT", 1_000_000), Some(0));

        std::env::set_var("MUN_OS_TEST_LIMIT", "not-a-number");
        assert_eq!(parse_env_limit("MUN_OS_TEST_LIMIT", 1_000_000), None);

        std::env::remove_var("MUN_OS_TEST_LIMIT");
        assert_eq!(parse_env_limit("MUN_OS_TEST_LIMIT", 1_000_000), None);
    }

    #[test]
    fn unknown_top_level_keys_are_rejected() {
        let parsed: std::result::Result<FileConfig, _> =
            serde_json::from_str(r#"{"rootfs_path": "/r", "comand": "/bin/sh"}"#);
        assert!(parsed.is_err());
    }
}

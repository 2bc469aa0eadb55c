/// Pre-launch configuration validation
///
/// Every check here runs before any privileged operation, so a rejected
/// configuration leaves no side effects on the host.
use crate::config::types::{ContainerConfig, IdMap};
use crate::kernel::caps;
use crate::types::{Result, RuntimeError};

const MIN_MEMORY_BYTES: u64 = 1024 * 1024;

/// Validate a launch configuration against the runtime invariants
pub fn validate(config: &ContainerConfig) -> Result<()> {
    if config.name.is_empty() {
        return Err(RuntimeError::Config(
            "container name must not be empty".to_string(),
        ));
    }

    if !config.rootfs.is_dir() {
        return Err(RuntimeError::Config(format!(
            "rootfs '{}' does not exist or is not a directory",
            config.rootfs.display()
        )));
    }

    if config.command.is_empty() {
        return Err(RuntimeError::Config("command must not be empty".to_string()));
    }

    validate_resources(config)?;

    if config.security.user_ns.enabled {
        validate_id_maps("uid_map", &config.security.user_ns.uid_maps)?;
        validate_id_maps("gid_map", &config.security.user_ns.gid_maps)?;
        validate_target_id_mapped(
            "container_uid",
            config.security.user_ns.container_uid,
            &config.security.user_ns.uid_maps,
        )?;
        validate_target_id_mapped(
            "container_gid",
            config.security.user_ns.container_gid,
            &config.security.user_ns.gid_maps,
        )?;
    }

    if let Some(ref keep) = config.security.caps.drop_all_then_keep {
        let held = caps::current_effective()?;
        for cap in keep {
            if held & (1u64 << cap.number()) == 0 {
                return Err(RuntimeError::Config(format!(
                    "cannot keep {:?}: the supervisor does not hold it",
                    cap
                )));
            }
        }
    }

    Ok(())
}

fn validate_resources(config: &ContainerConfig) -> Result<()> {
    if let Some(memory) = config.resources.memory_bytes {
        if memory < MIN_MEMORY_BYTES {
            return Err(RuntimeError::Config(format!(
                "memory limit {} bytes is below the 1 MiB minimum",
                memory
            )));
        }
    }
    if let Some(pids) = config.resources.max_pids {
        if pids < 1 {
            return Err(RuntimeError::Config(
                "process limit must be at least 1".to_string(),
            ));
        }
    }
    Ok(())
}

/// Map entries must fit in u32 on the inner side and must not overlap there.
fn validate_id_maps(label: &str, maps: &[IdMap]) -> Result<()> {
    if maps.is_empty() {
        return Err(RuntimeError::Config(format!(
            "{} must contain at least one entry when user namespaces are enabled",
            label
        )));
    }

    for map in maps {
        if map.count == 0 {
            return Err(RuntimeError::Config(format!(
                "{} entry {} {} {} has zero count",
                label, map.inner, map.outer, map.count
            )));
        }
        if map.inner.checked_add(map.count).is_none() {
            return Err(RuntimeError::Config(format!(
                "{} entry {} {} {} overflows the id space",
                label, map.inner, map.outer, map.count
            )));
        }
    }

    let mut sorted: Vec<&IdMap> = maps.iter().collect();
    sorted.sort_by_key(|m| m.inner);
    for pair in sorted.windows(2) {
        if pair[0].inner + pair[0].count > pair[1].inner {
            return Err(RuntimeError::Config(format!(
                "{} entries overlap on the container side: {}..{} and {}..{}",
                label,
                pair[0].inner,
                pair[0].inner + pair[0].count,
                pair[1].inner,
                pair[1].inner + pair[1].count,
            )));
        }
    }

    Ok(())
}

fn validate_target_id_mapped(label: &str, id: u32, maps: &[IdMap]) -> Result<()> {
    let mapped = maps
        .iter()
        .any(|m| id >= m.inner && (id - m.inner) < m.count);
    if !mapped {
        return Err(RuntimeError::Config(format!(
            "{} {} is not covered by any map entry",
            label, id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{
        NetworkConfig, ResourceLimits, SecurityConfig, UserNsConfig,
    };
    use std::path::PathBuf;

    fn test_config(rootfs: PathBuf) -> ContainerConfig {
        ContainerConfig {
            name: "test".to_string(),
            hostname: "test".to_string(),
            rootfs,
            command: "/bin/true".to_string(),
            args: Vec::new(),
            resources: ResourceLimits::default(),
            security: SecurityConfig {
                // avoid depending on the caller's capability set in tests
                caps: Default::default(),
                ..SecurityConfig::default()
            },
            network: NetworkConfig::default(),
        }
    }

    #[test]
    fn accepts_minimal_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn rejects_missing_rootfs() {
        let config = test_config(PathBuf::from("/definitely/not/a/rootfs"));
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_memory_below_one_mib() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        config.resources.memory_bytes = Some(512 * 1024);
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("1 MiB"));
    }

    #[test]
    fn accepts_memory_at_one_mib() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        config.resources.memory_bytes = Some(1024 * 1024);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn rejects_overlapping_id_maps() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        config.security.user_ns = UserNsConfig {
            enabled: true,
            uid_maps: vec![
                IdMap { inner: 0, outer: 1000, count: 10 },
                IdMap { inner: 5, outer: 2000, count: 10 },
            ],
            gid_maps: vec![IdMap { inner: 0, outer: 1000, count: 1 }],
            container_uid: 0,
            container_gid: 0,
        };
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn rejects_id_map_overflow() {
        let err = validate_id_maps(
            "uid_map",
            &[IdMap { inner: u32::MAX - 1, outer: 0, count: 5 }],
        )
        .unwrap_err();
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn rejects_unmapped_container_uid() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        config.security.user_ns = UserNsConfig {
            enabled: true,
            uid_maps: vec![IdMap { inner: 0, outer: 1000, count: 1 }],
            gid_maps: vec![IdMap { inner: 0, outer: 1000, count: 1 }],
            container_uid: 1000,
            container_gid: 0,
        };
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("container_uid"));
    }

    #[test]
    fn kept_caps_must_be_held_by_the_supervisor() {
        use crate::config::types::{CapConfig, Capability};

        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        config.security.caps = CapConfig {
            drop_all_then_keep: Some(vec![Capability::CapSysChroot]),
        };

        let held = caps::current_effective().unwrap();
        let result = validate(&config);
        if held & (1u64 << Capability::CapSysChroot.number()) == 0 {
            assert!(result.unwrap_err().to_string().contains("does not hold"));
        } else {
            assert!(result.is_ok());
        }
    }

    #[test]
    fn adjacent_id_maps_do_not_overlap() {
        assert!(validate_id_maps(
            "uid_map",
            &[
                IdMap { inner: 0, outer: 1000, count: 10 },
                IdMap { inner: 10, outer: 2000, count: 10 },
            ],
        )
        .is_ok());
    }
}

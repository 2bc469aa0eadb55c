/// Cgroup v2 resource control for containers
use crate::config::types::ResourceLimits;
use crate::types::{Result, RuntimeError};
use std::fs;
use std::path::{Path, PathBuf};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Manages one container's subtree under the unified hierarchy
pub struct CgroupManager {
    name: String,
    path: PathBuf,
}

impl CgroupManager {
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() || name.len() > 255 {
            return Err(RuntimeError::Cgroup(
                "invalid cgroup name length".to_string(),
            ));
        }

        let sanitized = sanitize_name(name);
        Ok(Self {
            path: Path::new(CGROUP_ROOT).join(&sanitized),
            name: sanitized,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the subtree and write the configured limits.
    /// An already existing directory is fine; limits are rewritten.
    pub fn setup(&self, limits: &ResourceLimits) -> Result<()> {
        if !cgroups_available() {
            return Err(RuntimeError::Cgroup(
                "cgroup v2 unified hierarchy is not mounted at /sys/fs/cgroup".to_string(),
            ));
        }

        if let Err(e) = fs::create_dir(&self.path) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(RuntimeError::Cgroup(format!(
                    "could not create cgroup directory {}: {}",
                    self.path.display(),
                    e
                )));
            }
        }

        if let Some(memory) = limits.memory_bytes {
            self.write_control("memory.max", &memory.to_string())?;
        }
        if let Some(pids) = limits.max_pids {
            self.write_control("pids.max", &pids.to_string())?;
        }

        log::debug!("cgroup ready at {}", self.path.display());
        Ok(())
    }

    /// Attach a process by writing its PID to cgroup.procs
    pub fn apply(&self, pid: i32) -> Result<()> {
        if pid <= 0 {
            return Err(RuntimeError::Cgroup(format!("invalid PID {}", pid)));
        }
        self.write_control("cgroup.procs", &pid.to_string())
    }

    /// Remove the subtree. Failure is a warning only; it usually means tasks
    /// are still attached and the directory will be removable later.
    pub fn teardown(&self) {
        if !self.path.exists() {
            return;
        }
        if let Err(e) = fs::remove_dir(&self.path) {
            log::warn!(
                "could not remove cgroup directory {}: {}",
                self.path.display(),
                e
            );
        }
    }

    fn write_control(&self, file: &str, value: &str) -> Result<()> {
        let control = self.path.join(file);
        fs::write(&control, value).map_err(|e| {
            RuntimeError::Cgroup(format!("could not write {}: {}", control.display(), e))
        })
    }
}

/// Teardown for a container this process did not launch (stop/cleanup paths)
pub fn teardown_by_name(name: &str) {
    if let Ok(manager) = CgroupManager::new(name) {
        manager.teardown();
    }
}

fn sanitize_name(name: &str) -> String {
    name.replace('/', "_").replace("..", "_")
}

/// Whether a cgroup v2 hierarchy is mounted at the expected location
pub fn cgroups_available() -> bool {
    Path::new(CGROUP_ROOT).join("cgroup.controllers").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        assert!(CgroupManager::new("").is_err());
    }

    #[test]
    fn rejects_overlong_name() {
        let name = "x".repeat(256);
        assert!(CgroupManager::new(&name).is_err());
    }

    #[test]
    fn sanitizes_path_traversal() {
        let manager = CgroupManager::new("../evil/name").unwrap();
        assert_eq!(manager.name(), "__evil_name");
        assert!(manager.path().starts_with(CGROUP_ROOT));
        assert!(!manager.path().to_string_lossy().contains(".."));
    }

    #[test]
    fn subtree_sits_under_the_unified_root() {
        let manager = CgroupManager::new("web").unwrap();
        assert_eq!(manager.path(), Path::new("/sys/fs/cgroup/web"));
    }

    #[test]
    fn apply_rejects_nonpositive_pid() {
        let manager = CgroupManager::new("web").unwrap();
        assert!(manager.apply(0).is_err());
        assert!(manager.apply(-1).is_err());
    }
}

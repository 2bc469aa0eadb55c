//! On-disk container state store
//!
//! One directory per container under the state root, each holding a single
//! pretty-printed `state.json`. Records are reconciled against
//! kernel-observable liveness on every read, so a `running` entry whose PID
//! has vanished is reported as stopped without a separate repair pass.

use crate::types::{ContainerState, ContainerStatus, Result, RuntimeError};
use nix::sys::signal::kill;
use nix::unistd::{Pid, User};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "state.json";

pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open the per-host store at `~/.local/share/mun-os/state/`, resolving
    /// the invoking user's home (not root's) when running under sudo.
    pub fn open() -> Result<Self> {
        let home = resolve_home()?;
        let root = home.join(".local/share/mun-os/state");
        fs::create_dir_all(&root).map_err(|e| {
            RuntimeError::State(format!(
                "could not create state directory {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    /// Open a store rooted at an explicit directory
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            RuntimeError::State(format!(
                "could not create state directory {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a record, creating the container's directory if needed
    pub fn save(&self, state: &ContainerState) -> Result<()> {
        let dir = self.root.join(&state.name);
        fs::create_dir_all(&dir).map_err(|e| {
            RuntimeError::State(format!("could not create {}: {}", dir.display(), e))
        })?;

        let path = dir.join(STATE_FILE);
        let json = to_pretty_json(state)?;
        fs::write(&path, json)
            .map_err(|e| RuntimeError::State(format!("could not write {}: {}", path.display(), e)))
    }

    /// Load one record by name, reconciling status against liveness.
    /// Returns None when no record exists.
    pub fn load(&self, name: &str) -> Result<Option<ContainerState>> {
        let path = self.root.join(name).join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read_to_string(&path)
            .map_err(|e| RuntimeError::State(format!("could not read {}: {}", path.display(), e)))?;
        let mut state: ContainerState = serde_json::from_str(&data).map_err(|e| {
            RuntimeError::State(format!("corrupt state record {}: {}", path.display(), e))
        })?;

        reconcile(&mut state);
        Ok(Some(state))
    }

    /// List all records, reconciled, sorted by name
    pub fn list(&self) -> Result<Vec<ContainerState>> {
        let mut states = Vec::new();

        let entries = fs::read_dir(&self.root).map_err(|e| {
            RuntimeError::State(format!("could not read {}: {}", self.root.display(), e))
        })?;
        for entry in entries {
            let entry = entry.map_err(RuntimeError::Io)?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.load(&name) {
                Ok(Some(state)) => states.push(state),
                Ok(None) => {}
                Err(e) => log::warn!("skipping unreadable record '{}': {}", name, e),
            }
        }

        states.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(states)
    }

    /// Delete a container's record directory
    pub fn remove(&self, name: &str) -> Result<()> {
        let dir = self.root.join(name);
        if !dir.exists() {
            return Err(RuntimeError::State(format!(
                "no state recorded for container '{}'",
                name
            )));
        }
        fs::remove_dir_all(&dir)
            .map_err(|e| RuntimeError::State(format!("could not remove {}: {}", dir.display(), e)))
    }
}

/// A recorded `running` status is only as good as the PID behind it
fn reconcile(state: &mut ContainerState) {
    if state.status == ContainerStatus::Running && !pid_alive(state.pid) {
        log::debug!(
            "container '{}' recorded running but PID {} is gone",
            state.name,
            state.pid
        );
        state.status = ContainerStatus::Stopped;
    }
}

/// Zero-signal liveness probe
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Pretty-print with 4-space indent, matching the established record layout
fn to_pretty_json(state: &ContainerState) -> Result<String> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    state
        .serialize(&mut serializer)
        .map_err(|e| RuntimeError::State(format!("could not serialize state: {}", e)))?;
    String::from_utf8(out)
        .map_err(|e| RuntimeError::State(format!("state serialization produced bad UTF-8: {}", e)))
}

/// Home directory of the real user: under sudo, the invoking user's, not root's
fn resolve_home() -> Result<PathBuf> {
    if let Ok(sudo_user) = std::env::var("SUDO_USER") {
        if !sudo_user.is_empty() && sudo_user != "root" {
            if let Ok(Some(user)) = User::from_name(&sudo_user) {
                return Ok(user.dir);
            }
        }
    }

    std::env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| RuntimeError::State("HOME environment variable not set".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, pid: i32, status: ContainerStatus) -> ContainerState {
        ContainerState {
            name: name.to_string(),
            pid,
            status,
            config_path: format!("/etc/mun-os/{}.json", name),
            ip: Some("172.18.0.5".to_string()),
            bridge: Some("mun-bridge0".to_string()),
            veth_host: Some(format!("veth{}", pid)),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::with_root(dir.path()).unwrap();

        // Our own PID is alive, so the status survives reconciliation.
        let pid = std::process::id() as i32;
        let state = sample("web", pid, ContainerStatus::Running);
        store.save(&state).unwrap();

        let loaded = store.load("web").unwrap().unwrap();
        assert_eq!(loaded.name, "web");
        assert_eq!(loaded.pid, pid);
        assert_eq!(loaded.status, ContainerStatus::Running);
        assert_eq!(loaded.ip.as_deref(), Some("172.18.0.5"));
        assert_eq!(loaded.config_path, "/etc/mun-os/web.json");
    }

    #[test]
    fn load_reports_stopped_for_a_dead_pid() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::with_root(dir.path()).unwrap();

        // PIDs near pid_max are never concurrently alive in practice.
        let state = sample("ghost", i32::MAX - 1, ContainerStatus::Running);
        store.save(&state).unwrap();

        let loaded = store.load("ghost").unwrap().unwrap();
        assert_eq!(loaded.status, ContainerStatus::Stopped);
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::with_root(dir.path()).unwrap();
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn list_returns_records_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::with_root(dir.path()).unwrap();

        store.save(&sample("zeta", 1, ContainerStatus::Stopped)).unwrap();
        store.save(&sample("alpha", 1, ContainerStatus::Stopped)).unwrap();

        let names: Vec<String> = store.list().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }

    #[test]
    fn remove_deletes_the_record_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::with_root(dir.path()).unwrap();

        store.save(&sample("gone", 1, ContainerStatus::Stopped)).unwrap();
        store.remove("gone").unwrap();

        assert!(store.load("gone").unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn remove_missing_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::with_root(dir.path()).unwrap();
        assert!(store.remove("never-existed").is_err());
    }

    #[test]
    fn records_are_pretty_printed_with_four_space_indent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::with_root(dir.path()).unwrap();
        store.save(&sample("fmt", 1, ContainerStatus::Stopped)).unwrap();

        let raw = fs::read_to_string(dir.path().join("fmt").join("state.json")).unwrap();
        assert!(raw.contains("\n    \"name\""));
    }

    #[test]
    fn our_own_pid_probes_alive() {
        assert!(pid_alive(std::process::id() as i32));
        assert!(!pid_alive(0));
        assert!(!pid_alive(-5));
    }
}

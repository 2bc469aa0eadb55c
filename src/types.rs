/// Core types and error definitions for the mun-os runtime
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Custom error types for mun-os
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Namespace error: {0}")]
    Namespace(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("User namespace error: {0}")]
    UserNs(String),

    #[error("Capability error: {0}")]
    Caps(String),

    #[error("Seccomp error: {0}")]
    Seccomp(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Process error: {0}")]
    Process(String),
}

impl From<nix::errno::Errno> for RuntimeError {
    fn from(err: nix::errno::Errno) -> Self {
        RuntimeError::Process(err.to_string())
    }
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Lifecycle status of a managed container
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Persisted record for one container, written by `start` and reconciled
/// against kernel-observable liveness on load.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerState {
    /// Container name, unique among live containers on this host
    pub name: String,
    /// Host PID of the container init process
    pub pid: i32,
    pub status: ContainerStatus,
    /// Absolute path of the config file the container was started from
    pub config_path: String,
    /// IP assigned on the bridge, when networking was enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Bridge the container was attached to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    /// Host-side veth endpoint name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub veth_host: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ContainerStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&ContainerStatus::Stopped).unwrap(),
            "\"stopped\""
        );
    }

    #[test]
    fn state_round_trips_without_optional_fields() {
        let state = ContainerState {
            name: "web".to_string(),
            pid: 4242,
            status: ContainerStatus::Running,
            config_path: "/etc/mun-os/web.json".to_string(),
            ip: None,
            bridge: None,
            veth_host: None,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(!json.contains("veth_host"));
        let back: ContainerState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "web");
        assert_eq!(back.pid, 4242);
        assert_eq!(back.status, ContainerStatus::Running);
    }
}

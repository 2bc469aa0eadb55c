//! Container configuration
//!
//! Typed launch configuration, JSON file parsing, and pre-launch validation.

pub mod parser;
pub mod types;
pub mod validator;

pub use types::{
    BindMount, CapConfig, Capability, ContainerConfig, IdMap, NetworkConfig, PortForward,
    ResourceLimits, RootStrategy, SeccompProfile, SecurityConfig, TmpfsConfig, UserNsConfig,
};

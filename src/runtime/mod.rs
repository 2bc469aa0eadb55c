//! Container lifecycle
//!
//! The launcher owns the clone/handshake/boot sequence; the supervisor
//! implements the user-facing commands on top of it and the state store.

pub mod exec;
pub mod launcher;
pub mod supervisor;

pub use launcher::{launch, wait, LaunchMode, LaunchedContainer};

//! # cove-server
//!
//! HTTP daemon exposing Cove sandbox management.
//!
//! The binary wires a [`cove_core::SandboxManager`] to the host (real
//! hypervisor launcher, `ip`/`iptables` networking), reconciles leftover
//! state from a previous run, and serves the JSON API in [`http`].

pub mod config;
pub mod http;

pub use config::{ConfigError, ServerConfig};

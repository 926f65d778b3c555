//! Portal5 - transparent URL-rewriting proxy.
//!
//! This crate wires the workspace together for the `portal5` binary:
//!
//! - [`config`]: the JSON configuration file
//! - [`worker`]: the persisted worker identity

pub mod config;
pub mod worker;

pub use config::{ConfigError, PortalConfig};
pub use worker::resolve_settings;

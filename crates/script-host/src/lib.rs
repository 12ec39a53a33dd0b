//! Script Host
//!
//! Command-line host around the script runtime: layered configuration,
//! tracing setup, built-in modules and an executor registry wired from config.

pub mod config;
pub mod demo;
pub mod host;
pub mod logging;

pub use config::{ConfigError, ExecutorSpec, HostConfig};
pub use host::{Host, HostStatus};

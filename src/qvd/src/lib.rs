//! Daemon internals: configuration and the RMI server. The `quo-vadisd`
//! binary wires these to the process machinery (daemonization, signals,
//! logging).

pub mod config;
pub mod server;

pub use config::{Config, ServerConfig};
pub use server::RmiServer;

//! Domain layer: runtime configuration.

pub mod config;

pub use config::{BridgeConfig, ConfigError, ConfigFile};

//! Configuration management infrastructure.
//!
//! Hierarchical configuration using figment:
//! defaults ← user file ← project file ← environment.

pub mod loader;

pub use loader::{ConfigLoader, ConfigSource, LoadedConfig, ENV_PREFIX};

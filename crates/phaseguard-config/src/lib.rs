//! Configuration management for phaseguard
//!
//! Hierarchical configuration with discovery and precedence:
//! CLI > file > defaults. The TOML file carries `[defaults]`, `[lock]`,
//! `[state]`, `[registry]` and `[engine]` sections.

mod builder;
mod discovery;
mod error;
mod model;
mod sources;
mod validation;

pub use builder::ConfigBuilder;
pub use discovery::CONFIG_FILE;
pub use error::ConfigError;
pub use model::*;

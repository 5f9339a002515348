//! Command-line interface for phaseguard
//!
//! ## Module Structure
//!
//! - `args`: CLI argument definitions (clap)
//! - `run`: entry point, config discovery and command dispatch
//! - `commands`: command implementations and input loading
//! - `tests`: parsing and dispatch tests (cfg(test) only)

pub mod args;
mod commands;
mod run;


pub use args::{ClaimCommands, Cli, Commands, EvidenceCommands, RegistryCommands, RunArgs};
pub use run::{Invocation, run, run_with};

//! Command-line front end for the node communication layer.
//!
//! Provides commands for:
//! - Running an in-process demo mesh over the in-memory broker
//! - Printing and validating configuration files

pub mod commands;
pub mod config;

pub use commands::{Command, CommandResult};
pub use config::CliConfig;

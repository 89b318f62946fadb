//! Command-line arguments.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use corelib::logging::init_logging;
use corelib::CommConfig;

use crate::commands::Command;

#[derive(Debug, Parser)]
#[command(name = "nodelink")]
#[command(about = "Duplex node channels over a message broker", long_about = None)]
pub struct CliConfig {
    /// JSON configuration file; missing fields use the defaults
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl CliConfig {
    /// Load the communication configuration named on the command line.
    pub fn load_comm_config(&self) -> anyhow::Result<CommConfig> {
        let config = match &self.config {
            Some(path) => CommConfig::from_json_file(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => CommConfig::default(),
        };
        Ok(config)
    }

    pub fn run(self) -> anyhow::Result<()> {
        let comm_config = self.load_comm_config()?;
        let filter = self.log_filter.as_deref().unwrap_or(&comm_config.log_filter);
        init_logging(filter);
        let result = self.command.execute(comm_config)?;
        print!("{}", result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_demo_arguments() {
        let cli = CliConfig::parse_from(["nodelink", "demo", "--nodes", "4", "--requests", "2", "--relay"]);
        match cli.command {
            Command::Demo { nodes, requests, relay } => {
                assert_eq!(nodes, 4);
                assert_eq!(requests, 2);
                assert!(relay);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = CliConfig::parse_from(["nodelink", "--config", "/nonexistent/nodelink.json", "config"]);
        assert!(cli.load_comm_config().is_err());
    }
}

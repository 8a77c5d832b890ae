//! Configuration commands

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tunnel_session::SessionConfig;

/// Arguments for the config command
#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show {
        /// Config file to load instead of the default location
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the default config file location
    Path,
}

/// Run the config command
pub fn run(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Show { config } => run_show(config),
        ConfigCommand::Path => run_path(),
    }
}

/// Load `path`, or the default config file if present
pub fn load(path: Option<PathBuf>) -> Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => SessionConfig::load_default().context("loading default config"),
    }
}

fn run_show(path: Option<PathBuf>) -> Result<()> {
    let config = load(path)?;
    print!("{}", render(&config)?);
    Ok(())
}

fn run_path() -> Result<()> {
    match SessionConfig::default_path() {
        Some(path) => println!("{}", path.display()),
        None => println!("No config directory available on this platform"),
    }
    Ok(())
}

fn render(config: &SessionConfig) -> Result<String> {
    toml::to_string_pretty(config).context("serializing config")
}

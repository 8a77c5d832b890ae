use anyhow::Result;
use clap::{Parser, Subcommand};

mod bridge;
mod commands;

#[derive(Parser)]
#[command(name = "tunnel-connect", about = "Connect to a tunnel host through its relay")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a session and bridge it to stdin/stdout
    Connect(commands::connect::ConnectArgs),
    /// Inspect session configuration
    Config(commands::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Connect(args) => commands::connect::run(args).await,
        Commands::Config(args) => commands::config::run(args),
    }
}

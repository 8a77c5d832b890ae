//! Connect command: open a session and bridge it to the terminal

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunnel_session::{
    AccessToken, FnRetryHandler, RetryingEvent, SessionConfig, StaticTokenProvider,
    TunnelDescriptor, TunnelSessionController,
};
use url::Url;

use crate::bridge;

/// Arguments for the connect command
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Config file to load instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Tunnel descriptor (JSON) to connect with
    #[arg(long, conflicts_with_all = ["relay_uri", "host"])]
    pub descriptor: Option<PathBuf>,

    /// Tunnel id when no descriptor file is given
    #[arg(long, default_value = "tunnel")]
    pub tunnel_id: String,

    /// Relay URI to connect through
    #[arg(long)]
    pub relay_uri: Option<Url>,

    /// Direct host endpoint (host:port); may be repeated
    #[arg(long = "host")]
    pub host: Vec<String>,

    /// Access token for the tunnel
    #[arg(long, env = "TUNNEL_ACCESS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Give up after this many reconnect attempts
    #[arg(long)]
    pub max_attempts: Option<u32>,
}

/// Run the connect command
pub async fn run(args: ConnectArgs) -> Result<()> {
    let mut config = super::config::load(args.config.clone())?;
    if let Some(max) = args.max_attempts {
        config = config.with_max_attempts(max);
    }
    let descriptor = descriptor(&args, &config)?;

    let provider = match &args.token {
        Some(token) => StaticTokenProvider::new(AccessToken::new(token.clone())),
        None => StaticTokenProvider::empty(),
    };
    let session = TunnelSessionController::builder()
        .config(config)
        .token_provider(Arc::new(provider))
        .retry_handler(Arc::new(FnRetryHandler::new(log_retry)))
        .build()
        .context("invalid session config")?;

    info!(tunnel_id = %descriptor.tunnel_id, "Connecting to tunnel");
    let cancel = CancellationToken::new();
    tokio::select! {
        result = session.connect_tunnel_session(Some(&descriptor), &cancel) => {
            result.context("connecting to tunnel")?;
        }
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            session.close_session(None).await;
            return Ok(());
        }
    }

    let context = session.session_context();
    info!(session_id = %context.session_id, "Connected; reading stdin");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Interrupted, closing session");
    };
    bridge::run(&session, stdin, tokio::io::stdout(), interrupt).await
}

/// Build the descriptor from a file or the endpoint flags
fn descriptor(args: &ConnectArgs, config: &SessionConfig) -> Result<TunnelDescriptor> {
    let mut descriptor = match &args.descriptor {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading descriptor {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parsing descriptor {}", path.display()))?
        }
        None => {
            if args.relay_uri.is_none() && args.host.is_empty() {
                bail!("either --descriptor, --relay-uri or --host is required");
            }
            let mut descriptor = TunnelDescriptor::new(args.tunnel_id.clone());
            if let Some(uri) = &args.relay_uri {
                descriptor = descriptor.with_relay(uri.clone());
            }
            for host in &args.host {
                descriptor = descriptor.with_host_endpoint(host.clone());
            }
            descriptor
        }
    };

    if let Some(token) = &args.token {
        descriptor = descriptor.with_access_token(config.access_scope.clone(), token.clone());
    }
    Ok(descriptor)
}

fn log_retry(event: &mut RetryingEvent) {
    warn!(
        attempt = event.attempt,
        delay = ?event.delay,
        error = %event.error,
        "Connection lost, reconnecting"
    );
}

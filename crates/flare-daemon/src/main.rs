//! `flared` - Flare rendezvous daemon.

use anyhow::Context;
use clap::Parser;
use flare_crypto::Identity;
use flare_daemon::{Config, Daemon};
use flare_proto::{PROTOCOL_ID, Stream};
use flare_transport::{Host, TcpHost};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flared")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "flared.toml")]
    config: PathBuf,

    /// Identity key file (overrides the configured one)
    #[arg(short, long)]
    identity: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let identity_path = cli.identity.unwrap_or_else(|| config.identity.clone());
    let identity = Identity::load_or_generate(&identity_path)
        .with_context(|| format!("loading identity from {}", identity_path.display()))?;

    let host = TcpHost::new(identity, Vec::new());
    let (local, mut inbound) = host.listen(config.parse_listen_addr()?).await?;
    tracing::info!("I am {}", host.local_peer_id());
    for addr in host.listen_addrs() {
        tracing::info!("Reachable at {}", addr.with_peer(&host.local_peer_id()));
    }
    tracing::debug!("Bound {local}");

    let daemon = Arc::new(Daemon::new(config.secret.clone()));

    loop {
        tokio::select! {
            accepted = inbound.recv() => {
                let Some(accepted) = accepted else {
                    anyhow::bail!("listener stopped");
                };
                if accepted.protocol != PROTOCOL_ID {
                    tracing::debug!(
                        "Unknown protocol {} from {}",
                        accepted.protocol,
                        accepted.peer.short()
                    );
                    accepted.stream.reset();
                    continue;
                }
                let daemon = Arc::clone(&daemon);
                tokio::spawn(async move {
                    daemon.handle_stream(accepted.peer, accepted.stream).await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                return Ok(());
            }
        }
    }
}

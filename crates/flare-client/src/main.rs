//! `flarec` - Flare client.

use anyhow::Context;
use clap::{Parser, Subcommand};
use flare_client::{ClientError, Config, ConnManager, HolePunchOrchestrator, Timings, connmgr};
use flare_crypto::Identity;
use flare_proto::{Domain, Stream};
use flare_transport::{Host, TcpHost};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flarec")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "flarec.toml")]
    config: PathBuf,

    /// Run the TCP domain
    #[arg(long, overrides_with = "no_tcp")]
    tcp: bool,

    /// Skip the TCP domain
    #[arg(long, overrides_with = "tcp")]
    no_tcp: bool,

    /// Run the UDP domain
    #[arg(long, overrides_with = "no_udp")]
    udp: bool,

    /// Skip the UDP domain
    #[arg(long, overrides_with = "udp")]
    no_udp: bool,

    /// Nickname to announce
    #[arg(long)]
    nick: Option<String>,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Announce and keep trying direct connections until Ctrl-C
    Run,

    /// Print the peers announced in each domain
    ListPeers,

    /// List peers and immediately try a direct connection to each
    EagerTest,

    /// Generate an identity key file
    Keygen {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
}

impl Cli {
    fn domains(&self) -> Vec<Domain> {
        let mut domains = Vec::new();
        if self.tcp || !self.no_tcp {
            domains.push(Domain::tcp());
        }
        if self.udp || !self.no_udp {
            domains.push(Domain::udp());
        }
        domains
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Keygen { output }) = &cli.command {
        let identity = Identity::generate();
        identity
            .save(output)
            .with_context(|| format!("writing {}", output.display()))?;
        println!("{}", identity.peer_id());
        return Ok(());
    }

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let nick = cli.nick.clone().unwrap_or_else(|| config.nick());

    match cli.command {
        None | Some(Commands::Run) => run(&cli, &config, &nick).await,
        Some(Commands::ListPeers) => list_peers(&cli, &config, &nick).await,
        Some(Commands::EagerTest) => eager_test(&cli, &config, &nick).await,
        Some(Commands::Keygen { .. }) => Ok(()),
    }
}

/// Build a host and orchestrator for every enabled, configured domain
async fn orchestrators(
    cli: &Cli,
    config: &Config,
    nick: &str,
    persistent: bool,
    connmgr: &Arc<ConnManager>,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<Vec<HolePunchOrchestrator<TcpHost>>> {
    let mut out = Vec::new();
    for domain in cli.domains() {
        let Some(settings) = config.domain(&domain, nick)? else {
            tracing::debug!("{domain} not configured, skipping");
            continue;
        };
        let stun_servers = config
            .domains
            .get(domain.as_str())
            .map(|d| d.stun_servers.clone())
            .unwrap_or_default();

        let identity = if persistent {
            let path = config.identity_path(&domain);
            Identity::load_or_generate(path)
                .with_context(|| format!("loading identity from {}", path.display()))?
        } else {
            Identity::generate()
        };

        let host = TcpHost::new(identity, stun_servers);
        host.set_observer(connmgr.clone());
        let (_, mut inbound) = host.listen("0.0.0.0:0".parse()?).await?;
        tokio::spawn(async move {
            // No inbound protocols are served by the client
            while let Some(stream) = inbound.recv().await {
                stream.stream.reset();
            }
        });
        tracing::info!("{domain}: I am {}", host.local_peer_id());

        out.push(HolePunchOrchestrator::new(
            Arc::new(host),
            settings,
            config.secret.clone(),
            connmgr.clone(),
            Timings::default(),
            shutdown.clone(),
        ));
    }
    if out.is_empty() {
        anyhow::bail!("no domain enabled and configured");
    }
    Ok(out)
}

async fn run(cli: &Cli, config: &Config, nick: &str) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown) = watch::channel(false);
    let connmgr = Arc::new(ConnManager::default());
    let trimmer = connmgr.spawn_trimmer(connmgr::TRIM_INTERVAL, shutdown.clone());

    let mut tasks = Vec::new();
    for orchestrator in orchestrators(cli, config, nick, true, &connmgr, &shutdown).await? {
        tasks.push(tokio::spawn(orchestrator.run()));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    shutdown_tx.send_replace(true);

    for task in tasks {
        match task.await {
            Ok(Ok(()) | Err(ClientError::Shutdown)) => {}
            Ok(Err(e)) if e.is_auth_failure() => {
                tracing::error!("Orchestrator stopped, check the shared secret: {e}");
            }
            Ok(Err(e)) => tracing::warn!("Orchestrator stopped: {e}"),
            Err(e) => tracing::warn!("Orchestrator task failed: {e}"),
        }
    }
    trimmer.await?;
    Ok(())
}

async fn list_peers(cli: &Cli, config: &Config, nick: &str) -> anyhow::Result<()> {
    let (_shutdown_tx, shutdown) = watch::channel(false);
    let connmgr = Arc::new(ConnManager::default());

    for orchestrator in orchestrators(cli, config, nick, false, &connmgr, &shutdown).await? {
        let peers = orchestrator.list_peers().await?;
        for peer in peers {
            println!("{} [{}]", peer.peer_id, peer.nick);
        }
    }
    Ok(())
}

async fn eager_test(cli: &Cli, config: &Config, nick: &str) -> anyhow::Result<()> {
    let (_shutdown_tx, shutdown) = watch::channel(false);
    let connmgr = Arc::new(ConnManager::default());

    for orchestrator in orchestrators(cli, config, nick, false, &connmgr, &shutdown).await? {
        let peers = orchestrator.list_peers().await?;
        for peer in peers {
            match orchestrator.attempt_direct(&peer).await {
                Ok(()) => println!("{} [{}]: OK", peer.peer_id, peer.nick),
                Err(e) => println!("{} [{}]: {e}", peer.peer_id, peer.nick),
            }
        }
    }
    Ok(())
}

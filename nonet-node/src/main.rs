// NoNet chat node: host a session or join one on the local network.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use nonet_core::{PeerId, SessionEvent, SessionRole};
use nonet_node::console::Console;
use nonet_node::{config, HostSession, PeerRegistry, PeerSession};

#[derive(Parser)]
#[command(name = "nonet", version, about = "Offline LAN chat over TCP")]
struct Cli {
    /// Config file (default: ~/.config/nonet/config.toml, then /etc/nonet/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Session TCP port
    #[arg(long)]
    port: Option<u16>,
    /// Local username (announced to the host, prefixed to sent text)
    #[arg(long)]
    username: Option<PeerId>,
    #[command(subcommand)]
    role: RoleArg,
}

#[derive(Subcommand)]
enum RoleArg {
    /// Host a session and accept peers
    Host,
    /// Join the session hosted at HOST_IP
    Join {
        #[arg(value_name = "HOST_IP")]
        host: IpAddr,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut cfg = config::load(cli.config.as_deref());
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(name) = cli.username {
        cfg.username = Some(name);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.role, cfg))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(role: RoleArg, cfg: config::Config) -> anyhow::Result<()> {
    let options = cfg.connection_options();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let registry = PeerRegistry::new(Arc::new(event_tx));
    let me = cfg.local_id();

    let (session_role, host) = match role {
        RoleArg::Host => {
            let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), cfg.port);
            let host = match HostSession::start(bind, registry.clone(), options).await {
                Ok(host) => host,
                Err(e) => {
                    tracing::error!(error = %e, "cannot host session");
                    return Err(e).context("cannot host session");
                }
            };
            println!(
                "* hosting on port {} as {} ({})",
                host.local_addr().port(),
                me,
                host.state()
            );
            (SessionRole::Host, Some(host))
        }
        RoleArg::Join { host: ip } => {
            let addr = SocketAddr::new(ip, cfg.port);
            let session = match PeerSession::connect(addr, &me, registry.clone(), options).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::error!(addr = %addr, error = %e, "cannot join session");
                    return Err(e).context("cannot join session");
                }
            };
            println!("* joined {} as {}", session.host_addr(), me);
            (SessionRole::Peer, None)
        }
    };

    let console = Console::new(session_role, me, registry.clone(), cfg.prefix_sender);
    let outcome = console
        .drive(
            BufReader::new(tokio::io::stdin()),
            &mut event_rx,
            shutdown_signal(),
        )
        .await;

    if let Some(host) = host {
        host.stop().await;
    }
    registry.shutdown();
    outcome.context("console failed")
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

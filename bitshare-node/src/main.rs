// BitShare node: mesh daemon plus one-shot scan, send and receive commands.

mod config;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bitshare_core::{
    FileTransferInfo, MeshCoordinator, Peer, ScanOptions, TransferOptions,
};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bitshare-node")]
#[command(about = "BitShare mesh node", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file instead of the default search path.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Node name announced to peers.
    #[arg(short, long, global = true)]
    name: Option<String>,
    /// TCP listen port.
    #[arg(short, long, global = true)]
    port: Option<u16>,
    /// Disable the relay transport.
    #[arg(long, global = true)]
    no_relay: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the mesh and accept incoming files until interrupted.
    Run {
        /// Where received files go.
        #[arg(short, long)]
        downloads: Option<PathBuf>,
    },
    /// Scan every transport once and list what answered.
    Scan {
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },
    /// Show the peer directory after one discovery round.
    Peers,
    /// Send a file to a peer, by ID or name.
    Send {
        file: PathBuf,
        peer: String,
        #[arg(long, default_value = "10")]
        scan_timeout: u64,
    },
    /// Wait for a peer to send one file.
    Receive {
        #[arg(short, long)]
        downloads: Option<PathBuf>,
        /// Seconds to wait for an offer.
        #[arg(short, long, default_value = "300")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bitshare=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(name) = cli.name {
        cfg.mesh.node_name = name;
    }
    if let Some(port) = cli.port {
        cfg.mesh.listen_port = port;
    }
    if cli.no_relay {
        cfg.mesh.enable_relay = false;
    }

    let node = MeshCoordinator::new(cfg.mesh.clone()).context("invalid mesh configuration")?;
    node.start_node().await?;
    let res = match cli.command {
        Commands::Run { downloads } => {
            let dir = downloads.unwrap_or_else(|| cfg.download_dir());
            cmd_run(&node, dir).await
        }
        Commands::Scan { timeout } => cmd_scan(&node, Duration::from_secs(timeout)).await,
        Commands::Peers => cmd_peers(&node).await,
        Commands::Send {
            file,
            peer,
            scan_timeout,
        } => cmd_send(&node, &file, &peer, Duration::from_secs(scan_timeout)).await,
        Commands::Receive { downloads, timeout } => {
            let dir = downloads.unwrap_or_else(|| cfg.download_dir());
            cmd_receive(&node, dir, Duration::from_secs(timeout)).await
        }
    };
    node.stop_node().await?;
    res
}

async fn cmd_run(node: &MeshCoordinator, downloads: PathBuf) -> Result<()> {
    info!(id = %node.node_id(), name = %node.node_name(), downloads = %downloads.display(), "node running");
    let accept = {
        let node = node.clone();
        async move {
            loop {
                let Some(offer) = node.wait_for_transfer_offer(Duration::from_secs(3600)).await else {
                    continue;
                };
                let node = node.clone();
                let dir = downloads.clone();
                tokio::spawn(async move {
                    let options = TransferOptions::default();
                    match node.receive_file_chunked(&offer.peer_id, &dir, &options).await {
                        Ok(info) => print_transfer("received", &info),
                        Err(e) => warn!(peer = %offer.peer_id, "receive failed: {}", e),
                    }
                });
            }
        }
    };
    tokio::select! {
        _ = accept => {}
        r = shutdown_signal() => r?,
    }
    Ok(())
}

async fn cmd_scan(node: &MeshCoordinator, timeout: Duration) -> Result<()> {
    let report = node.scan(&ScanOptions::default().with_timeout(timeout)).await?;
    if let Some(e) = report.error() {
        warn!("{}", e);
    }
    if report.peers.is_empty() {
        println!("no peers found");
    }
    for p in &report.peers {
        println!(
            "{:<24} {:<20} {:<12} {:>3}  {}",
            p.id,
            p.name,
            p.protocol.to_string(),
            p.signal_strength,
            p.address
        );
    }
    Ok(())
}

async fn cmd_peers(node: &MeshCoordinator) -> Result<()> {
    let timeout = Duration::from_secs(node.config().background_scan_timeout_secs);
    node.scan(&ScanOptions::default().with_timeout(timeout)).await?;
    let info = node.get_connection_info();
    println!("mode: {:?}, isolated: {}", info.mode, info.client_isolation);
    for p in node.get_known_peers()? {
        print_peer(&p);
    }
    Ok(())
}

async fn cmd_send(node: &MeshCoordinator, file: &Path, peer: &str, scan_timeout: Duration) -> Result<()> {
    node.scan(&ScanOptions::default().with_timeout(scan_timeout)).await?;
    let options = TransferOptions::default().with_progress(|t| {
        info!(file = %t.file_name, done = t.completed_count, total = t.total_chunks, "{:.0}%", t.progress_percent())
    });
    let info = node
        .send_file_chunked(file, peer, &options)
        .await
        .with_context(|| format!("sending {} to {}", file.display(), peer))?;
    print_transfer("sent", &info);
    Ok(())
}

async fn cmd_receive(node: &MeshCoordinator, downloads: PathBuf, timeout: Duration) -> Result<()> {
    info!(id = %node.node_id(), "waiting for a file");
    let offer = node
        .wait_for_transfer_offer(timeout)
        .await
        .context("no transfer offer arrived")?;
    let info = node
        .receive_file_chunked(&offer.peer_id, &downloads, &TransferOptions::default())
        .await
        .with_context(|| format!("receiving from {}", offer.peer_id))?;
    print_transfer("received", &info);
    Ok(())
}

fn print_peer(p: &Peer) {
    let route = p
        .best_route()
        .map(|r| format!("{} hop(s) via {}", r.hop_count, r.next_hop))
        .unwrap_or_else(|| "-".into());
    println!(
        "{:<24} {:<20} {:<8} {:<10} {:<12} {}",
        p.id,
        p.name,
        if p.is_online { "online" } else { "offline" },
        p.connection_quality.to_string(),
        p.protocol.to_string(),
        route
    );
}

fn print_transfer(verb: &str, t: &FileTransferInfo) {
    println!(
        "{} {} ({} bytes, {} chunks, {:.1} KiB/s) -> {}",
        verb,
        t.file_name,
        t.file_size,
        t.total_chunks,
        t.transfer_rate / 1024.0,
        t.file_path.display()
    );
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("shutting down");
    Ok(())
}

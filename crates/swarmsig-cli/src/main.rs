//! swarmsig - join a WebTorrent swarm and negotiate WebRTC data channels
//!
//! Usage:
//!   swarmsig sintel.toml
//!   swarmsig --tracker wss://tracker.example/ --numwant 3 --max-messages 100 sintel.toml

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use swarmsig::{
    event_channel, DescriptorFileLoader, RtcConnectionFactory, SessionReport, SwarmEvent,
    SwarmSession, WsRelayTransport, EVENT_CHANNEL_SIZE,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use config::Config;

#[derive(Parser)]
#[command(name = "swarmsig")]
#[command(about = "Announce WebRTC offers to a WebTorrent tracker and connect to peers", long_about = None)]
struct Cli {
    /// Content descriptor (TOML with info_hash and length)
    descriptor: PathBuf,

    /// Tracker WebSocket URL
    #[arg(long)]
    tracker: Option<String>,

    /// Offers per announce
    #[arg(long)]
    numwant: Option<usize>,

    /// Stop after this many tracker messages
    #[arg(long)]
    max_messages: Option<usize>,

    /// Stop when the tracker is silent for this many seconds
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Config file (default: ~/.swarmsig/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("swarmsig=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load_or_default(),
    };
    if let Some(tracker) = cli.tracker {
        config.tracker.url = tracker;
    }
    if let Some(numwant) = cli.numwant {
        config.tracker.numwant = numwant;
    }
    if let Some(max) = cli.max_messages {
        config.session.max_messages = Some(max);
    }
    if let Some(secs) = cli.idle_timeout_secs {
        config.session.idle_timeout_secs = Some(secs);
    }
    debug!("Effective config: {:?}", config);

    let (events_tx, events_rx) = event_channel(EVENT_CHANNEL_SIZE);
    let factory = Arc::new(
        RtcConnectionFactory::new(config.webrtc.ice_servers.clone(), events_tx.clone())
            .with_gather_timeout(config.gather_timeout()),
    );
    let relay = Arc::new(WsRelayTransport::new());
    let mut session = SwarmSession::new(config.swarm_config(), relay, factory, (events_tx, events_rx));

    let (sink_tx, sink_rx) = mpsc::channel(64);
    session.set_event_sink(sink_tx);
    let printer = tokio::spawn(print_events(sink_rx));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            let _ = cancel_tx.send(true);
        }
    });

    let report = session
        .run(&DescriptorFileLoader::new(), &cli.descriptor, cancel_rx)
        .await
        .with_context(|| format!("Session for {} failed", cli.descriptor.display()))?;

    // Dropping the session closes the event sink
    drop(session);
    let _ = printer.await;

    print_report(&report);
    Ok(())
}

async fn print_events(mut events: mpsc::Receiver<SwarmEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SwarmEvent::Announced { event, offers } => {
                println!("announced '{}' with {} offer(s)", event, offers.len());
            }
            SwarmEvent::SwarmStats(stats) => {
                println!(
                    "swarm: {} seeder(s), {} leecher(s), interval {}s",
                    stats.complete.map_or("?".to_string(), |n| n.to_string()),
                    stats.incomplete.map_or("?".to_string(), |n| n.to_string()),
                    stats.interval.map_or("?".to_string(), |n| n.to_string()),
                );
            }
            SwarmEvent::PeerConnected {
                offer_id, peer_id, ..
            } => {
                println!(
                    "offer {} answered by {}",
                    offer_id.short(),
                    peer_id.as_deref().unwrap_or("<unknown peer>")
                );
            }
            SwarmEvent::NegotiationFailed { offer_id, cause } => {
                println!("offer {} failed: {}", offer_id.short(), cause);
            }
            SwarmEvent::ChannelOpen { offer_id, label } => {
                println!("data channel '{}' open (offer {})", label, offer_id.short());
            }
            SwarmEvent::ChannelMessage { offer_id, data } => {
                println!(
                    "offer {}: {} bytes: {}",
                    offer_id.short(),
                    data.len(),
                    String::from_utf8_lossy(&data)
                );
            }
            SwarmEvent::TrackerWarning(message) => println!("tracker warning: {}", message),
            SwarmEvent::TrackerFailure(reason) => println!("tracker failure: {}", reason),
        }
    }
}

fn print_report(report: &SessionReport) {
    println!();
    println!("Session ended: {}", report.end);
    println!("  info hash:  {}", report.info_hash);
    println!("  peer id:    {}", String::from_utf8_lossy(report.peer_id.as_bytes()));
    println!("  messages:   {}", report.messages);
    println!(
        "  attempts:   {} total, {} connected, {} failed, {} abandoned",
        report.attempts.total(),
        report.attempts.connected,
        report.attempts.failed,
        report.attempts.abandoned
    );
}

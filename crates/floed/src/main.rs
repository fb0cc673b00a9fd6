//! floed — volunteer circumvention proxy daemon.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::RngCore;
use tokio::sync::Semaphore;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;
use url::Url;

use floe_core::nat::{check_if_restricted_nat, NatType};
use floe_sink::{ClusterWriter, WriteSyncer};
use floed::broker::Broker;
use floed::supervisor::{self, ProxyContext, CLIENT_SINK};

const DEFAULT_BROKER_URL: &str = "https://floe-broker.example.net/";
const DEFAULT_RELAY_URL: &str = "wss://floe-relay.example.net/";
const DEFAULT_STUN_URL: &str = "stun:stun.stunprotocol.org:3478";

/// Cadence of sighting flushes to disk.
const SIGHTING_WRITE_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Parser, Debug)]
#[command(name = "floed")]
#[command(about = "Volunteer proxy bridging censored clients to a relay")]
#[command(version)]
struct Args {
    /// Maximum concurrent clients.
    #[arg(long, default_value_t = 10)]
    capacity: usize,

    /// Rendezvous broker URL.
    #[arg(long, default_value = DEFAULT_BROKER_URL)]
    broker: String,

    /// WebSocket relay URL.
    #[arg(long, default_value = DEFAULT_RELAY_URL)]
    relay: String,

    /// STUN server URL used for ICE and the NAT probe.
    #[arg(long, default_value = DEFAULT_STUN_URL)]
    stun: String,

    /// Append logs to this file in addition to stderr.
    #[arg(long)]
    log: Option<PathBuf>,

    /// Keep client addresses in the logs.
    #[arg(long)]
    unsafe_logging: bool,

    /// Keep host-local ICE candidates in published answers.
    #[arg(long)]
    keep_local_addresses: bool,

    /// Record digests of observed client addresses to this file, one JSON
    /// object per flush window. The digest key is regenerated each run.
    #[arg(long)]
    ip_sightings_log: Option<PathBuf>,
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &args.log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::io::stderr.and(Arc::new(file)))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn open_sightings(args: &Args) -> Result<Option<Arc<ClusterWriter>>> {
    let Some(path) = &args.ip_sightings_log else {
        return Ok(None);
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open ip sightings log {}", path.display()))?;
    let mut writers: HashMap<String, Box<dyn WriteSyncer>> = HashMap::new();
    writers.insert(CLIENT_SINK.to_string(), Box::new(file));
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    Ok(Some(Arc::new(ClusterWriter::new(
        writers,
        key,
        SIGHTING_WRITE_INTERVAL,
    ))))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    tracing::info!("starting");

    let broker_url = Url::parse(&args.broker).context("invalid broker url")?;
    let relay_url = Url::parse(&args.relay).context("invalid relay url")?;
    Url::parse(&args.stun).context("invalid stun url")?;

    let broker = Broker::new(
        &broker_url,
        Broker::default_client().context("cannot build HTTP client")?,
        args.keep_local_addresses,
    )
    .context("invalid broker url")?;

    // Determine NAT type before polling; the broker matches us with
    // clients our NAT can actually reach.
    let stun_addr = args.stun.trim_start_matches("stun:");
    let nat_type = match check_if_restricted_nat(stun_addr).await {
        Ok(true) => NatType::Restricted,
        Ok(false) => NatType::Unrestricted,
        Err(e) => {
            tracing::warn!(error = %e, "NAT check failed");
            NatType::Unknown
        }
    };
    tracing::info!(%nat_type, "NAT type");

    let sightings = open_sightings(&args)?;
    if let Some(cluster) = &sightings {
        let cluster = Arc::clone(cluster);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SIGHTING_WRITE_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                cluster.write_ip_set_to_disk();
            }
        });
    }

    let ctx = Arc::new(ProxyContext {
        broker: Arc::new(broker),
        relay: relay_url,
        stun: args.stun.clone(),
        nat_type,
        tokens: Arc::new(Semaphore::new(args.capacity)),
        sightings,
        unsafe_logging: args.unsafe_logging,
    });

    tokio::select! {
        result = supervisor::run(Arc::clone(&ctx)) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            if let Some(sightings) = &ctx.sightings {
                sightings.write_ip_set_to_disk();
            }
            Ok(())
        }
    }
}

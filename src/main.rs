//! gcnd: the per-node GCN service daemon.

use clap::Parser;
use gcn::link::udp::UdpLink;
use gcn::service::{GcnService, ServiceConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
#[command(
    name = "gcnd",
    version,
    about = "Group Centric Networking service",
    long_about = "Per-node GCN service: maintains the group tree, forwards group \
                  traffic over the broadcast link, and serves local applications \
                  on the loopback control channel."
)]
struct Cli {
    /// Node id (required, non-zero)
    #[arg(short = 'i', long = "id")]
    id: u32,

    /// Log level 1-7 (1=fatal, 3=error, 5=info, 7=trace)
    #[arg(short = 'l', long = "loglevel", default_value_t = 3)]
    loglevel: u8,

    /// Comma-separated list of OTA devices (broadcast destinations)
    #[arg(short = 'd', long = "devices", value_delimiter = ',')]
    devices: Vec<String>,

    /// Path to the event trace file; no trace is written without it
    #[arg(short = 'f', long = "tracefile")]
    tracefile: Option<PathBuf>,

    /// Seconds an entry remains in the hash table before deletion
    #[arg(short = 'e', long = "hashexpire", default_value_t = 30)]
    hashexpire: u64,

    /// Interval in seconds between hash table sweeps
    #[arg(short = 'c', long = "hashclean", default_value_t = 10)]
    hashclean: u64,

    /// Seconds a remote subscriber remains without a fresh ACK
    #[arg(short = 'p', long = "pullexpire", default_value_t = 3600)]
    pullexpire: u64,

    /// Interval in seconds between remote subscriber sweeps
    #[arg(short = 't', long = "pullclean", default_value_t = 5)]
    pullclean: u64,

    /// Seconds a reverse path remains without a fresh ADVERTISE
    #[arg(short = 'r', long = "pathexpire", default_value_t = 3600)]
    pathexpire: u64,

    /// Interval in seconds between reverse path sweeps
    #[arg(short = 'x', long = "pathclean", default_value_t = 10)]
    pathclean: u64,

    /// Use group-multicast Ethernet headers instead of broadcast
    #[arg(short = 'm', long = "mcastethernetheader")]
    mcastethernetheader: bool,

    /// Robust mode: re-broadcast unseen tree DATA even without a
    /// downstream subscriber entry
    #[arg(short = 'b', long = "alwaysrebroadcast")]
    alwaysrebroadcast: bool,
}

fn level_filter(loglevel: u8) -> Option<LevelFilter> {
    match loglevel {
        1..=3 => Some(LevelFilter::ERROR),
        4 => Some(LevelFilter::WARN),
        5 => Some(LevelFilter::INFO),
        6 => Some(LevelFilter::DEBUG),
        7 => Some(LevelFilter::TRACE),
        _ => None,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let Some(level) = level_filter(cli.loglevel) else {
        eprintln!("invalid log level: {} (valid: 1-7)", cli.loglevel);
        return ExitCode::FAILURE;
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if cli.id == 0 {
        eprintln!("node id must be non-zero");
        return ExitCode::FAILURE;
    }

    let mut config = ServiceConfig::new(cli.id);
    config.devices = cli.devices;
    config.trace_file = cli.tracefile;
    config.hash_expire = Duration::from_secs(cli.hashexpire);
    config.hash_interval = Duration::from_secs(cli.hashclean);
    config.pull_expire = Duration::from_secs(cli.pullexpire);
    config.pull_interval = Duration::from_secs(cli.pullclean);
    config.path_expire = Duration::from_secs(cli.pathexpire);
    config.path_interval = Duration::from_secs(cli.pathclean);
    config.mcast_ethernet_header = cli.mcastethernetheader;
    config.always_rebroadcast = cli.alwaysrebroadcast;

    let (mut link, outbound_tx, ingress_rx) = match UdpLink::spawn(
        &config.devices,
        config.node_id,
        config.mcast_ethernet_header,
    )
    .await
    {
        Ok(link) => link,
        Err(e) => {
            error!(error = %e, "could not start the link adapter");
            return ExitCode::FAILURE;
        }
    };

    let listener = match TcpListener::bind((gcn::client::SERVICE_HOST, config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port = config.port, "could not bind the control channel");
            return ExitCode::FAILURE;
        }
    };

    let mut service = match GcnService::new(config, outbound_tx) {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "could not create the service");
            return ExitCode::FAILURE;
        }
    };

    // SIGINT and SIGTERM both request a graceful shutdown.
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(()).await;
    });

    let result = service.run(listener, ingress_rx, shutdown_rx).await;
    link.shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "service failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

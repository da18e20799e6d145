//! Basic GCN example client.
//!
//! Sends a numbered payload on a period and/or listens for a group,
//! counting and de-duplicating what arrives. With a destination node id the
//! sender side goes unicast instead of broadcast.

use clap::Parser;
use gcn::client::{ClientRole, GcnClient, GroupConfig};
use gcn::types::Resilience;
use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
#[command(name = "gcn-basic", version, about = "Basic GCN client")]
struct Cli {
    /// Group id
    #[arg(short = 'g', long = "group")]
    group: u32,

    /// Node id
    #[arg(short = 'i', long = "id")]
    id: u32,

    /// Unicast destination node id
    #[arg(short = 'u', long = "dest")]
    dest: Option<u32>,

    /// Role: 0 listener, 1 sender, 2 both
    #[arg(short = 'y', long = "type", default_value_t = 0)]
    role: u8,

    /// Log level 1-7
    #[arg(short = 'l', long = "loglevel", default_value_t = 3)]
    loglevel: u8,

    /// Service control-channel port
    #[arg(short = 'p', long = "port", default_value_t = 12345)]
    port: u16,

    /// Seconds between payloads
    #[arg(short = 's', long = "pushrate", default_value_t = 1.0)]
    pushrate: f64,

    /// Advertise period in seconds: >0 emit, 0 override, <0 flood
    #[arg(
        short = 'a',
        long = "announcerate",
        default_value_t = 20.0,
        allow_negative_numbers = true
    )]
    announcerate: f64,

    /// Source TTL
    #[arg(short = 't', long = "srcttl", default_value_t = 2)]
    srcttl: u32,

    /// Probability of relay (0-100 literal, >100 per-neighbor numerator)
    #[arg(short = 'k', long = "probrelay", default_value_t = 0)]
    probrelay: u32,

    /// Unicast resilience: 0 low, 1 medium, 2 high
    #[arg(short = 'z', long = "resilience", default_value_t = 0)]
    resilience: u8,

    /// Stop after sending this many payloads (0 = no limit)
    #[arg(short = 'n', long = "stopcount", default_value_t = 0)]
    stopcount: u32,

    /// Do not regenerate TTL at group nodes
    #[arg(short = 'o', long = "nottlregen")]
    nottlregen: bool,
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

    let Some(role) = ClientRole::from_u8(cli.role) else {
        eprintln!("invalid type: {} (0 listener, 1 sender, 2 both)", cli.role);
        return ExitCode::FAILURE;
    };
    let Some(resilience) = Resilience::from_u8(cli.resilience) else {
        eprintln!("invalid resilience: {} (valid: 0-2)", cli.resilience);
        return ExitCode::FAILURE;
    };
    if cli.id == 0 || cli.group == 0 {
        eprintln!("node id and group id must be non-zero");
        return ExitCode::FAILURE;
    }

    let mut client = match GcnClient::connect(cli.id, cli.port, None).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "could not reach the GCN service");
            return ExitCode::FAILURE;
        }
    };

    // Listener side: log each payload once, drop duplicates by
    // (group, source, sequence).
    let seen = Arc::new(Mutex::new(HashSet::new()));
    let handler = {
        let seen = seen.clone();
        Box::new(move |data: &gcn::Data| {
            let key = (data.gid, data.src_node, data.seq);
            if !seen.lock().expect("seen set lock").insert(key) {
                return false;
            }
            info!(
                gid = data.gid,
                src = data.src_node,
                seq = data.seq,
                len = data.payload.len(),
                unicast = data.unicast.is_some(),
                "received payload"
            );
            true
        })
    };

    let config = GroupConfig {
        role,
        src_ttl: cli.srcttl,
        announce_rate: cli.announcerate,
        prob_relay: cli.probrelay,
        resilience,
        regenerate_ttl: !cli.nottlregen,
        dest: cli.dest,
    };
    if let Err(e) = client.register(cli.group, config, handler).await {
        error!(error = %e, "registration failed");
        return ExitCode::FAILURE;
    }

    info!(
        node = cli.id,
        group = cli.group,
        ?role,
        announce_rate = cli.announcerate,
        "gcn-basic running"
    );

    let mut failed = false;
    if role.is_sender() {
        let mut push = tokio::time::interval(Duration::from_secs_f64(cli.pushrate.max(0.001)));
        push.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut counter: u32 = 0;
        loop {
            tokio::select! {
                _ = push.tick() => {
                    counter += 1;
                    let micros = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_micros())
                        .unwrap_or(0);
                    let payload = format!("node {} message {} {}", cli.id, counter, micros);
                    match client.send_message(cli.group, payload.as_bytes(), None).await {
                        Ok(true) => {}
                        Ok(false) => info!(seq = counter, "no subscribers yet, payload withheld"),
                        Err(e) => {
                            error!(error = %e, "send failed");
                            failed = true;
                            break;
                        }
                    }
                    if cli.stopcount > 0 && counter >= cli.stopcount {
                        info!(sent = counter, "stop count reached");
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    } else {
        let _ = tokio::signal::ctrl_c().await;
    }

    if let Err(e) = client.shutdown().await {
        error!(error = %e, "shutdown failed");
        failed = true;
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

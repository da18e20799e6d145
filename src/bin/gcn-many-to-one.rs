//! Many-to-one GCN example client.
//!
//! One node plays the group source, broadcasting over the tree; every
//! listener answers each Nth received payload with a unicast response that
//! rides the reverse path back to the source. Exercises bidirectional tree
//! traffic with many responders converging on one node.

use clap::Parser;
use gcn::client::{ClientRole, GcnClient, GroupConfig};
use gcn::types::{NodeId, Resilience};
use std::process::ExitCode;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
#[command(name = "gcn-many-to-one", version, about = "Many-to-one GCN client")]
struct Cli {
    /// Group id
    #[arg(short = 'g', long = "group")]
    group: u32,

    /// Node id
    #[arg(short = 'i', long = "id")]
    id: u32,

    /// Role: 0 responder (listener), 1 source (sender), 2 both
    #[arg(short = 'y', long = "type", default_value_t = 0)]
    role: u8,

    /// Log level 1-7
    #[arg(short = 'l', long = "loglevel", default_value_t = 3)]
    loglevel: u8,

    /// Service control-channel port
    #[arg(short = 'p', long = "port", default_value_t = 12345)]
    port: u16,

    /// Seconds between source payloads
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

    /// Unicast resilience for responses: 0 low, 1 medium, 2 high
    #[arg(short = 'z', long = "resilience", default_value_t = 1)]
    resilience: u8,

    /// Respond to every Nth received payload (0 = never respond)
    #[arg(short = 'q', long = "respfreq", default_value_t = 1)]
    respfreq: u32,

    /// Stop after sending this many payloads (0 = no limit)
    #[arg(short = 'n', long = "stopcount", default_value_t = 0)]
    stopcount: u32,
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
        eprintln!("invalid type: {} (0 responder, 1 source, 2 both)", cli.role);
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

    // The handler runs on the reader task; responses are sent from the
    // main loop, so the handler only reports who to answer.
    let (respond_tx, mut respond_rx) = mpsc::unbounded_channel::<NodeId>();
    let respfreq = cli.respfreq;
    let is_responder = role.is_listener();
    let handler = {
        let mut received: u32 = 0;
        Box::new(move |data: &gcn::Data| {
            info!(
                gid = data.gid,
                src = data.src_node,
                seq = data.seq,
                unicast = data.unicast.is_some(),
                "received payload"
            );
            // unicast arrivals are responses; only broadcast payloads from
            // the source trigger a reply
            if is_responder && data.unicast.is_none() && respfreq > 0 {
                received += 1;
                if received % respfreq == 0 {
                    let _ = respond_tx.send(data.src_node);
                }
            }
            true
        })
    };

    let config = GroupConfig {
        role,
        src_ttl: cli.srcttl,
        announce_rate: cli.announcerate,
        prob_relay: cli.probrelay,
        resilience,
        regenerate_ttl: true,
        dest: None,
    };
    if let Err(e) = client.register(cli.group, config, handler).await {
        error!(error = %e, "registration failed");
        return ExitCode::FAILURE;
    }

    info!(
        node = cli.id,
        group = cli.group,
        ?role,
        respfreq = cli.respfreq,
        "gcn-many-to-one running"
    );

    let mut push = tokio::time::interval(Duration::from_secs_f64(cli.pushrate.max(0.001)));
    push.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut counter: u32 = 0;
    let mut responses: u32 = 0;
    let mut failed = false;

    loop {
        tokio::select! {
            _ = push.tick(), if role.is_sender() => {
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
            Some(source) = respond_rx.recv() => {
                responses += 1;
                let payload = format!("node {} response {}", cli.id, responses);
                if let Err(e) = client
                    .send_message(cli.group, payload.as_bytes(), Some(source))
                    .await
                {
                    error!(error = %e, source, "response send failed");
                    failed = true;
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
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

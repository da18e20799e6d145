//! GCN service entity.
//!
//! [`GcnService`] is the per-node protocol engine. It exclusively owns every
//! protocol table; all state mutation happens on its single event loop,
//! which multiplexes the local client endpoint, the broadcast link, the
//! pending-transmit timers, and the periodic table sweeps. I/O tasks
//! (session readers, link adapters) only move bytes into and out of the
//! loop's channels.

mod ack;
mod advertise;
mod cleanup;
mod data;
mod local;
mod session;
mod timers;
#[cfg(test)]
mod tests;

use crate::app::{AppMessage, Pull, Unpull};
use crate::dedup::SeenCache;
use crate::distance::DistanceTable;
use crate::link::{FrameRx, LinkClass, LinkError, OutboundFrame, OutboundTx};
use crate::tables::{AdvSeenSet, RemoteSubTable, ReversePathTable, SeqTable};
use crate::trace::{TraceEvent, TraceLog};
use crate::types::{GroupId, GroupKey, HashValue, NodeId, SeqNum};
use crate::wire::{Ack, Advertise, Data, OtaMessage, WireError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use session::{SessionEvent, SessionHandle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use timers::{TimerKey, TimerWheel};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant};
use tracing::{debug, error, info, warn};

pub use session::SessionId;

/// Defaults mirror the long-standing deployment values: hashes live for
/// 30 s and are swept every 10 s; subscriber and reverse-path state is kept
/// for an hour so nothing expires during short runs.
pub const DEFAULT_HASH_EXPIRE: Duration = Duration::from_secs(30);
pub const DEFAULT_HASH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_PULL_EXPIRE: Duration = Duration::from_secs(3600);
pub const DEFAULT_PULL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PATH_EXPIRE: Duration = Duration::from_secs(3600);
pub const DEFAULT_PATH_INTERVAL: Duration = Duration::from_secs(10);

/// Default local control-channel port.
pub const DEFAULT_PORT: u16 = 12345;

/// Fatal protocol invariant violation: log and abort rather than keep
/// running with corrupt state.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        tracing::error!("{}", msg);
        panic!("{}", msg);
    }};
}
pub(crate) use fatal;

/// Errors raised while bringing the service up.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("trace file: {0}")]
    Trace(#[source] std::io::Error),

    #[error("local endpoint: {0}")]
    Endpoint(#[source] std::io::Error),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Service configuration, normally assembled from the CLI.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub node_id: NodeId,
    /// Link devices handed to the link adapter.
    pub devices: Vec<String>,
    pub trace_file: Option<PathBuf>,
    pub hash_expire: Duration,
    pub hash_interval: Duration,
    pub pull_expire: Duration,
    pub pull_interval: Duration,
    pub path_expire: Duration,
    pub path_interval: Duration,
    /// Synthesize group-multicast Ethernet destinations instead of
    /// broadcast.
    pub mcast_ethernet_header: bool,
    /// Robust mode: group participants re-broadcast unseen ACK-mode DATA
    /// even without a downstream subscriber entry.
    pub always_rebroadcast: bool,
    pub port: u16,
}

impl ServiceConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            devices: Vec::new(),
            trace_file: None,
            hash_expire: DEFAULT_HASH_EXPIRE,
            hash_interval: DEFAULT_HASH_INTERVAL,
            pull_expire: DEFAULT_PULL_EXPIRE,
            pull_interval: DEFAULT_PULL_INTERVAL,
            path_expire: DEFAULT_PATH_EXPIRE,
            path_interval: DEFAULT_PATH_INTERVAL,
            mcast_ethernet_header: false,
            always_rebroadcast: false,
            port: DEFAULT_PORT,
        }
    }
}

/// One application source registration.
pub(crate) struct AnnounceInfo {
    pub session: SessionId,
    /// Emission period. `Some(0)` means advertise-override (announce
    /// locally, rely on another source of the group to advertise over the
    /// air); `None` is a flood-mode registration that never advertises.
    pub interval: Option<Duration>,
    pub src_ttl: u32,
    pub prob_relay: u32,
    pub seq: SeqNum,
    /// Whether PULL has been pushed to the owning session for the current
    /// remote-subscriber epoch.
    pub pull_forwarded: bool,
    pub no_ttl_regen: bool,
}

/// Traffic counters, reported every stats tick and at shutdown.
#[derive(Default)]
pub struct Counters {
    /// AppMessage batches received from clients.
    pub client_rcv: u64,
    /// Client DATA records accepted for sending.
    pub sent: u64,
    pub recv_adv: u64,
    pub recv_ack: u64,
    pub recv_data: u64,
    pub recv_data_uni: u64,
    pub dropped: u64,
    /// Payloads delivered to local subscribers.
    pub pushed: u64,
    pub forwarded: u64,
    pub forwarded_uni: u64,
    /// Relayed DATA as a group node since the last stats tick.
    pub relay_data_group: bool,
    /// Relayed DATA as a non-group node since the last stats tick.
    pub relay_data_non_group: bool,
    pub non_group_rcv_ack: bool,
    pub non_group_rcv_adv: bool,
    pub bytes_sent_ctrl: u64,
    pub packets_sent_ctrl: u64,
    pub bytes_sent_data: u64,
    pub packets_sent_data: u64,
}

impl Counters {
    pub fn summary(&self) -> String {
        format!(
            "client rcvd>{} sentOTA>{} rcvdAdv>{} rcvdAck>{} rcvdData>{} rcvdUni>{} \
             drop>{} push>{} fwd>{} fwdUni>{} relayDataGroup>{} relayDataNonGroup>{} \
             nonGroupRcvAck>{} nonGroupRcvAdv>{} bytesSentCtl>{} pktsSentCtl>{} \
             bytesSentData>{} pktsSentData>{}",
            self.client_rcv,
            self.sent,
            self.recv_adv,
            self.recv_ack,
            self.recv_data,
            self.recv_data_uni,
            self.dropped,
            self.pushed,
            self.forwarded,
            self.forwarded_uni,
            self.relay_data_group as u8,
            self.relay_data_non_group as u8,
            self.non_group_rcv_ack as u8,
            self.non_group_rcv_adv as u8,
            self.bytes_sent_ctrl,
            self.packets_sent_ctrl,
            self.bytes_sent_data,
            self.packets_sent_data,
        )
    }
}

/// The per-node GCN protocol engine.
pub struct GcnService {
    config: ServiceConfig,
    node_id: NodeId,

    // === Subscription state ===
    /// Local subscriptions, one entry per PULL (a session may subscribe to
    /// a group more than once).
    pub(crate) local_subs: Vec<(GroupId, SessionId)>,
    /// Downstream subscribers/relays per group, fed by ACK receipt.
    pub(crate) remote_subs: RemoteSubTable,
    /// Source registrations owned by local sessions.
    pub(crate) announces: HashMap<GroupId, AnnounceInfo>,

    // === Tree state ===
    pub(crate) reverse_paths: ReversePathTable,
    pub(crate) coin_flips: SeqTable,
    pub(crate) acks_sent: SeqTable,
    pub(crate) distances: DistanceTable,
    pub(crate) adv_seen: AdvSeenSet,

    // === Duplicate suppression ===
    pub(crate) seen: SeenCache,

    // === Pending transmissions ===
    pub(crate) timers: TimerWheel,
    pub(crate) pending_acks: HashMap<GroupKey, Ack>,
    pub(crate) pending_advs: HashMap<GroupKey, (Advertise, u32)>,
    pub(crate) pending_data: HashMap<HashValue, (Data, u32)>,

    // === Local clients ===
    pub(crate) sessions: HashMap<SessionId, SessionHandle>,
    next_session_id: SessionId,
    /// Per-group sequence counter for locally produced DATA.
    pub(crate) seq_by_gid: HashMap<GroupId, SeqNum>,

    // === Egress ===
    link_tx: OutboundTx,

    pub(crate) counters: Counters,
    pub(crate) trace: Option<TraceLog>,
    pub(crate) rng: StdRng,
}

impl GcnService {
    pub fn new(config: ServiceConfig, link_tx: OutboundTx) -> Result<Self, ServiceError> {
        Self::build(config, link_tx, StdRng::from_entropy())
    }

    /// Deterministic variant for tests and reproducible simulations.
    pub fn new_seeded(
        config: ServiceConfig,
        link_tx: OutboundTx,
        seed: u64,
    ) -> Result<Self, ServiceError> {
        Self::build(config, link_tx, StdRng::seed_from_u64(seed))
    }

    fn build(config: ServiceConfig, link_tx: OutboundTx, rng: StdRng) -> Result<Self, ServiceError> {
        if config.node_id == 0 {
            return Err(ServiceError::Config("node id must be non-zero".into()));
        }
        let trace = match &config.trace_file {
            Some(path) => Some(
                TraceLog::create(path, config.node_id, "gcnService").map_err(ServiceError::Trace)?,
            ),
            None => None,
        };
        info!(
            node_id = config.node_id,
            hash_expire = ?config.hash_expire,
            pull_expire = ?config.pull_expire,
            path_expire = ?config.path_expire,
            always_rebroadcast = config.always_rebroadcast,
            mcast_ethernet_header = config.mcast_ethernet_header,
            port = config.port,
            "creating GCN service"
        );
        Ok(Self {
            node_id: config.node_id,
            local_subs: Vec::new(),
            remote_subs: RemoteSubTable::new(config.pull_expire),
            announces: HashMap::new(),
            reverse_paths: ReversePathTable::new(config.path_expire),
            coin_flips: SeqTable::new(),
            acks_sent: SeqTable::new(),
            distances: DistanceTable::new(),
            adv_seen: AdvSeenSet::new(config.hash_expire),
            seen: SeenCache::new(config.hash_expire),
            timers: TimerWheel::new(),
            pending_acks: HashMap::new(),
            pending_advs: HashMap::new(),
            pending_data: HashMap::new(),
            sessions: HashMap::new(),
            next_session_id: 1,
            seq_by_gid: HashMap::new(),
            link_tx,
            counters: Counters::default(),
            trace,
            rng,
            config,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// A node participates in a group when a local application subscribes
    /// to it or announces for it.
    pub(crate) fn is_group_participant(&self, gid: GroupId) -> bool {
        self.announces.contains_key(&gid) || self.local_subs.iter().any(|(g, _)| *g == gid)
    }

    pub(crate) fn local_sub_count(&self, gid: GroupId) -> usize {
        self.local_subs.iter().filter(|(g, _)| *g == gid).count()
    }

    /// Monotonic timestamp for table bookkeeping. Follows the (pausable)
    /// tokio clock so table expiry is testable.
    pub(crate) fn table_now(&self) -> std::time::Instant {
        Instant::now().into_std()
    }

    // === Event loop ===

    /// Drive the service until shutdown is requested.
    pub async fn run(
        &mut self,
        listener: TcpListener,
        mut link_rx: FrameRx,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<(), ServiceError> {
        let (session_tx, mut session_rx) = mpsc::unbounded_channel();

        let mut hash_tick = interval_at(
            Instant::now() + self.config.hash_interval,
            self.config.hash_interval,
        );
        let mut pull_tick = interval_at(
            Instant::now() + self.config.pull_interval,
            self.config.pull_interval,
        );
        let mut path_tick = interval_at(
            Instant::now() + self.config.path_interval,
            self.config.path_interval,
        );
        let stat_interval = Duration::from_secs(1);
        let mut stat_tick = interval_at(Instant::now() + stat_interval, stat_interval);

        info!(node_id = self.node_id, "GCN service running");

        loop {
            let next_transmit = self.timers.next_deadline();
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    self.shutdown();
                    return Ok(());
                }

                _ = async { sleep_until(next_transmit.unwrap()).await },
                        if next_transmit.is_some() => {
                    self.fire_due_timers();
                }

                Some(payload) = link_rx.recv() => {
                    self.on_network_receive(&payload);
                }

                Some(event) = session_rx.recv() => {
                    match event {
                        SessionEvent::Message(id, msg) => self.on_client_message(id, msg),
                        SessionEvent::Closed(id) => self.close_session(id),
                    }
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(peer = %addr, "accepted client session");
                            self.accept_session(stream, session_tx.clone());
                        }
                        Err(e) => warn!(error = %e, "client accept failed"),
                    }
                }

                _ = hash_tick.tick() => self.hash_cleanup(),
                _ = pull_tick.tick() => self.remote_subs_cleanup(),
                _ = path_tick.tick() => self.reverse_path_cleanup(),
                _ = stat_tick.tick() => self.on_stat_tick(),
            }
        }
    }

    /// Graceful teardown: report final counters and unwind every session,
    /// registration, and pending timer.
    pub fn shutdown(&mut self) {
        info!(stats = %self.counters.summary(), "stopping GCN service");

        for (gid, info) in self.announces.drain() {
            self.timers.cancel(&TimerKey::Announce(gid));
            debug!(gid, session = info.session, "announce cancelled");
        }
        self.local_subs.clear();
        for (_, handle) in self.sessions.drain() {
            handle.close();
        }
        debug!(pending = self.timers.len(), "cancelling pending transmissions");
        self.timers.clear();
        self.pending_acks.clear();
        self.pending_advs.clear();
        self.pending_data.clear();
    }

    /// Dispatch all pending transmissions whose deadline has passed.
    pub(crate) fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(key) = self.timers.pop_due(now) {
            match key {
                TimerKey::Announce(gid) => self.on_announce_timer(gid),
                TimerKey::Ack(flow) => self.on_ack_timer(flow),
                TimerKey::Advertise(flow) => self.on_adv_timer(flow),
                TimerKey::Data(hash) => self.on_data_timer(hash),
            }
        }
    }

    // === Network ingress ===

    /// Parse and dispatch one OTA frame (link header already stripped).
    pub(crate) fn on_network_receive(&mut self, payload: &[u8]) {
        let msg = match OtaMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e @ WireError::TooLarge { .. }) => {
                error!(error = %e, len = payload.len(), "dropping oversized frame");
                return;
            }
            Err(e) => {
                debug!(error = %e, len = payload.len(), "dropping undecodable frame");
                return;
            }
        };
        if msg.src == self.node_id {
            debug!("ignoring our own frame echoed back");
            self.counters.dropped += 1;
            return;
        }
        for ack in msg.acks {
            self.process_network_ack(ack, msg.src);
        }
        for advertise in msg.advertises {
            self.process_network_advertise(advertise, msg.src);
        }
        for data in msg.data {
            self.process_network_data(data, msg.src);
        }
    }

    // === Egress ===

    /// Transmit a DATA frame. The TTL is always decremented on the way out.
    pub(crate) fn forward_to_ota_data(&mut self, data: &Data, ttl: u32) {
        let mut out = data.clone();
        out.ttl = ttl.saturating_sub(1);
        if let Some(trace) = self.trace.as_mut() {
            let attrs = format!(
                r#"{{""gid"":{},""size"":{},""seq"":{},""srcnode"":""node{:03}"",""ttl"":{},""dist"":{}}}"#,
                out.gid,
                out.payload.len(),
                out.seq,
                out.src_node,
                out.src_ttl.unwrap_or(0),
                out.distance
            );
            trace.emit(TraceEvent::SentData, &attrs);
        }
        let gid = out.gid;
        let msg = OtaMessage {
            src: self.node_id,
            data: vec![out],
            ..Default::default()
        };
        self.transmit(gid, msg);
    }

    /// Transmit an ADVERTISE frame. The TTL is always decremented on the
    /// way out.
    pub(crate) fn forward_to_ota_advertise(&mut self, advertise: &Advertise, ttl: u32) {
        let mut out = advertise.clone();
        out.ttl = ttl.saturating_sub(1);
        if let Some(trace) = self.trace.as_mut() {
            let attrs = format!(
                r#"{{""gid"":{},""srcttl"":{},""seq"":{},""srcnode"":""node{:03}"",""ttl"":{},""dist"":{}}}"#,
                out.gid, out.src_ttl, out.seq, out.src_node, ttl, out.distance
            );
            trace.emit(TraceEvent::SentAdv, &attrs);
        }
        let gid = out.gid;
        let msg = OtaMessage {
            src: self.node_id,
            advertises: vec![out],
            ..Default::default()
        };
        self.transmit(gid, msg);
    }

    /// Transmit an ACK frame. ACKs carry no TTL.
    pub(crate) fn forward_to_ota_ack(&mut self, ack: &Ack) {
        if let Some(trace) = self.trace.as_mut() {
            let attrs = format!(
                r#"{{""gid"":{},""seq"":{},""srcnode"":""node{:03}"",""obligrelay"":{},""relayprob"":{}}}"#,
                ack.gid, ack.seq, ack.src_node, ack.obligatory_relay, ack.prob_of_relay
            );
            trace.emit(TraceEvent::SentAck, &attrs);
        }
        let msg = OtaMessage {
            src: self.node_id,
            acks: vec![ack.clone()],
            ..Default::default()
        };
        self.transmit(ack.gid, msg);
    }

    fn transmit(&mut self, gid: GroupId, msg: OtaMessage) {
        let class = if msg.carries_data() {
            LinkClass::Data
        } else {
            LinkClass::Ctrl
        };
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "frame encode failed, not transmitted");
                return;
            }
        };
        match class {
            LinkClass::Data => {
                self.counters.bytes_sent_data += bytes.len() as u64;
                self.counters.packets_sent_data += 1;
            }
            LinkClass::Ctrl => {
                self.counters.bytes_sent_ctrl += bytes.len() as u64;
                self.counters.packets_sent_ctrl += 1;
            }
        }
        if self.link_tx.send(OutboundFrame { class, gid, bytes }).is_err() {
            error!("link egress channel closed, frame dropped");
        }
    }

    // === Local delivery ===

    pub(crate) fn push_data_to_app(&mut self, session: SessionId, data: &Data) {
        let msg = AppMessage {
            data: vec![data.clone()],
            ..Default::default()
        };
        self.push_to_app(session, &msg);
    }

    pub(crate) fn push_pull_to_app(&mut self, session: SessionId, gid: GroupId) {
        let msg = AppMessage {
            pulls: vec![Pull { gid }],
            ..Default::default()
        };
        self.push_to_app(session, &msg);
    }

    pub(crate) fn push_unpull_to_app(&mut self, session: SessionId, gid: GroupId) {
        let msg = AppMessage {
            unpulls: vec![Unpull { gid }],
            ..Default::default()
        };
        self.push_to_app(session, &msg);
    }

    fn push_to_app(&mut self, session: SessionId, msg: &AppMessage) {
        let record = match msg.encode() {
            Ok(record) => record,
            Err(e) => {
                error!(error = %e, "app message encode failed");
                return;
            }
        };
        if let Some(handle) = self.sessions.get(&session) {
            handle.send(crate::app::frame(&record));
        } else {
            debug!(session, "push to unknown session dropped");
        }
    }
}

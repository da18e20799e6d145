//! Client library.
//!
//! Applications link against [`GcnClient`] instead of speaking the control
//! channel directly. The library owns the loopback connection to the local
//! service, registers groups (as source, subscriber, or both), gates
//! sending on subscriber presence learned from PULL/UNPULL push-backs, and
//! hands received payloads to a per-group handler.
//!
//! The application never builds ADVERTISE or PULL records itself; it deals
//! in plain payload bytes on send and receive.

use crate::app::{self, AdvertiseKind, AppAdvertise, AppMessage, Pull, Unpull};
use crate::trace::{TraceEvent, TraceLog};
use crate::types::{GroupId, NodeId, Resilience};
use crate::wire::{Data, UnicastHeader};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Service host for clients; the control channel is loopback only.
pub const SERVICE_HOST: &str = "127.0.0.1";

/// How long to keep retrying the initial connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised by the client library.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to the GCN service within {CONNECT_TIMEOUT:?}")]
    ConnectTimeout,

    #[error("group {0} is not registered")]
    NotRegistered(GroupId),

    #[error(transparent)]
    App(#[from] crate::app::AppError),

    #[error("control channel i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("trace file: {0}")]
    Trace(#[source] std::io::Error),
}

/// What an application does with a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientRole {
    Listener,
    Sender,
    Both,
}

impl ClientRole {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ClientRole::Listener),
            1 => Some(ClientRole::Sender),
            2 => Some(ClientRole::Both),
            _ => None,
        }
    }

    pub fn is_sender(self) -> bool {
        matches!(self, ClientRole::Sender | ClientRole::Both)
    }

    pub fn is_listener(self) -> bool {
        matches!(self, ClientRole::Listener | ClientRole::Both)
    }
}

/// Per-group registration parameters.
#[derive(Clone, Debug)]
pub struct GroupConfig {
    pub role: ClientRole,
    pub src_ttl: u32,
    /// Advertise emission period in seconds. Zero requests
    /// advertise-override; negative means flood mode (no tree at all).
    pub announce_rate: f64,
    pub prob_relay: u32,
    pub resilience: Resilience,
    pub regenerate_ttl: bool,
    /// Fixed unicast destination for sends, if this group's traffic is
    /// point-to-point.
    pub dest: Option<NodeId>,
}

impl GroupConfig {
    fn uses_tree(&self) -> bool {
        self.announce_rate >= 0.0
    }
}

/// Payload callback; the return value acknowledges delivery.
pub type DataHandler = Box<dyn FnMut(&Data) -> bool + Send>;

/// Per-group client-side counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct GroupStats {
    pub recv_count: u64,
    pub send_count: u64,
    pub recv_err_count: u64,
    pub recv_count_uni: u64,
    pub send_count_uni: u64,
}

struct GroupState {
    config: GroupConfig,
    handler: DataHandler,
    /// Sending is gated on this; flips with PULL/UNPULL from the service.
    has_subscribers: bool,
    stats: GroupStats,
}

struct Shared {
    node_id: NodeId,
    groups: HashMap<GroupId, GroupState>,
    trace: Option<TraceLog>,
}

/// Handle to the local GCN service.
pub struct GcnClient {
    node_id: NodeId,
    writer: OwnedWriteHalf,
    shared: Arc<Mutex<Shared>>,
    reader_task: JoinHandle<()>,
}

impl GcnClient {
    /// Connect to the local service, retrying once a second until the
    /// service comes up or the timeout passes.
    pub async fn connect(
        node_id: NodeId,
        port: u16,
        trace_file: Option<&Path>,
    ) -> Result<Self, ClientError> {
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        let stream = loop {
            match TcpStream::connect((SERVICE_HOST, port)).await {
                Ok(stream) => break stream,
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ClientError::ConnectTimeout);
                    }
                    debug!(error = %e, "service not up yet, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };
        info!(node_id, port, "connected to GCN service");

        let trace = match trace_file {
            Some(path) => {
                Some(TraceLog::create(path, node_id, "gcnClient").map_err(ClientError::Trace)?)
            }
            None => None,
        };

        let shared = Arc::new(Mutex::new(Shared {
            node_id,
            groups: HashMap::new(),
            trace,
        }));

        let (mut read_half, writer) = stream.into_split();
        let reader_task = {
            let shared = shared.clone();
            tokio::spawn(async move {
                loop {
                    match app::read_frame(&mut read_half).await {
                        Ok(Some(record)) => match AppMessage::decode(&record) {
                            Ok(msg) => handle_push(&shared, msg),
                            Err(e) => debug!(error = %e, "undecodable push from service"),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "control channel read failed");
                            break;
                        }
                    }
                }
                debug!("control channel closed");
            })
        };

        Ok(Self {
            node_id,
            writer,
            shared,
            reader_task,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Register a group. Senders tell the service they source the group's
    /// content; listeners subscribe. A tree-mode sender starts blocked and
    /// is unblocked by the service's PULL once a subscriber exists.
    pub async fn register(
        &mut self,
        gid: GroupId,
        config: GroupConfig,
        handler: DataHandler,
    ) -> Result<(), ClientError> {
        let mut msg = AppMessage::default();
        if config.role.is_sender() {
            msg.advertises.push(AppAdvertise {
                gid,
                src_ttl: config.src_ttl,
                kind: AdvertiseKind::Register,
                interval: config.uses_tree().then_some(config.announce_rate),
                prob_relay: config.prob_relay,
                no_ttl_regen: config.uses_tree() && !config.regenerate_ttl,
            });
        }
        if config.role.is_listener() {
            msg.pulls.push(Pull { gid });
        }

        // flood-mode senders have no subscriber signal and just send
        let has_subscribers = !config.role.is_sender() || !config.uses_tree();
        self.shared.lock().expect("client state lock").groups.insert(
            gid,
            GroupState {
                config,
                handler,
                has_subscribers,
                stats: GroupStats::default(),
            },
        );
        self.send(&msg).await
    }

    /// Send one payload to a group, optionally unicast to `dest`.
    ///
    /// Returns `Ok(false)` when the payload was withheld because no
    /// subscriber exists yet.
    pub async fn send_message(
        &mut self,
        gid: GroupId,
        payload: &[u8],
        dest: Option<NodeId>,
    ) -> Result<bool, ClientError> {
        let mut data = Data {
            gid,
            src_node: 0,
            seq: 0,
            src_ttl: None,
            ttl: 0,
            distance: 0,
            no_ttl_regen: false,
            unicast: None,
            payload: payload.to_vec(),
        };

        let has_subscribers;
        let is_unicast;
        {
            let mut shared = self.shared.lock().expect("client state lock");
            let state = shared
                .groups
                .get_mut(&gid)
                .ok_or(ClientError::NotRegistered(gid))?;
            has_subscribers = state.has_subscribers;

            let dest = dest.or(state.config.dest);
            is_unicast = dest.is_some();
            if let Some(dest) = dest {
                data.unicast = Some(UnicastHeader {
                    dest,
                    relay_distance: 0,
                    resilience: Some(state.config.resilience),
                });
                if !state.config.uses_tree() {
                    data.src_ttl = Some(state.config.src_ttl);
                }
            } else if !state.config.uses_tree() {
                data.src_ttl = Some(state.config.src_ttl);
                data.no_ttl_regen = !state.config.regenerate_ttl;
            }

            if has_subscribers {
                state.stats.send_count += 1;
                if is_unicast {
                    state.stats.send_count_uni += 1;
                }
            }

            if let Some(trace) = shared.trace.as_mut() {
                let attrs = format!(
                    r#"{{""gid"":{},""size"":{},""ttl"":{},""sent"":{}}}"#,
                    gid,
                    payload.len(),
                    data.src_ttl.unwrap_or(0),
                    has_subscribers as u8
                );
                trace.emit(TraceEvent::ClientProdData, &attrs);
            }
        }

        if !has_subscribers {
            return Ok(false);
        }

        let msg = AppMessage {
            data: vec![data],
            ..Default::default()
        };
        self.send(&msg).await?;
        Ok(true)
    }

    /// Snapshot of a group's counters.
    pub fn stats(&self, gid: GroupId) -> Option<GroupStats> {
        self.shared
            .lock()
            .expect("client state lock")
            .groups
            .get(&gid)
            .map(|state| state.stats)
    }

    /// Whether a tree-mode sender has been unblocked by a subscriber.
    pub fn has_subscribers(&self, gid: GroupId) -> bool {
        self.shared
            .lock()
            .expect("client state lock")
            .groups
            .get(&gid)
            .map(|state| state.has_subscribers)
            .unwrap_or(false)
    }

    /// Unwind every registration and close the channel.
    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        let mut msg = AppMessage::default();
        {
            let shared = self.shared.lock().expect("client state lock");
            for (gid, state) in &shared.groups {
                if state.config.role.is_sender() {
                    msg.advertises.push(AppAdvertise {
                        gid: *gid,
                        src_ttl: state.config.src_ttl,
                        kind: AdvertiseKind::Deregister,
                        interval: None,
                        prob_relay: 0,
                        no_ttl_regen: false,
                    });
                }
                if state.config.role.is_listener() {
                    msg.unpulls.push(Unpull { gid: *gid });
                }
                info!(
                    gid = *gid,
                    rcvd = state.stats.recv_count,
                    sent = state.stats.send_count,
                    rerr = state.stats.recv_err_count,
                    rcvd_uni = state.stats.recv_count_uni,
                    sent_uni = state.stats.send_count_uni,
                    "final client stats"
                );
            }
        }
        if !msg.is_empty() {
            self.send(&msg).await?;
        }
        self.writer.shutdown().await?;
        self.reader_task.abort();
        Ok(())
    }

    async fn send(&mut self, msg: &AppMessage) -> Result<(), ClientError> {
        let record = msg.encode()?;
        self.writer.write_all(&app::frame(&record)).await?;
        Ok(())
    }
}

/// Apply one pushed record batch from the service.
fn handle_push(shared: &Arc<Mutex<Shared>>, msg: AppMessage) {
    let mut shared = shared.lock().expect("client state lock");
    let node_id = shared.node_id;

    for pull in &msg.pulls {
        match shared.groups.get_mut(&pull.gid) {
            Some(state) => {
                debug!(gid = pull.gid, "subscriber appeared, sending unblocked");
                state.has_subscribers = true;
            }
            None => warn!(gid = pull.gid, "pull for unregistered group"),
        }
    }
    for unpull in &msg.unpulls {
        match shared.groups.get_mut(&unpull.gid) {
            Some(state) => {
                debug!(gid = unpull.gid, "last subscriber gone, sending blocked");
                state.has_subscribers = false;
            }
            None => warn!(gid = unpull.gid, "unpull for unregistered group"),
        }
    }
    for data in &msg.data {
        let Shared { groups, trace, .. } = &mut *shared;
        let Some(state) = groups.get_mut(&data.gid) else {
            warn!(gid = data.gid, "data for unregistered group");
            continue;
        };
        if let Some(trace) = trace.as_mut() {
            let attrs = format!(
                r#"{{""gid"":{},""size"":{},""seq"":{},""srcnode"":""node{:03}"",""rcvnode"":""node{:03}""}}"#,
                data.gid,
                data.payload.len(),
                data.seq,
                data.src_node,
                node_id
            );
            trace.emit(TraceEvent::ClientRcvData, &attrs);
        }
        state.stats.recv_count += 1;
        if data.unicast.is_some() {
            state.stats.recv_count_uni += 1;
        }
        if !(state.handler)(data) {
            state.stats.recv_err_count += 1;
        }
    }
}

//! Service-level tests.
//!
//! Every test drives one or more `GcnService` instances through an
//! in-memory link: outbound frames are drained from the egress channel and
//! handed to neighbor services directly, standing in for the broadcast
//! medium. Time is tokio's paused clock, so jitter timers fire exactly when
//! advanced past.

mod advertise;
mod local;
mod scenario;

use super::{GcnService, ServiceConfig, SessionId};
use crate::app::{AdvertiseKind, AppAdvertise, AppMessage, Pull, Unpull};
use crate::link::{outbound_channel, OutboundRx};
use crate::types::NodeId;
use crate::wire::{Data, OtaMessage};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// One simulated node: a service plus its egress channel.
pub(crate) struct TestNode {
    pub svc: GcnService,
    out: OutboundRx,
}

impl TestNode {
    pub fn new(node_id: NodeId) -> Self {
        Self::with_config(ServiceConfig::new(node_id))
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        let (tx, out) = outbound_channel();
        let seed = config.node_id as u64 * 7919 + 17;
        let svc = GcnService::new_seeded(config, tx, seed).expect("test service");
        Self { svc, out }
    }

    /// Take every frame currently queued for the air, decoded.
    pub fn drain(&mut self) -> Vec<OtaMessage> {
        self.drain_raw()
            .iter()
            .map(|bytes| OtaMessage::decode(bytes).expect("well-formed egress frame"))
            .collect()
    }

    /// Take every frame currently queued for the air, as raw bytes.
    pub fn drain_raw(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.out.try_recv() {
            frames.push(frame.bytes);
        }
        frames
    }

    /// Hand an OTA message to this node as if received off the air.
    pub fn deliver(&mut self, msg: &OtaMessage) {
        self.svc
            .on_network_receive(&msg.encode().expect("encodable test frame"));
    }

    /// Advance past every pending jitter window (ACK timers included) and
    /// fire what came due.
    pub async fn settle(&mut self) {
        tokio::time::advance(Duration::from_millis(250)).await;
        self.svc.fire_due_timers();
    }
}

/// Register a subscriber session for `gid`, returning its push channel.
pub(crate) fn subscribe(node: &mut TestNode, gid: u32) -> (SessionId, UnboundedReceiver<Vec<u8>>) {
    let (session, rx) = node.svc.add_test_session();
    node.svc.on_client_message(
        session,
        AppMessage {
            pulls: vec![Pull { gid }],
            ..Default::default()
        },
    );
    (session, rx)
}

/// Register a source session for `gid`.
///
/// `interval`: `Some(secs)` for tree mode (0.0 = advertise-override),
/// `None` for flood mode.
pub(crate) fn announce(
    node: &mut TestNode,
    gid: u32,
    interval: Option<f64>,
    src_ttl: u32,
    prob_relay: u32,
) -> (SessionId, UnboundedReceiver<Vec<u8>>) {
    let (session, rx) = node.svc.add_test_session();
    node.svc.on_client_message(
        session,
        AppMessage {
            advertises: vec![AppAdvertise {
                gid,
                src_ttl,
                kind: AdvertiseKind::Register,
                interval,
                prob_relay,
                no_ttl_regen: false,
            }],
            ..Default::default()
        },
    );
    (session, rx)
}

/// Send one payload from a session, tree mode (no src_ttl).
pub(crate) fn client_data(node: &mut TestNode, session: SessionId, gid: u32, payload: &[u8]) {
    node.svc.on_client_message(
        session,
        AppMessage {
            data: vec![Data {
                gid,
                src_node: 0,
                seq: 0,
                src_ttl: None,
                ttl: 0,
                distance: 0,
                no_ttl_regen: false,
                unicast: None,
                payload: payload.to_vec(),
            }],
            ..Default::default()
        },
    );
}

/// Decode everything the service pushed to a session.
pub(crate) fn recv_pushes(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<AppMessage> {
    let mut msgs = Vec::new();
    while let Ok(framed) = rx.try_recv() {
        msgs.push(AppMessage::decode(&framed[4..]).expect("well-formed push"));
    }
    msgs
}

/// Payloads delivered to a session, flattened.
pub(crate) fn delivered_payloads(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<Vec<u8>> {
    recv_pushes(rx)
        .into_iter()
        .flat_map(|msg| msg.data.into_iter().map(|d| d.payload))
        .collect()
}

/// Whether any pushed batch carries a PULL (resp. UNPULL) for `gid`.
pub(crate) fn got_pull(msgs: &[AppMessage], gid: u32) -> bool {
    msgs.iter().any(|m| m.pulls.contains(&Pull { gid }))
}

pub(crate) fn got_unpull(msgs: &[AppMessage], gid: u32) -> bool {
    msgs.iter().any(|m| m.unpulls.contains(&Unpull { gid }))
}

/// One simulation step over a static topology: advance time, fire timers
/// everywhere, then ferry every queued frame to each link neighbor.
/// Returns how many frames moved.
pub(crate) async fn step(nodes: &mut [TestNode], links: &[(usize, usize)]) -> usize {
    tokio::time::advance(Duration::from_millis(250)).await;
    for node in nodes.iter_mut() {
        node.svc.fire_due_timers();
    }
    let mut moved = 0;
    for i in 0..nodes.len() {
        let frames = nodes[i].drain_raw();
        for bytes in frames {
            for &(a, b) in links {
                let peer = if a == i {
                    b
                } else if b == i {
                    a
                } else {
                    continue;
                };
                nodes[peer].svc.on_network_receive(&bytes);
                moved += 1;
            }
        }
    }
    moved
}

/// Step until the network goes quiet: two consecutive steps with no frame
/// movement. Periodic announce timers keep running, so "quiet" here means
/// the current propagation wave has fully died down.
pub(crate) async fn settle_network(nodes: &mut [TestNode], links: &[(usize, usize)]) {
    let mut quiet = 0;
    for _ in 0..64 {
        if step(nodes, links).await == 0 {
            quiet += 1;
            if quiet >= 2 {
                return;
            }
        } else {
            quiet = 0;
        }
    }
}

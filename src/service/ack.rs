//! ACK ingress and relay election.
//!
//! An ACK travels hop by hop toward the flow source. Each hop lands in one
//! of three dispositions: the source itself (unblock the announcing client
//! and record the subscriber), the named obligatory relay (must forward),
//! or a bystander that may still elect itself by coin flip. Forwarding a
//! relay's ACK rewrites the obligatory relay to the next hop of the reverse
//! path, which is what walks the ACK up the tree.

use super::fatal;
use super::timers::TimerKey;
use super::GcnService;
use crate::trace::TraceEvent;
use crate::types::{GroupKey, NodeId};
use crate::wire::Ack;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

impl GcnService {
    /// Ingress path for ACK frames.
    pub(crate) fn process_network_ack(&mut self, mut ack: Ack, ota_src: NodeId) {
        self.counters.recv_ack += 1;
        let now = self.table_now();
        let gid = ack.gid;
        let key = GroupKey::new(gid, ack.src_node);
        let group_node = self.is_group_participant(gid);
        if !group_node {
            self.counters.non_group_rcv_ack = true;
        }

        let seen_adv = self.adv_seen.contains(gid, ack.src_node, ack.seq);
        let coin_flipped = !self.coin_flips.is_new(key, ack.seq);
        let ack_sent = !self.acks_sent.is_new(key, ack.seq);

        // Whether this node enters the relay set for the flow. Set along
        // every path that sends (or would have sent) an ACK upstream.
        let mut add_remote_sub = false;

        if ack.src_node == self.node_id() {
            // We are the flow source. There can be several sources per
            // group, so only the announce owner of *this* flow reacts.
            if let Some(info) = self.announces.get_mut(&gid) {
                add_remote_sub = true;
                if !info.pull_forwarded {
                    info.pull_forwarded = true;
                    let session = info.session;
                    self.push_pull_to_app(session, gid);
                }
            }
        } else if ack.obligatory_relay == self.node_id() {
            let Some(path) = self.reverse_paths.get(key) else {
                fatal!("obligatory relay for flow {key} but no reverse path");
            };
            let next_hop = path.next_hop;
            // Group participants already answered the ADVERTISE with their
            // own ACK; a repeat for the same sequence adds nothing.
            if !group_node && !ack_sent {
                debug!(flow = %key, seq = ack.seq, next_hop, "obligatory relay forwarding ack");
                ack.obligatory_relay = next_hop;
                self.set_ack_timer(ack.clone());
                self.acks_sent.record(key, ack.seq);
            } else {
                debug!(flow = %key, seq = ack.seq, group_node, ack_sent,
                    "obligatory relay, ack already covered");
            }
            add_remote_sub = true;
        } else if seen_adv && !coin_flipped {
            let prob = self.effective_relay_prob(key, ack.prob_of_relay);
            if prob > 0 && self.coin_flip(prob) {
                let Some(path) = self.reverse_paths.get(key) else {
                    fatal!("won relay election for flow {key} but no reverse path");
                };
                let next_hop = path.next_hop;
                if !group_node && !ack_sent {
                    debug!(flow = %key, seq = ack.seq, next_hop, prob,
                        "won relay election, forwarding ack");
                    ack.obligatory_relay = next_hop;
                    self.set_ack_timer(ack.clone());
                    self.acks_sent.record(key, ack.seq);
                } else {
                    debug!(flow = %key, seq = ack.seq, group_node, ack_sent,
                        "won relay election, ack already covered");
                }
                add_remote_sub = true;
            } else {
                debug!(flow = %key, seq = ack.seq, prob, "lost relay election");
            }
            // one flip per flow sequence, win or lose
            self.coin_flips.record(key, ack.seq);
        } else if !seen_adv {
            debug!(flow = %key, seq = ack.seq, "ack without matching advertise, ignoring");
        } else {
            debug!(flow = %key, seq = ack.seq, "already flipped for this sequence");
        }

        if add_remote_sub {
            self.remote_subs.mark(gid, ota_src, now);
        }

        if let Some(trace) = self.trace.as_mut() {
            let attrs = format!(
                r#"{{""rcvfrom"":""node{:03}"",""gid"":{},""seq"":{},""orgsrc"":""node{:03}"",""grpnode"":{},""obligrelay"":{},""probrelay"":{},""addremotepull"":{},""seenadv"":{},""coinflipped"":{},""acksent"":{}}}"#,
                ota_src,
                gid,
                ack.seq,
                ack.src_node,
                group_node as u8,
                ack.obligatory_relay,
                ack.prob_of_relay,
                add_remote_sub as u8,
                seen_adv as u8,
                coin_flipped as u8,
                ack_sent as u8
            );
            trace.emit(TraceEvent::RcvAck, &attrs);
        }
    }

    /// Schedule an ACK transmission. Unlike DATA and ADVERTISE timers, an
    /// already-pending ACK for the flow is left alone; one answer per
    /// election window is enough.
    pub(crate) fn set_ack_timer(&mut self, ack: Ack) {
        let key = GroupKey::new(ack.gid, ack.src_node);
        if self.pending_acks.contains_key(&key) {
            debug!(flow = %key, "ack already scheduled");
            return;
        }
        let delay = Duration::from_millis(100 + self.rng.gen_range(0..100));
        self.pending_acks.insert(key, ack);
        self.timers.schedule(TimerKey::Ack(key), Instant::now() + delay);
        debug!(flow = %key, ?delay, "ack transmission scheduled");
    }

    /// ACK timer fire: fill in the probability of relay from the reverse
    /// path and transmit.
    pub(crate) fn on_ack_timer(&mut self, key: GroupKey) {
        let Some(mut ack) = self.pending_acks.remove(&key) else {
            return; // cancelled by table eviction
        };
        let Some(path) = self.reverse_paths.get(key) else {
            fatal!("sending ack for flow {key} but no reverse path");
        };
        let prob_relay = path.prob_relay;
        ack.prob_of_relay = if prob_relay > 100 {
            // Per-neighbor numerator: scale by how many distinct neighbors
            // delivered the latest advertise. A value of 200 with four
            // advertising neighbors yields an effective 50%. A count of
            // zero is treated as one, the same as at the flip site.
            let neighbors = self.distances.neighbor_count(key).max(1) as u32;
            prob_relay / neighbors
        } else {
            prob_relay
        };
        debug!(flow = %key, seq = ack.seq, prob = ack.prob_of_relay, "ack timer fired");
        self.forward_to_ota_ack(&ack);
    }

    /// The effective election probability at the flip site.
    pub(crate) fn effective_relay_prob(&self, key: GroupKey, prob: u32) -> u32 {
        if prob > 100 {
            let neighbors = self.distances.neighbor_count(key).max(1) as u32;
            prob / neighbors
        } else {
            prob
        }
    }

    /// Biased coin: true with probability `prob`/100 (values >= 100 always
    /// win).
    pub(crate) fn coin_flip(&mut self, prob: u32) -> bool {
        self.rng.gen_range(0..100u32) < prob
    }
}

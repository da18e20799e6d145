//! ADVERTISE emission and ingress.
//!
//! Sources probe the tree by flooding ADVERTISE frames on a period. Every
//! node receiving a fresh one remembers who delivered it (the reverse path)
//! and updates its distance estimate; group participants also answer with
//! an ACK. Forwarding follows the TTL-regeneration policy:
//! group participants reset the TTL to the source's value, everyone else
//! spends the remaining budget, and a later copy with more budget than any
//! seen before is forwarded once more.

use super::fatal;
use super::timers::TimerKey;
use super::GcnService;
use crate::trace::TraceEvent;
use crate::types::{GroupId, GroupKey, NodeId};
use crate::wire::{Ack, Advertise};
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

impl GcnService {
    /// Periodic ADVERTISE emission for a group this node sources.
    pub(crate) fn on_announce_timer(&mut self, gid: GroupId) {
        let Some(info) = self.announces.get_mut(&gid) else {
            return; // deregistered before the tick fired
        };
        info.seq += 1;
        let advertise = Advertise {
            gid,
            src_node: self.config.node_id,
            seq: info.seq,
            src_ttl: info.src_ttl,
            ttl: info.src_ttl,
            distance: 0,
            prob_relay: info.prob_relay,
            no_ttl_regen: info.no_ttl_regen,
        };
        let interval = info.interval;

        // Seed our own tables so the echo of this frame is recognized.
        let now = self.table_now();
        let hash = advertise.frame_hash();
        self.seen.insert(hash, advertise.ttl, now);
        self.distances.update(
            GroupKey::new(gid, self.node_id()),
            hash,
            0,
            self.node_id(),
            true,
            true,
            self.node_id(),
        );

        debug!(gid, seq = advertise.seq, ttl = advertise.src_ttl, "emitting advertise");
        self.forward_to_ota_advertise(&advertise, advertise.src_ttl);

        if let Some(d) = interval {
            if !d.is_zero() {
                self.timers.schedule(TimerKey::Announce(gid), Instant::now() + d);
            }
        }
    }

    /// Ingress path for ADVERTISE frames.
    pub(crate) fn process_network_advertise(&mut self, mut advertise: Advertise, ota_src: NodeId) {
        // The advertised distance is hops-from-source and must count this hop
        // before any table update or forward.
        advertise.distance += 1;

        let now = self.table_now();
        let hash = advertise.frame_hash();
        let is_new = self.seen.insert(hash, advertise.ttl, now);

        let gid = advertise.gid;
        let key = GroupKey::new(gid, advertise.src_node);
        let group_node = self.is_group_participant(gid);

        // The seen-set feeds the ACK relay election. Non-group nodes only
        // record advertisements they could actually forward.
        if group_node {
            self.adv_seen.insert(gid, advertise.src_node, advertise.seq, now);
        } else {
            self.counters.non_group_rcv_adv = true;
            if advertise.ttl > 0 {
                self.adv_seen.insert(gid, advertise.src_node, advertise.seq, now);
            }
        }

        self.distances
            .update(key, hash, advertise.distance, ota_src, is_new, true, self.node_id());

        if is_new {
            self.counters.recv_adv += 1;
            // the first ADVERTISE of a fresh sequence defines the reverse path
            self.reverse_paths
                .observe(key, ota_src, advertise.seq, advertise.prob_relay, now);
        }

        if group_node {
            if is_new {
                if !advertise.no_ttl_regen {
                    debug!(gid, src = advertise.src_node, ttl = advertise.src_ttl,
                        "group node forwarding advertise with regenerated ttl");
                    let src_ttl = advertise.src_ttl;
                    self.set_advertise_timer(advertise.clone(), src_ttl);
                    self.counters.forwarded += 1;
                } else if advertise.ttl > 0 {
                    debug!(gid, src = advertise.src_node, ttl = advertise.ttl,
                        "group node forwarding advertise without ttl regeneration");
                    let ttl = advertise.ttl;
                    self.set_advertise_timer(advertise.clone(), ttl);
                    self.counters.forwarded += 1;
                }

                // Answer toward whoever delivered the frame; the prob of
                // relay is filled in from the reverse path at send time.
                let ack = Ack {
                    gid,
                    src_node: advertise.src_node,
                    seq: advertise.seq,
                    obligatory_relay: ota_src,
                    prob_of_relay: 0,
                };
                self.set_ack_timer(ack);

                // In override mode another source's ADVERTISE is the signal
                // that a tree exists and our client may start sending.
                if let Some(info) = self.announces.get_mut(&gid) {
                    if info.advertise_override() && !info.pull_forwarded {
                        info.pull_forwarded = true;
                        let session = info.session;
                        self.push_pull_to_app(session, gid);
                    }
                }
            }
        } else if advertise.ttl > 0 {
            if is_new {
                debug!(gid, src = advertise.src_node, ttl = advertise.ttl,
                    "non-group node forwarding advertise");
                let ttl = advertise.ttl;
                self.set_advertise_timer(advertise.clone(), ttl);
                self.counters.forwarded += 1;
            } else {
                let Some(max_ttl) = self.seen.max_ttl(hash) else {
                    fatal!("duplicate advertise missing from the hash table");
                };
                if advertise.ttl > max_ttl {
                    // a copy with more budget repairs coverage the first
                    // one could not reach
                    self.seen.raise_max_ttl(hash, advertise.ttl);
                    let Some(distance) = self.distances.distance_to(key) else {
                        fatal!("duplicate advertise for {key} with no distance entry");
                    };
                    advertise.distance = distance;
                    debug!(gid, src = advertise.src_node, ttl = advertise.ttl,
                        "duplicate advertise with higher ttl, re-forwarding");
                    let ttl = advertise.ttl;
                    self.set_advertise_timer(advertise.clone(), ttl);
                    self.counters.forwarded += 1;
                } else {
                    self.counters.dropped += 1;
                }
            }
        } else {
            self.counters.dropped += 1;
        }

        if let Some(trace) = self.trace.as_mut() {
            let attrs = format!(
                r#"{{""rcvfrom"":""node{:03}"",""gid"":{},""seq"":{},""orgsrc"":""node{:03}"",""srcttl"":{},""ttl"":{},""dist"":{},""newhash"":{},""grpnode"":{}}}"#,
                ota_src,
                gid,
                advertise.seq,
                advertise.src_node,
                advertise.src_ttl,
                advertise.ttl,
                advertise.distance,
                is_new as u8,
                group_node as u8
            );
            trace.emit(TraceEvent::RcvAdv, &attrs);
        }
    }

    /// Schedule an ADVERTISE transmission with flood jitter. A pending
    /// frame for the same flow is replaced, so the highest-TTL copy wins.
    pub(crate) fn set_advertise_timer(&mut self, advertise: Advertise, ttl: u32) {
        let key = GroupKey::new(advertise.gid, advertise.src_node);
        let delay = Duration::from_micros(self.rng.gen_range(0..1000));
        self.pending_advs.insert(key, (advertise, ttl));
        self.timers
            .schedule(TimerKey::Advertise(key), Instant::now() + delay);
        debug!(flow = %key, ?delay, "advertise transmission scheduled");
    }

    pub(crate) fn on_adv_timer(&mut self, key: GroupKey) {
        let Some((advertise, ttl)) = self.pending_advs.remove(&key) else {
            return; // cancelled by table eviction
        };
        debug!(flow = %key, seq = advertise.seq, ttl, "advertise timer fired");
        self.forward_to_ota_advertise(&advertise, ttl);
    }
}

//! DATA plane.
//!
//! All DATA, whether from the wire or from a local client, funnels through one
//! pre-processing step (duplicate hash, distance table, local delivery)
//! before the forwarding decision. Broadcast forwarding depends on whether
//! the flow runs over the tree (no source TTL on the frame) or flood-style;
//! unicast forwarding walks the reverse path under a shrinking
//! relay-distance budget.

use super::fatal;
use super::session::SessionId;
use super::timers::TimerKey;
use super::GcnService;
use crate::trace::TraceEvent;
use crate::types::{GroupKey, HashValue, NodeId};
use crate::wire::Data;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

impl GcnService {
    /// Shared pre-processing for every DATA frame: fold into the duplicate
    /// hash and the distance table, and deliver to local subscribers.
    ///
    /// `from_session` is set for client-produced frames so the producing
    /// session never receives its own payload back.
    pub(crate) fn pre_process_data(
        &mut self,
        data: &Data,
        ota_src: NodeId,
        from_session: Option<SessionId>,
    ) -> (HashValue, bool) {
        let now = self.table_now();
        let hash = data.frame_hash();
        let is_new = self.seen.insert(hash, data.ttl, now);

        self.distances.update(
            GroupKey::new(data.gid, data.src_node),
            hash,
            data.distance,
            ota_src,
            is_new,
            false,
            self.node_id(),
        );

        if !is_new {
            return (hash, false);
        }

        if let Some(unicast) = &data.unicast {
            self.counters.recv_data_uni += 1;
            if unicast.dest == self.node_id() {
                // deliver to the source client of this group, if any
                if let Some(info) = self.announces.get(&data.gid) {
                    let session = info.session;
                    self.push_data_to_app(session, data);
                    self.counters.pushed += 1;
                    debug!(gid = data.gid, "unicast data delivered to source client");
                }
                // and to every local subscriber
                let subs: Vec<SessionId> = self
                    .local_subs
                    .iter()
                    .filter(|(gid, _)| *gid == data.gid)
                    .map(|(_, session)| *session)
                    .collect();
                for session in subs {
                    self.push_data_to_app(session, data);
                    self.counters.pushed += 1;
                }
            }
        } else {
            self.counters.recv_data += 1;
            let subs: Vec<SessionId> = self
                .local_subs
                .iter()
                .filter(|(gid, _)| *gid == data.gid)
                .map(|(_, session)| *session)
                .collect();
            for session in subs {
                if from_session != Some(session) {
                    self.push_data_to_app(session, data);
                    self.counters.pushed += 1;
                }
            }
        }
        (hash, true)
    }

    /// Ingress path for DATA frames.
    pub(crate) fn process_network_data(&mut self, mut data: Data, ota_src: NodeId) {
        // count this hop before any table update or forward
        data.distance += 1;

        let (hash, is_new) = self.pre_process_data(&data, ota_src, None);

        let gid = data.gid;
        let ttl = data.ttl;
        let group_node = self.is_group_participant(gid);
        let using_ack = data.src_ttl.is_none();

        if let Some(trace) = self.trace.as_mut() {
            let attrs = format!(
                r#"{{""rcvfrom"":""node{:03}"",""gid"":{},""size"":{},""seq"":{},""srcttl"":{},""orgsrc"":""node{:03}"",""ttl"":{},""dist"":{},""newhash"":{}}}"#,
                ota_src,
                gid,
                data.payload.len(),
                data.seq,
                data.src_ttl.unwrap_or(0),
                data.src_node,
                ttl,
                data.distance - 1,
                is_new as u8
            );
            trace.emit(TraceEvent::RcvData, &attrs);
        }

        if let Some(unicast) = data.unicast.clone() {
            if !is_new || unicast.dest == self.node_id() {
                return;
            }
            // Forward only while our own distance to the destination fits
            // the remaining relay budget.
            let my_distance = self
                .distances
                .distance_to(GroupKey::new(gid, unicast.dest))
                .unwrap_or(0);
            if my_distance == 0 || my_distance > unicast.relay_distance {
                debug!(
                    gid,
                    dest = unicast.dest,
                    my_distance,
                    relay_distance = unicast.relay_distance,
                    "unicast outside relay budget, not forwarding"
                );
                return;
            }

            if using_ack {
                // only relays of the corresponding one-to-many flow carry
                // the reverse unicast
                if (group_node && self.config.always_rebroadcast) || self.remote_subs.has_subs(gid)
                {
                    self.forward_unicast(data, my_distance, 1, hash);
                } else {
                    debug!(gid, dest = unicast.dest, "not a relay for this flow, not forwarding");
                }
            } else if ttl > 0 && (!group_node || data.no_ttl_regen) {
                self.forward_unicast(data, my_distance, ttl, hash);
            } else if group_node {
                let src_ttl = data.src_ttl.expect("flood-mode frame carries src_ttl");
                self.forward_unicast(data, my_distance, src_ttl, hash);
            } else {
                debug!(gid, dest = unicast.dest, ttl, "unicast ttl exhausted, not forwarding");
            }
        } else if data.src_node != self.node_id() {
            if using_ack {
                if is_new
                    && ((group_node && self.config.always_rebroadcast)
                        || self.remote_subs.has_subs(gid))
                {
                    // Relay over the tree. TTL 1 goes out as 0: tree data
                    // never floods past the relay set.
                    self.set_data_timer(data, 1, hash);
                    self.counters.forwarded += 1;
                    if group_node {
                        self.counters.relay_data_group = true;
                    } else {
                        self.counters.relay_data_non_group = true;
                    }
                }
            } else {
                let src_ttl = data.src_ttl.expect("flood-mode frame carries src_ttl");
                if group_node {
                    if is_new {
                        if !data.no_ttl_regen {
                            debug!(gid, src_ttl, "group node flood-forwarding with regenerated ttl");
                            self.set_data_timer(data, src_ttl, hash);
                            self.counters.forwarded += 1;
                            self.counters.relay_data_group = true;
                        } else if ttl > 0 {
                            debug!(gid, ttl, "group node flood-forwarding without regeneration");
                            self.set_data_timer(data, ttl, hash);
                            self.counters.forwarded += 1;
                            self.counters.relay_data_group = true;
                        }
                    }
                } else if ttl > 0 {
                    if is_new {
                        self.set_data_timer(data, ttl, hash);
                        self.counters.forwarded += 1;
                        self.counters.relay_data_non_group = true;
                    } else {
                        let Some(max_ttl) = self.seen.max_ttl(hash) else {
                            fatal!("duplicate data missing from the hash table");
                        };
                        if ttl > max_ttl {
                            // a copy with more budget than any seen gets one
                            // more transmission
                            self.seen.raise_max_ttl(hash, ttl);
                            let key = GroupKey::new(gid, data.src_node);
                            let Some(distance) = self.distances.distance_to(key) else {
                                fatal!("duplicate data for {key} with no distance entry");
                            };
                            data.distance = distance;
                            debug!(gid, ttl, "duplicate data with higher ttl, re-forwarding");
                            self.set_data_timer(data, ttl, hash);
                            self.counters.forwarded += 1;
                            self.counters.relay_data_non_group = true;
                        }
                    }
                }
            }
        }
    }

    fn forward_unicast(&mut self, mut data: Data, my_distance: u32, ttl: u32, hash: HashValue) {
        let header = data.unicast.as_mut().expect("unicast header present");
        header.relay_distance = my_distance - 1;
        debug!(
            gid = data.gid,
            dest = header.dest,
            my_distance,
            ttl,
            "forwarding unicast data"
        );
        self.set_data_timer(data, ttl, hash);
        self.counters.forwarded_uni += 1;
    }

    /// Schedule a DATA transmission with flood jitter. A pending frame with
    /// the same fingerprint is replaced, so the highest-TTL copy wins.
    pub(crate) fn set_data_timer(&mut self, data: Data, ttl: u32, hash: HashValue) {
        let delay = Duration::from_micros(self.rng.gen_range(0..10));
        self.pending_data.insert(hash, (data, ttl));
        self.timers.schedule(TimerKey::Data(hash), Instant::now() + delay);
        debug!(hash, ?delay, "data transmission scheduled");
    }

    pub(crate) fn on_data_timer(&mut self, hash: HashValue) {
        let Some((data, ttl)) = self.pending_data.remove(&hash) else {
            return; // cancelled by table eviction
        };
        debug!(gid = data.gid, src = data.src_node, hash, ttl, "data timer fired");
        self.forward_to_ota_data(&data, ttl);
    }
}

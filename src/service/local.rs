//! Application message handling.
//!
//! Everything a local client can ask for arrives here: PULL / UNPULL
//! subscription changes, ADVERTISE source registration, and DATA to send.
//! Client DATA is stamped (source, sequence, distance zero) and pushed into
//! the same pre-processing path as network DATA before the egress decision.

use super::fatal;
use super::session::SessionId;
use super::timers::TimerKey;
use super::{AnnounceInfo, GcnService};
use crate::app::{AdvertiseKind, AppAdvertise, AppMessage};
use crate::trace::TraceEvent;
use crate::types::{GroupId, GroupKey};
use crate::wire::Data;
use std::collections::hash_map::Entry;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

impl AnnounceInfo {
    /// True when this registration emits its own ADVERTISE frames.
    pub(crate) fn advertises(&self) -> bool {
        matches!(self.interval, Some(d) if !d.is_zero())
    }

    /// True when this registration depends on another source of the group
    /// to advertise over the air.
    pub(crate) fn advertise_override(&self) -> bool {
        !self.advertises()
    }
}

impl GcnService {
    /// Handle one record batch from a client session.
    pub(crate) fn on_client_message(&mut self, session: SessionId, msg: AppMessage) {
        self.counters.client_rcv += 1;
        for pull in &msg.pulls {
            self.handle_pull(session, pull.gid);
        }
        for unpull in &msg.unpulls {
            self.handle_unpull(session, unpull.gid);
        }
        for data in msg.data {
            self.handle_client_data(session, data);
        }
        for advertise in msg.advertises {
            self.handle_client_advertise(session, advertise);
        }
    }

    fn handle_pull(&mut self, session: SessionId, gid: GroupId) {
        self.local_subs.push((gid, session));
        debug!(gid, session, "local subscription added");
        // A local subscriber alone does not start a source sending: the
        // source waits for a remote subscriber (an ACK over the air), then
        // serves local and remote subscribers alike.
        if let Some(trace) = self.trace.as_mut() {
            let attrs = format!(r#"{{""gid"":{}}}"#, gid);
            trace.emit(TraceEvent::LocalPull, &attrs);
        }
    }

    fn handle_unpull(&mut self, session: SessionId, gid: GroupId) {
        if let Some(pos) = self
            .local_subs
            .iter()
            .position(|(g, s)| *g == gid && *s == session)
        {
            self.local_subs.remove(pos);
            debug!(gid, session, "local subscription removed");
            if let Some(trace) = self.trace.as_mut() {
                let attrs = format!(r#"{{""gid"":{}}}"#, gid);
                trace.emit(TraceEvent::LocalUnpull, &attrs);
            }
        }
    }

    fn handle_client_advertise(&mut self, session: SessionId, advertise: AppAdvertise) {
        let gid = advertise.gid;
        match advertise.kind {
            AdvertiseKind::Deregister => {
                let Some(info) = self.announces.get(&gid) else {
                    fatal!("deregister for group {gid} with no announce entry");
                };
                if info.advertises() {
                    self.timers.cancel(&TimerKey::Announce(gid));
                }
                self.announces.remove(&gid);
                debug!(gid, session, "source deregistered");
            }
            AdvertiseKind::Register => {
                let interval = advertise.interval.map(Duration::from_secs_f64);
                if let Some(d) = interval {
                    if !d.is_zero() && d >= self.config.pull_expire {
                        fatal!(
                            "announce interval {:?} for group {gid} exceeds the remote-subscriber \
                             expiry {:?}; the tree would expire between advertisements",
                            d,
                            self.config.pull_expire
                        );
                    }
                }
                match self.announces.entry(gid) {
                    Entry::Vacant(vacant) => {
                        let info = vacant.insert(AnnounceInfo {
                            session,
                            interval,
                            src_ttl: advertise.src_ttl,
                            prob_relay: advertise.prob_relay,
                            seq: 0,
                            pull_forwarded: false,
                            no_ttl_regen: advertise.no_ttl_regen,
                        });
                        debug!(gid, session, interval = ?info.interval, "source registered");
                        if let Some(d) = interval {
                            if !d.is_zero() {
                                self.timers
                                    .schedule(TimerKey::Announce(gid), Instant::now() + d);
                            }
                        }
                    }
                    Entry::Occupied(mut occupied) => {
                        let info = occupied.get_mut();
                        if info.interval != interval {
                            if info.advertises() {
                                self.timers.cancel(&TimerKey::Announce(gid));
                            }
                            if let Some(d) = interval {
                                if !d.is_zero() {
                                    self.timers
                                        .schedule(TimerKey::Announce(gid), Instant::now() + d);
                                }
                            }
                            info.interval = interval;
                            debug!(gid, interval = ?interval, "announce interval changed");
                        }
                        info.src_ttl = advertise.src_ttl;
                        info.prob_relay = advertise.prob_relay;
                        info.no_ttl_regen = advertise.no_ttl_regen;
                    }
                }
            }
        }
    }

    /// Stamp and send one client DATA record.
    fn handle_client_data(&mut self, session: SessionId, mut data: Data) {
        // The source stamp must happen before hashing so the frame our
        // neighbors send back matches our own hash entry.
        data.distance = 0;
        data.src_node = self.node_id;
        let seq = self.seq_by_gid.entry(data.gid).or_insert(0);
        *seq += 1;
        data.seq = *seq;

        self.pre_process_data(&data, self.node_id, Some(session));

        // Whether this flow relies on another source's advertisements.
        // Unicast skips the check: a pure subscriber answering its source
        // has no announce entry at all.
        let advertise_override = if data.unicast.is_none() {
            let Some(info) = self.announces.get(&data.gid) else {
                fatal!("client data for group {} with no announce entry", data.gid);
            };
            info.advertise_override()
        } else {
            true
        };

        if let Some(unicast) = &data.unicast {
            let key = GroupKey::new(data.gid, unicast.dest);
            let Some(distance) = self.distances.distance_to(key) else {
                warn!(gid = data.gid, dest = unicast.dest, "unicast with no distance entry");
                return;
            };
            if distance > 0 {
                let resilience = unicast.resilience.unwrap_or_default();
                let relay_distance = resilience.relay_distance(distance);
                let mut out = data.clone();
                let header = out.unicast.as_mut().expect("unicast header present");
                header.relay_distance = relay_distance;
                // resilience is a local annotation only
                header.resilience = None;
                debug!(
                    gid = out.gid,
                    dest = unicast.dest,
                    distance,
                    relay_distance,
                    "sending unicast data"
                );
                let ttl = out.src_ttl.unwrap_or(1);
                self.forward_to_ota_data(&out, ttl);
            } else {
                debug!(
                    gid = data.gid,
                    dest = unicast.dest,
                    "zero distance to unicast destination, not sending"
                );
            }
        } else if let Some(src_ttl) = data.src_ttl {
            // flood mode: no tree, the source TTL is the budget
            self.forward_to_ota_data(&data, src_ttl);
        } else if self.remote_subs.has_subs(data.gid) || advertise_override {
            // tree mode: only send once a tree exists. A downstream
            // subscriber entry is that signal; in override mode the client
            // was only unblocked after another source's ADVERTISE arrived.
            self.forward_to_ota_data(&data, 1);
        }
        self.counters.sent += 1;
    }
}

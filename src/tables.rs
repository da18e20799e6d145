//! Control-plane tables: reverse paths, sequence watermarks, remote
//! subscribers, and the advertisement seen-set.

use crate::types::{GroupId, GroupKey, NodeId, SeqNum};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Where the latest ADVERTISE for a flow came from.
#[derive(Debug)]
pub struct ReversePathInfo {
    /// One-hop neighbor toward the flow source.
    pub next_hop: NodeId,
    pub last_seq: SeqNum,
    pub updated: Instant,
    /// Probability-of-relay the flow source advertised.
    pub prob_relay: u32,
}

/// Reverse paths back toward each flow source, refreshed by the first
/// ADVERTISE of every fresh sequence number.
pub struct ReversePathTable {
    map: HashMap<GroupKey, ReversePathInfo>,
    expire: Duration,
}

impl ReversePathTable {
    pub fn new(expire: Duration) -> Self {
        Self {
            map: HashMap::new(),
            expire,
        }
    }

    /// Record the neighbor that delivered a fresh ADVERTISE. Sequence
    /// numbers only move forward; replays of older sequences are ignored.
    pub fn observe(
        &mut self,
        key: GroupKey,
        next_hop: NodeId,
        seq: SeqNum,
        prob_relay: u32,
        now: Instant,
    ) {
        match self.map.get_mut(&key) {
            Some(info) => {
                if seq > info.last_seq {
                    info.next_hop = next_hop;
                    info.last_seq = seq;
                    info.updated = now;
                    info.prob_relay = prob_relay;
                }
            }
            None => {
                self.map.insert(
                    key,
                    ReversePathInfo {
                        next_hop,
                        last_seq: seq,
                        updated: now,
                        prob_relay,
                    },
                );
            }
        }
    }

    pub fn get(&self, key: GroupKey) -> Option<&ReversePathInfo> {
        self.map.get(&key)
    }

    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        let expire = self.expire;
        self.map
            .retain(|_, info| now.duration_since(info.updated) <= expire);
        before - self.map.len()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Monotonic per-flow sequence watermarks (coin flips taken, ACKs sent).
#[derive(Default)]
pub struct SeqTable {
    map: HashMap<GroupKey, SeqNum>,
}

impl SeqTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `seq` is beyond the recorded watermark for this flow.
    pub fn is_new(&self, key: GroupKey, seq: SeqNum) -> bool {
        match self.map.get(&key) {
            Some(&recorded) => seq > recorded,
            None => true,
        }
    }

    /// Advance the watermark; never moves backwards.
    pub fn record(&mut self, key: GroupKey, seq: SeqNum) {
        let entry = self.map.entry(key).or_insert(seq);
        if seq > *entry {
            *entry = seq;
        }
    }

    pub fn get(&self, key: GroupKey) -> Option<SeqNum> {
        self.map.get(&key).copied()
    }
}

/// A downstream subscriber (or relay) heard from, per group.
#[derive(Debug)]
pub struct RemoteSub {
    pub node: NodeId,
    pub heard: Instant,
}

/// Downstream subscriber presence per group, fed by ACK receipt.
///
/// A node having any entry for a group is what makes it part of the
/// group's relay set.
pub struct RemoteSubTable {
    map: HashMap<GroupId, Vec<RemoteSub>>,
    expire: Duration,
}

impl RemoteSubTable {
    pub fn new(expire: Duration) -> Self {
        Self {
            map: HashMap::new(),
            expire,
        }
    }

    /// Record (or refresh) a downstream neighbor for a group.
    pub fn mark(&mut self, gid: GroupId, node: NodeId, now: Instant) {
        let subs = self.map.entry(gid).or_default();
        match subs.iter_mut().find(|sub| sub.node == node) {
            Some(sub) => sub.heard = now,
            None => subs.push(RemoteSub { node, heard: now }),
        }
    }

    pub fn has_subs(&self, gid: GroupId) -> bool {
        self.map.get(&gid).is_some_and(|subs| !subs.is_empty())
    }

    pub fn count(&self, gid: GroupId) -> usize {
        self.map.get(&gid).map(Vec::len).unwrap_or(0)
    }

    pub fn subs(&self, gid: GroupId) -> &[RemoteSub] {
        self.map.get(&gid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Groups this node currently relays for.
    pub fn groups(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.map
            .iter()
            .filter(|(_, subs)| !subs.is_empty())
            .map(|(gid, _)| *gid)
    }

    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        let expire = self.expire;
        self.map.retain(|_, subs| {
            subs.retain(|sub| {
                let keep = now.duration_since(sub.heard) <= expire;
                if !keep {
                    removed += 1;
                }
                keep
            });
            !subs.is_empty()
        });
        removed
    }
}

/// Advertisements seen, keyed by (group, source, sequence).
///
/// Consulted on ACK receipt: a node only volunteers as probabilistic relay
/// for a sequence it actually heard advertised. Entries age out on the same
/// schedule as the frame hash table.
pub struct AdvSeenSet {
    set: HashSet<(GroupId, NodeId, SeqNum)>,
    by_time: VecDeque<(Instant, (GroupId, NodeId, SeqNum))>,
    expire: Duration,
}

impl AdvSeenSet {
    pub fn new(expire: Duration) -> Self {
        Self {
            set: HashSet::new(),
            by_time: VecDeque::new(),
            expire,
        }
    }

    pub fn insert(&mut self, gid: GroupId, src: NodeId, seq: SeqNum, now: Instant) {
        let key = (gid, src, seq);
        if self.set.insert(key) {
            self.by_time.push_back((now, key));
        }
    }

    pub fn contains(&self, gid: GroupId, src: NodeId, seq: SeqNum) -> bool {
        self.set.contains(&(gid, src, seq))
    }

    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(&(inserted, key)) = self.by_time.front() {
            if now.duration_since(inserted) <= self.expire {
                break;
            }
            self.by_time.pop_front();
            self.set.remove(&key);
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }
}

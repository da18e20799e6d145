//! Per-flow hop-distance and neighbor-count tracking.
//!
//! For every flow a node has heard, it remembers its distance in hops to the
//! flow's source and how many *distinct* neighbors forwarded the latest
//! frame of that flow. The neighbor count is the estimate used when a
//! probabilistic relay value above 100 is scaled per-neighbor.

use crate::types::{GroupKey, HashValue, NodeId};
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
pub struct DistanceInfo {
    /// Hops from this node to the flow source.
    pub distance: u32,
    /// Fingerprint of the latest frame counted.
    pub latest_hash: HashValue,
    /// Copies of the latest frame seen, one per distinct neighbor.
    pub packet_count: u16,
    /// Neighbors that forwarded the latest frame.
    pub ota_sources: HashSet<NodeId>,
}

#[derive(Default)]
pub struct DistanceTable {
    map: HashMap<GroupKey, DistanceInfo>,
}

impl DistanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one received frame into the table.
    ///
    /// Three cases:
    /// - duplicate of the latest frame: count the forwarding neighbor once,
    ///   unless we are the flow source (our own frames echoing back carry no
    ///   neighbor information). The stored distance is left alone.
    /// - new ADVERTISE: a fresh epoch; distance, latest hash, and the
    ///   neighbor set all reset.
    /// - new DATA: update only the distance; the neighbor count belongs to
    ///   the ADVERTISE epoch.
    pub fn update(
        &mut self,
        key: GroupKey,
        hash: HashValue,
        distance: u32,
        ota_src: NodeId,
        is_new: bool,
        is_advertise: bool,
        self_node: NodeId,
    ) {
        match self.map.get_mut(&key) {
            Some(info) => {
                if info.latest_hash == hash {
                    if !info.ota_sources.contains(&ota_src) && key.src != self_node {
                        info.packet_count += 1;
                        info.ota_sources.insert(ota_src);
                    }
                } else if is_new {
                    if is_advertise {
                        info.distance = distance;
                        info.latest_hash = hash;
                        info.packet_count = 1;
                        info.ota_sources.clear();
                        info.ota_sources.insert(ota_src);
                    } else {
                        info.distance = distance;
                    }
                }
            }
            None => {
                self.map.insert(
                    key,
                    DistanceInfo {
                        distance,
                        latest_hash: hash,
                        packet_count: 1,
                        ota_sources: HashSet::from([ota_src]),
                    },
                );
            }
        }
    }

    pub fn get(&self, key: GroupKey) -> Option<&DistanceInfo> {
        self.map.get(&key)
    }

    pub fn distance_to(&self, key: GroupKey) -> Option<u32> {
        self.map.get(&key).map(|info| info.distance)
    }

    /// How many distinct neighbors forwarded the latest frame for this flow.
    pub fn neighbor_count(&self, key: GroupKey) -> usize {
        self.map
            .get(&key)
            .map(|info| info.ota_sources.len())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: GroupKey = GroupKey { gid: 7, src: 3 };
    const SELF: NodeId = 1;

    #[test]
    fn first_frame_creates_entry() {
        let mut table = DistanceTable::new();
        table.update(KEY, 100, 2, 5, true, true, SELF);

        let info = table.get(KEY).unwrap();
        assert_eq!(info.distance, 2);
        assert_eq!(info.packet_count, 1);
        assert_eq!(table.neighbor_count(KEY), 1);
    }

    #[test]
    fn duplicate_counts_each_neighbor_once() {
        let mut table = DistanceTable::new();
        table.update(KEY, 100, 2, 5, true, true, SELF);
        table.update(KEY, 100, 3, 6, false, true, SELF);
        table.update(KEY, 100, 3, 6, false, true, SELF);

        let info = table.get(KEY).unwrap();
        // duplicates never touch the stored distance
        assert_eq!(info.distance, 2);
        assert_eq!(info.packet_count, 2);
        assert_eq!(table.neighbor_count(KEY), 2);
    }

    #[test]
    fn own_flow_echoes_are_not_counted() {
        let own = GroupKey::new(7, SELF);
        let mut table = DistanceTable::new();
        table.update(own, 100, 0, SELF, true, true, SELF);
        table.update(own, 100, 1, 6, false, true, SELF);

        assert_eq!(table.get(own).unwrap().packet_count, 1);
        assert!(!table.get(own).unwrap().ota_sources.contains(&6));
    }

    #[test]
    fn new_advertise_resets_epoch() {
        let mut table = DistanceTable::new();
        table.update(KEY, 100, 2, 5, true, true, SELF);
        table.update(KEY, 100, 2, 6, false, true, SELF);
        assert_eq!(table.neighbor_count(KEY), 2);

        table.update(KEY, 200, 4, 8, true, true, SELF);
        let info = table.get(KEY).unwrap();
        assert_eq!(info.distance, 4);
        assert_eq!(info.latest_hash, 200);
        assert_eq!(info.packet_count, 1);
        assert_eq!(table.neighbor_count(KEY), 1);
    }

    #[test]
    fn new_data_updates_distance_only() {
        let mut table = DistanceTable::new();
        table.update(KEY, 100, 2, 5, true, true, SELF);
        table.update(KEY, 100, 2, 6, false, true, SELF);

        table.update(KEY, 300, 1, 9, true, false, SELF);
        let info = table.get(KEY).unwrap();
        assert_eq!(info.distance, 1);
        // the advertise-epoch neighbor state is untouched
        assert_eq!(info.latest_hash, 100);
        assert_eq!(info.packet_count, 2);
        assert_eq!(table.neighbor_count(KEY), 2);
    }
}

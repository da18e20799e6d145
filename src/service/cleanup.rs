//! Periodic table sweeps and the stats tick.

use super::GcnService;
use crate::types::GroupId;
use tracing::{debug, info};

impl GcnService {
    /// Sweep expired frame fingerprints and advertisement keys.
    pub(crate) fn hash_cleanup(&mut self) {
        let now = self.table_now();
        let removed = self.seen.sweep(now);
        let removed_adv = self.adv_seen.sweep(now);
        debug!(
            removed,
            removed_adv,
            entries = self.seen.len(),
            "hash table sweep"
        );
    }

    /// Sweep expired reverse paths.
    pub(crate) fn reverse_path_cleanup(&mut self) {
        let removed = self.reverse_paths.sweep(self.table_now());
        debug!(removed, entries = self.reverse_paths.len(), "reverse path sweep");
    }

    /// Sweep expired remote subscribers, then tell any source whose
    /// subscribers have all vanished to stop sending.
    pub(crate) fn remote_subs_cleanup(&mut self) {
        let removed = self.remote_subs.sweep(self.table_now());
        debug!(removed, "remote subscriber sweep");

        // Only sources that emit their own advertisements are ever told to
        // stop: an override source has no remote-subscriber entries of its
        // own to go empty.
        let mut unpulls: Vec<(GroupId, super::SessionId)> = Vec::new();
        for (gid, info) in self.announces.iter_mut() {
            if info.pull_forwarded
                && info.advertises()
                && self.remote_subs.count(*gid) == 0
                && !self.local_subs.iter().any(|(g, _)| g == gid)
            {
                info.pull_forwarded = false;
                unpulls.push((*gid, info.session));
            }
        }
        for (gid, session) in unpulls {
            debug!(gid, session, "no subscribers left, sending unpull");
            self.push_unpull_to_app(session, gid);
        }
    }

    /// Once-a-second stats report. The relay-activity flags cover one tick.
    pub(crate) fn on_stat_tick(&mut self) {
        let relay_groups: Vec<GroupId> = self.remote_subs.groups().collect();
        info!(
            stats = %self.counters.summary(),
            relay_groups = ?relay_groups,
            "gcn stats"
        );
        self.counters.relay_data_group = false;
        self.counters.relay_data_non_group = false;
    }
}

//! Core protocol identifiers.
//!
//! A *group* is a logical traffic flow that may have multiple sources; a
//! flow is always identified by the pair of its group id and the node
//! sourcing it ([`GroupKey`]). Sequence numbers are per-flow and assigned
//! by the source.

use std::fmt;

/// Positive integer naming a node. Zero is reserved as "unset".
pub type NodeId = u32;

/// Positive integer naming a traffic flow (logical multicast group).
pub type GroupId = u32;

/// Monotonically increasing per-(source, group) counter.
pub type SeqNum = u32;

/// Opaque fingerprint of a frame, excluding the fields that change
/// hop-by-hop (TTL, distance, unicast relay distance).
pub type HashValue = u64;

/// Identifies the flow "group `gid` sourced by node `src`".
///
/// Ordered by group, then by source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub gid: GroupId,
    pub src: NodeId,
}

impl GroupKey {
    pub fn new(gid: GroupId, src: NodeId) -> Self {
        Self { gid, src }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.gid, self.src)
    }
}

/// Unicast tuning knob biasing the relay-distance budget around the
/// sender's known distance to the destination.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Resilience {
    /// Budget `distance - 1`: only strictly closer relays forward.
    #[default]
    Low = 0,
    /// Budget `distance`: relays at the same distance may forward.
    Medium = 1,
    /// Budget `distance + 1`: one extra hop of slack.
    High = 2,
}

impl Resilience {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Resilience::Low),
            1 => Some(Resilience::Medium),
            2 => Some(Resilience::High),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// The relay-distance budget for a sender at `distance` hops from the
    /// unicast destination.
    pub fn relay_distance(self, distance: u32) -> u32 {
        match self {
            Resilience::Low => distance.saturating_sub(1),
            Resilience::Medium => distance,
            Resilience::High => distance.saturating_add(1),
        }
    }
}

impl fmt::Display for Resilience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Resilience::Low => "low",
            Resilience::Medium => "medium",
            Resilience::High => "high",
        };
        write!(f, "{}", s)
    }
}

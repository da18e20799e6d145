//! GCN: Group Centric Networking
//!
//! A multi-hop wireless dissemination protocol for ad-hoc networks in which
//! a small, geographically compact subset of nodes cares about a traffic
//! flow. Advertisement/acknowledgement probes elect a sparse relay set
//! between a source and its group; group traffic is forwarded only by those
//! relays, and unicast responses reuse the tree in reverse.

pub mod app;
pub mod client;
pub mod dedup;
pub mod distance;
pub mod link;
pub mod service;
pub mod tables;
pub mod trace;
pub mod types;
pub mod wire;

// Re-export identifier types
pub use types::{GroupId, GroupKey, HashValue, NodeId, Resilience, SeqNum};

// Re-export wire types
pub use wire::{Ack, Advertise, Data, OtaMessage, UnicastHeader, WireError};

// Re-export app-channel types
pub use app::{AdvertiseKind, AppAdvertise, AppError, AppMessage, Pull, Unpull};

// Re-export link types
pub use link::{LinkClass, LinkError, OutboundFrame};

// Re-export service types
pub use service::{Counters, GcnService, ServiceConfig, ServiceError, SessionId};

// Re-export client library types
pub use client::{ClientError, ClientRole, GcnClient, GroupConfig};

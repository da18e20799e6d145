//! Broadcast link layer.
//!
//! GCN frames travel to all one-hop neighbors over a raw broadcast medium.
//! Two link *classes* are distinguished by ethertype: CTRL carries ADVERTISE
//! and ACK records, DATA carries DATA records. An OTA message with any DATA
//! record is classified DATA, otherwise CTRL.
//!
//! Every frame is prefixed with a 14-byte Ethernet-style header:
//!
//! ```text
//! [dest_mac:6][src_mac:6][ethertype:2]
//! ```
//!
//! The destination is either broadcast (`ff:ff:ff:ff:ff:ff`) or, when
//! group-multicast headers are enabled, `01:00:05:xx:xx:xx` with the low 24
//! bits of the group id in the last three octets.
//!
//! The concrete medium is pluggable: the [`udp`] adapter stands in for a raw
//! pcap device, and tests wire the frame channels of two services directly
//! together. Egress frames flow out of the service as [`OutboundFrame`]s;
//! ingress frames arrive as raw OTA payloads with the link header already
//! stripped.

pub mod udp;

use crate::types::GroupId;
use thiserror::Error;
use tokio::sync::mpsc;

/// Ethertype tag for control frames (ADVERTISE + ACK).
pub const ETH_P_GCN_CTRL: u16 = 0x88B5;

/// Ethertype tag for data frames.
pub const ETH_P_GCN_DATA: u16 = 0x88B6;

/// Size of the Ethernet-style link header.
pub const ETHER_HEADER_SIZE: usize = 14;

/// All-ones broadcast destination.
pub const ETHER_BROADCAST: [u8; 6] = [0xff; 6];

/// Group ids wrap modulo this bound when synthesized into a multicast
/// destination (24 bits of address space).
pub const MAX_MCAST_HEADER_GROUP_ID: u32 = 1 << 24;

/// Errors raised by link adapters.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no link device configured")]
    NoDevice,

    #[error("invalid link device '{device}': {reason}")]
    InvalidDevice { device: String, reason: String },

    #[error("link i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame class, mapped to an ethertype on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkClass {
    Ctrl,
    Data,
}

impl LinkClass {
    pub fn ethertype(self) -> u16 {
        match self {
            LinkClass::Ctrl => ETH_P_GCN_CTRL,
            LinkClass::Data => ETH_P_GCN_DATA,
        }
    }

    pub fn from_ethertype(ethertype: u16) -> Option<Self> {
        match ethertype {
            ETH_P_GCN_CTRL => Some(LinkClass::Ctrl),
            ETH_P_GCN_DATA => Some(LinkClass::Data),
            _ => None,
        }
    }
}

/// An encoded OTA message on its way out of the service.
#[derive(Clone, Debug)]
pub struct OutboundFrame {
    pub class: LinkClass,
    pub gid: GroupId,
    /// Encoded `OtaMessage`, without the link header.
    pub bytes: Vec<u8>,
}

/// Ingress half: raw OTA payloads with the link header stripped.
pub type FrameRx = mpsc::Receiver<Vec<u8>>;

/// Ingress sender held by link adapters.
pub type FrameTx = mpsc::Sender<Vec<u8>>;

/// Egress sender held by the service.
pub type OutboundTx = mpsc::UnboundedSender<OutboundFrame>;

/// Egress receiver consumed by link adapters.
pub type OutboundRx = mpsc::UnboundedReceiver<OutboundFrame>;

/// Create the ingress frame channel with the given buffer size.
pub fn frame_channel(buffer: usize) -> (FrameTx, FrameRx) {
    mpsc::channel(buffer)
}

/// Create the egress frame channel.
pub fn outbound_channel() -> (OutboundTx, OutboundRx) {
    mpsc::unbounded_channel()
}

/// A stable locally-administered MAC for a node id.
pub fn node_mac(node_id: u32) -> [u8; 6] {
    let id = node_id.to_be_bytes();
    [0x02, 0x00, id[0], id[1], id[2], id[3]]
}

/// Synthesize the multicast destination `01:00:05:xx:xx:xx` for a group.
pub fn mcast_dest(gid: GroupId) -> [u8; 6] {
    let gid = gid % MAX_MCAST_HEADER_GROUP_ID;
    [
        0x01,
        0x00,
        0x05,
        (gid & 0xff) as u8,
        ((gid >> 8) & 0xff) as u8,
        ((gid >> 16) & 0xff) as u8,
    ]
}

/// Prepend the link header to an encoded OTA message.
pub fn build_frame(
    class: LinkClass,
    gid: GroupId,
    mcast_header: bool,
    src_mac: [u8; 6],
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETHER_HEADER_SIZE + payload.len());
    let dest = if mcast_header {
        mcast_dest(gid)
    } else {
        ETHER_BROADCAST
    };
    frame.extend_from_slice(&dest);
    frame.extend_from_slice(&src_mac);
    frame.extend_from_slice(&class.ethertype().to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Strip the link header, returning the class and OTA payload.
///
/// Returns `None` for short frames and foreign ethertypes.
pub fn parse_frame(frame: &[u8]) -> Option<(LinkClass, &[u8])> {
    if frame.len() < ETHER_HEADER_SIZE {
        return None;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let class = LinkClass::from_ethertype(ethertype)?;
    Some((class, &frame[ETHER_HEADER_SIZE..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_ethertype_roundtrip() {
        assert_eq!(LinkClass::from_ethertype(0x88B5), Some(LinkClass::Ctrl));
        assert_eq!(LinkClass::from_ethertype(0x88B6), Some(LinkClass::Data));
        assert_eq!(LinkClass::from_ethertype(0x0800), None);
    }

    #[test]
    fn mcast_dest_places_low_bits_last() {
        assert_eq!(mcast_dest(1), [0x01, 0x00, 0x05, 0x01, 0x00, 0x00]);
        assert_eq!(mcast_dest(0x0504 | 3), [0x01, 0x00, 0x05, 0x07, 0x05, 0x00]);
        // wraps modulo 2^24
        assert_eq!(mcast_dest(MAX_MCAST_HEADER_GROUP_ID + 9), mcast_dest(9));
    }

    #[test]
    fn frame_roundtrip_broadcast() {
        let payload = b"ota bytes";
        let frame = build_frame(LinkClass::Ctrl, 7, false, node_mac(3), payload);
        assert_eq!(frame.len(), ETHER_HEADER_SIZE + payload.len());
        assert_eq!(&frame[..6], &ETHER_BROADCAST);

        let (class, body) = parse_frame(&frame).unwrap();
        assert_eq!(class, LinkClass::Ctrl);
        assert_eq!(body, payload);
    }

    #[test]
    fn frame_roundtrip_mcast() {
        let frame = build_frame(LinkClass::Data, 7, true, node_mac(3), b"x");
        assert_eq!(&frame[..6], &mcast_dest(7));
        let (class, _) = parse_frame(&frame).unwrap();
        assert_eq!(class, LinkClass::Data);
    }

    #[test]
    fn parse_drops_foreign_and_short_frames() {
        assert!(parse_frame(&[0u8; 5]).is_none());

        let mut frame = build_frame(LinkClass::Ctrl, 1, false, node_mac(1), b"y");
        frame[12] = 0x08;
        frame[13] = 0x00;
        assert!(parse_frame(&frame).is_none());
    }
}

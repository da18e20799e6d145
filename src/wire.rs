//! Over-the-air wire format.
//!
//! Every OTA transmission is one [`OtaMessage`]: a producer node id followed
//! by zero or more ADVERTISE, ACK, and DATA records. All integers are
//! big-endian.
//!
//! ## Envelope
//!
//! ```text
//! [src:4][n_advertise:1][n_ack:1][n_data:1][advertise...][ack...][data...]
//! ```
//!
//! ## Records
//!
//! | Record    | Size | Layout |
//! |-----------|------|--------|
//! | ADVERTISE | 29   | `[gid:4][src_node:4][seq:4][src_ttl:4][ttl:4][distance:4][prob_relay:4][flags:1]` |
//! | ACK       | 20   | `[gid:4][src_node:4][seq:4][obligatory_relay:4][prob_of_relay:4]` |
//! | DATA      | var  | `[flags:1][gid:4][src_node:4][seq:4][ttl:4][distance:4]` + optional fields + `[payload_len:2][payload]` |
//!
//! DATA optional fields, in order, gated by flag bits: `src_ttl:4` (bit 0),
//! `dest:4` + `relay_distance:4` (bit 2), `resilience:1` (bit 3). Bit 1 is
//! the no-TTL-regeneration marker on both ADVERTISE and DATA.
//!
//! The *absence* of `src_ttl` on a DATA record is the protocol's encoding of
//! "this flow uses ADVERTISE/ACK"; its presence means flood-style delivery.
//! The resilience field is a local annotation between client and service and
//! is cleared before a frame goes over the air.
//!
//! ## Frame fingerprints
//!
//! [`Advertise::frame_hash`] and [`Data::frame_hash`] fingerprint the record
//! with the hop-mutable fields (`ttl`, `distance`, and for unicast
//! `relay_distance`) zeroed and the resilience annotation dropped, so every
//! hop of the same frame hashes identically. Everything else, including
//! the payload, sequence, and `src_ttl` presence and value, is inside the
//! hash.

use crate::types::{GroupId, HashValue, NodeId, Resilience, SeqNum};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Largest encoded frame accepted on either side of the link.
pub const MAX_FRAME_SIZE: usize = 8192;

/// Encoded size of the envelope prefix (src + three record counts).
pub const ENVELOPE_PREFIX_SIZE: usize = 7;

/// Encoded size of an ADVERTISE record.
pub const ADVERTISE_RECORD_SIZE: usize = 29;

/// Encoded size of an ACK record.
pub const ACK_RECORD_SIZE: usize = 20;

/// Fixed part of a DATA record (flags + five u32 fields + payload length).
pub const DATA_RECORD_MIN_SIZE: usize = 23;

// DATA flag bits.
const FLAG_SRC_TTL: u8 = 0x01;
const FLAG_NO_TTL_REGEN: u8 = 0x02;
const FLAG_UNICAST: u8 = 0x04;
const FLAG_RESILIENCE: u8 = 0x08;

/// Errors raised while encoding or decoding OTA frames.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("truncated frame")]
    Truncated,

    #[error("frame too large: {size} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge { size: usize },

    #[error("payload too large: {size} bytes")]
    PayloadTooLarge { size: usize },

    #[error("invalid resilience value: {0}")]
    InvalidResilience(u8),

    #[error("{0} trailing bytes after last record")]
    TrailingBytes(usize),
}

/// Source-originated control frame probing the group tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertise {
    pub gid: GroupId,
    pub src_node: NodeId,
    pub seq: SeqNum,
    /// TTL assigned by the source; used to reset TTL at group nodes under
    /// regeneration.
    pub src_ttl: u32,
    pub ttl: u32,
    /// Hops from the source, incremented at every ingress.
    pub distance: u32,
    /// Probability of relay carried to subscribers; values above 100 are
    /// per-neighbor numerators.
    pub prob_relay: u32,
    pub no_ttl_regen: bool,
}

/// Subscriber- or relay-originated control frame propagating up the
/// reverse path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub gid: GroupId,
    /// The advertised source this ACK answers, not the ACK producer.
    pub src_node: NodeId,
    pub seq: SeqNum,
    /// The upstream neighbor that *must* forward this ACK.
    pub obligatory_relay: NodeId,
    pub prob_of_relay: u32,
}

/// Unicast addressing carried by a DATA frame travelling the reverse path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnicastHeader {
    pub dest: NodeId,
    /// Hop budget: a relay forwards only while its own distance to `dest`
    /// fits inside this value.
    pub relay_distance: u32,
    /// Client-to-service annotation; never sent over the air.
    pub resilience: Option<Resilience>,
}

/// Application payload frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Data {
    pub gid: GroupId,
    pub src_node: NodeId,
    pub seq: SeqNum,
    /// `None` means the flow uses ADVERTISE/ACK; `Some` means flood-style.
    pub src_ttl: Option<u32>,
    pub ttl: u32,
    pub distance: u32,
    pub no_ttl_regen: bool,
    pub unicast: Option<UnicastHeader>,
    pub payload: Vec<u8>,
}

/// One over-the-air transmission.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OtaMessage {
    /// Producer of this frame (the one-hop neighbor, not a flow source).
    pub src: NodeId,
    pub advertises: Vec<Advertise>,
    pub acks: Vec<Ack>,
    pub data: Vec<Data>,
}

impl OtaMessage {
    pub fn new(src: NodeId) -> Self {
        Self {
            src,
            ..Default::default()
        }
    }

    /// True when this frame carries any DATA record (and therefore travels
    /// on the DATA link class).
    pub fn carries_data(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(ENVELOPE_PREFIX_SIZE);
        buf.extend_from_slice(&self.src.to_be_bytes());
        buf.push(self.advertises.len() as u8);
        buf.push(self.acks.len() as u8);
        buf.push(self.data.len() as u8);
        for adv in &self.advertises {
            adv.encode_record(&mut buf);
        }
        for ack in &self.acks {
            ack.encode_record(&mut buf);
        }
        for data in &self.data {
            data.encode_record(&mut buf)?;
        }
        if buf.len() > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge { size: buf.len() });
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge { size: bytes.len() });
        }
        let mut cur = Reader::new(bytes);
        let src = cur.u32()?;
        let n_adv = cur.u8()?;
        let n_ack = cur.u8()?;
        let n_data = cur.u8()?;

        let mut msg = OtaMessage::new(src);
        for _ in 0..n_adv {
            msg.advertises.push(Advertise::decode_record(&mut cur)?);
        }
        for _ in 0..n_ack {
            msg.acks.push(Ack::decode_record(&mut cur)?);
        }
        for _ in 0..n_data {
            msg.data.push(Data::decode_record(&mut cur)?);
        }
        if cur.remaining() != 0 {
            return Err(WireError::TrailingBytes(cur.remaining()));
        }
        Ok(msg)
    }
}

impl Advertise {
    pub(crate) fn encode_record(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.gid.to_be_bytes());
        buf.extend_from_slice(&self.src_node.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.src_ttl.to_be_bytes());
        buf.extend_from_slice(&self.ttl.to_be_bytes());
        buf.extend_from_slice(&self.distance.to_be_bytes());
        buf.extend_from_slice(&self.prob_relay.to_be_bytes());
        buf.push(if self.no_ttl_regen { FLAG_NO_TTL_REGEN } else { 0 });
    }

    pub(crate) fn decode_record(cur: &mut Reader<'_>) -> Result<Self, WireError> {
        let gid = cur.u32()?;
        let src_node = cur.u32()?;
        let seq = cur.u32()?;
        let src_ttl = cur.u32()?;
        let ttl = cur.u32()?;
        let distance = cur.u32()?;
        let prob_relay = cur.u32()?;
        let flags = cur.u8()?;
        Ok(Self {
            gid,
            src_node,
            seq,
            src_ttl,
            ttl,
            distance,
            prob_relay,
            no_ttl_regen: flags & FLAG_NO_TTL_REGEN != 0,
        })
    }

    /// Fingerprint over the hop-stable fields.
    pub fn frame_hash(&self) -> HashValue {
        let mut stable = self.clone();
        stable.ttl = 0;
        stable.distance = 0;
        let mut buf = Vec::with_capacity(ADVERTISE_RECORD_SIZE);
        stable.encode_record(&mut buf);
        digest(&buf)
    }
}

impl Ack {
    pub(crate) fn encode_record(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.gid.to_be_bytes());
        buf.extend_from_slice(&self.src_node.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.obligatory_relay.to_be_bytes());
        buf.extend_from_slice(&self.prob_of_relay.to_be_bytes());
    }

    pub(crate) fn decode_record(cur: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            gid: cur.u32()?,
            src_node: cur.u32()?,
            seq: cur.u32()?,
            obligatory_relay: cur.u32()?,
            prob_of_relay: cur.u32()?,
        })
    }
}

impl Data {
    pub(crate) fn encode_record(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        if self.payload.len() > u16::MAX as usize {
            return Err(WireError::PayloadTooLarge {
                size: self.payload.len(),
            });
        }
        let mut flags = 0u8;
        if self.src_ttl.is_some() {
            flags |= FLAG_SRC_TTL;
        }
        if self.no_ttl_regen {
            flags |= FLAG_NO_TTL_REGEN;
        }
        if let Some(u) = &self.unicast {
            flags |= FLAG_UNICAST;
            if u.resilience.is_some() {
                flags |= FLAG_RESILIENCE;
            }
        }
        buf.push(flags);
        buf.extend_from_slice(&self.gid.to_be_bytes());
        buf.extend_from_slice(&self.src_node.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.ttl.to_be_bytes());
        buf.extend_from_slice(&self.distance.to_be_bytes());
        if let Some(src_ttl) = self.src_ttl {
            buf.extend_from_slice(&src_ttl.to_be_bytes());
        }
        if let Some(u) = &self.unicast {
            buf.extend_from_slice(&u.dest.to_be_bytes());
            buf.extend_from_slice(&u.relay_distance.to_be_bytes());
            if let Some(r) = u.resilience {
                buf.push(r.to_u8());
            }
        }
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(())
    }

    pub(crate) fn decode_record(cur: &mut Reader<'_>) -> Result<Self, WireError> {
        let flags = cur.u8()?;
        let gid = cur.u32()?;
        let src_node = cur.u32()?;
        let seq = cur.u32()?;
        let ttl = cur.u32()?;
        let distance = cur.u32()?;
        let src_ttl = if flags & FLAG_SRC_TTL != 0 {
            Some(cur.u32()?)
        } else {
            None
        };
        let unicast = if flags & FLAG_UNICAST != 0 {
            let dest = cur.u32()?;
            let relay_distance = cur.u32()?;
            let resilience = if flags & FLAG_RESILIENCE != 0 {
                let b = cur.u8()?;
                Some(Resilience::from_u8(b).ok_or(WireError::InvalidResilience(b))?)
            } else {
                None
            };
            Some(UnicastHeader {
                dest,
                relay_distance,
                resilience,
            })
        } else {
            None
        };
        let payload_len = cur.u16()? as usize;
        let payload = cur.bytes(payload_len)?.to_vec();
        Ok(Self {
            gid,
            src_node,
            seq,
            src_ttl,
            ttl,
            distance,
            no_ttl_regen: flags & FLAG_NO_TTL_REGEN != 0,
            unicast,
            payload,
        })
    }

    /// Fingerprint over the hop-stable fields.
    pub fn frame_hash(&self) -> HashValue {
        let mut stable = self.clone();
        stable.ttl = 0;
        stable.distance = 0;
        if let Some(u) = &mut stable.unicast {
            u.relay_distance = 0;
            u.resilience = None;
        }
        let mut buf = Vec::with_capacity(DATA_RECORD_MIN_SIZE + stable.payload.len());
        stable
            .encode_record(&mut buf)
            .expect("payload length already bounded");
        digest(&buf)
    }
}

fn digest(bytes: &[u8]) -> HashValue {
    let hash = Sha256::digest(bytes);
    u64::from_be_bytes(hash[..8].try_into().expect("sha256 output is 32 bytes"))
}

/// Bounds-checked reader over a decode buffer.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn u8(&mut self) -> Result<u8, WireError> {
        let b = *self.buf.get(self.pos).ok_or(WireError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, WireError> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn f64(&mut self) -> Result<f64, WireError> {
        let bytes = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_bits(u64::from_be_bytes(raw)))
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

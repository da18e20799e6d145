//! Local control-channel format.
//!
//! Applications talk to the service over a loopback stream. Each record on
//! the stream is a 4-byte big-endian length followed by one encoded
//! [`AppMessage`], a concatenation of zero or more PULL, UNPULL, ADVERTISE,
//! and DATA sub-records. The same encoding is used in both directions.
//!
//! ```text
//! [n_pull:1][n_unpull:1][n_advertise:1][n_data:1][pull...][unpull...][advertise...][data...]
//! ```
//!
//! | Record    | Layout |
//! |-----------|--------|
//! | PULL      | `[gid:4]` |
//! | UNPULL    | `[gid:4]` |
//! | ADVERTISE | `[gid:4][src_ttl:4][kind:1][flags:1]` + `[interval:8][prob_relay:4]` when flag bit 0 |
//! | DATA      | the OTA DATA record of [`crate::wire`] |
//!
//! ADVERTISE flag bit 1 marks a flow that does not regenerate TTL. The
//! interval is an `f64` bit pattern in seconds; zero requests
//! advertise-override mode (announce locally, rely on another source of the
//! same group to advertise over the air).

use crate::types::GroupId;
use crate::wire::{Data, Reader, WireError, MAX_FRAME_SIZE};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const FLAG_INTERVAL: u8 = 0x01;
const FLAG_NO_TTL_REGEN: u8 = 0x02;

/// Errors raised on the local control channel.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad record length: {0} bytes")]
    BadLength(usize),

    #[error("invalid advertise kind: {0}")]
    InvalidAdvertiseKind(u8),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("control channel i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Subscribe to a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pull {
    pub gid: GroupId,
}

/// Remove one subscription to a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Unpull {
    pub gid: GroupId,
}

/// Whether an application ADVERTISE starts or ends a source registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvertiseKind {
    Register,
    Deregister,
}

/// Application source registration for a group.
#[derive(Clone, Debug, PartialEq)]
pub struct AppAdvertise {
    pub gid: GroupId,
    pub src_ttl: u32,
    pub kind: AdvertiseKind,
    /// Advertise emission period in seconds. `Some(0.0)` is
    /// advertise-override; `None` marks a flood-mode registration that
    /// never advertises.
    pub interval: Option<f64>,
    pub prob_relay: u32,
    pub no_ttl_regen: bool,
}

/// One record batch on the local control channel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppMessage {
    pub pulls: Vec<Pull>,
    pub unpulls: Vec<Unpull>,
    pub advertises: Vec<AppAdvertise>,
    pub data: Vec<Data>,
}

impl AppMessage {
    pub fn is_empty(&self) -> bool {
        self.pulls.is_empty()
            && self.unpulls.is_empty()
            && self.advertises.is_empty()
            && self.data.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, AppError> {
        let mut buf = Vec::with_capacity(4);
        buf.push(self.pulls.len() as u8);
        buf.push(self.unpulls.len() as u8);
        buf.push(self.advertises.len() as u8);
        buf.push(self.data.len() as u8);
        for pull in &self.pulls {
            buf.extend_from_slice(&pull.gid.to_be_bytes());
        }
        for unpull in &self.unpulls {
            buf.extend_from_slice(&unpull.gid.to_be_bytes());
        }
        for adv in &self.advertises {
            adv.encode_record(&mut buf);
        }
        for data in &self.data {
            data.encode_record(&mut buf)?;
        }
        if buf.len() > MAX_FRAME_SIZE {
            return Err(AppError::BadLength(buf.len()));
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AppError> {
        let mut cur = Reader::new(bytes);
        let n_pull = cur.u8()?;
        let n_unpull = cur.u8()?;
        let n_adv = cur.u8()?;
        let n_data = cur.u8()?;

        let mut msg = AppMessage::default();
        for _ in 0..n_pull {
            msg.pulls.push(Pull { gid: cur.u32()? });
        }
        for _ in 0..n_unpull {
            msg.unpulls.push(Unpull { gid: cur.u32()? });
        }
        for _ in 0..n_adv {
            msg.advertises.push(AppAdvertise::decode_record(&mut cur)?);
        }
        for _ in 0..n_data {
            msg.data.push(Data::decode_record(&mut cur)?);
        }
        if cur.remaining() != 0 {
            return Err(WireError::TrailingBytes(cur.remaining()).into());
        }
        Ok(msg)
    }
}

impl AppAdvertise {
    fn encode_record(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.gid.to_be_bytes());
        buf.extend_from_slice(&self.src_ttl.to_be_bytes());
        buf.push(match self.kind {
            AdvertiseKind::Register => 0,
            AdvertiseKind::Deregister => 1,
        });
        let mut flags = 0u8;
        if self.interval.is_some() {
            flags |= FLAG_INTERVAL;
        }
        if self.no_ttl_regen {
            flags |= FLAG_NO_TTL_REGEN;
        }
        buf.push(flags);
        if let Some(interval) = self.interval {
            buf.extend_from_slice(&interval.to_bits().to_be_bytes());
            buf.extend_from_slice(&self.prob_relay.to_be_bytes());
        }
    }

    fn decode_record(cur: &mut Reader<'_>) -> Result<Self, AppError> {
        let gid = cur.u32()?;
        let src_ttl = cur.u32()?;
        let kind = match cur.u8()? {
            0 => AdvertiseKind::Register,
            1 => AdvertiseKind::Deregister,
            other => return Err(AppError::InvalidAdvertiseKind(other)),
        };
        let flags = cur.u8()?;
        let (interval, prob_relay) = if flags & FLAG_INTERVAL != 0 {
            (Some(cur.f64()?), cur.u32()?)
        } else {
            (None, 0)
        };
        Ok(Self {
            gid,
            src_ttl,
            kind,
            interval,
            prob_relay,
            no_ttl_regen: flags & FLAG_NO_TTL_REGEN != 0,
        })
    }
}

/// Prefix an encoded record with its 4-byte big-endian length.
pub fn frame(record: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(4 + record.len());
    framed.extend_from_slice(&(record.len() as u32).to_be_bytes());
    framed.extend_from_slice(record);
    framed
}

/// Read one length-prefixed record off the channel.
///
/// Returns `Ok(None)` on clean end-of-stream at a record boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, AppError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(AppError::BadLength(len));
    }
    let mut record = vec![0u8; len];
    reader.read_exact(&mut record).await?;
    Ok(Some(record))
}

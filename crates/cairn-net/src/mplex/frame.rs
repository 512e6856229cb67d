//! Mplex wire format.
//!
//! Each frame is `varint(header) || varint(length) || payload` with
//! `header = channel_id << 3 | tag`. Directional tags name the sender's
//! role relative to the channel's creation: the side that opened a channel
//! uses the `*Initiator` variants, the other side the `*Receiver` ones.

use bytes::Bytes;
use thiserror::Error;

use cairn_core::stream::{read_exact, read_uvarint, ByteStream, StreamError};
use cairn_core::varint::{self, VarintError};

/// Largest payload a single frame may carry.
pub const MAX_MSG_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    /// Opens a channel; payload is the channel name.
    NewStream = 0,
    MsgReceiver = 1,
    MsgInitiator = 2,
    CloseReceiver = 3,
    CloseInitiator = 4,
    ResetReceiver = 5,
    ResetInitiator = 6,
}

impl Tag {
    pub fn from_header(value: u64) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Tag::NewStream),
            1 => Ok(Tag::MsgReceiver),
            2 => Ok(Tag::MsgInitiator),
            3 => Ok(Tag::CloseReceiver),
            4 => Ok(Tag::CloseInitiator),
            5 => Ok(Tag::ResetReceiver),
            6 => Ok(Tag::ResetInitiator),
            other => Err(FrameError::InvalidMessageType(other)),
        }
    }

    /// The message tag a side uses when writing on a channel it did or did
    /// not open.
    pub fn msg(opened_locally: bool) -> Self {
        if opened_locally {
            Tag::MsgInitiator
        } else {
            Tag::MsgReceiver
        }
    }

    pub fn close(opened_locally: bool) -> Self {
        if opened_locally {
            Tag::CloseInitiator
        } else {
            Tag::CloseReceiver
        }
    }

    pub fn reset(opened_locally: bool) -> Self {
        if opened_locally {
            Tag::ResetInitiator
        } else {
            Tag::ResetReceiver
        }
    }

    /// True when the sender of this tag is the channel's initiator —
    /// meaning the channel lives in the receiver's remote table.
    pub fn sent_by_initiator(&self) -> bool {
        matches!(
            self,
            Tag::MsgInitiator | Tag::CloseInitiator | Tag::ResetInitiator
        )
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid mplex message type {0}")]
    InvalidMessageType(u64),

    #[error("frame payload of {len} bytes exceeds maximum {max}")]
    MaxSizeExceeded { len: usize, max: usize },

    #[error(transparent)]
    Varint(#[from] VarintError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    pub tag: Tag,
    pub data: Bytes,
}

impl Frame {
    pub fn new(id: u64, tag: Tag, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            tag,
            data: data.into(),
        }
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let header = self.id << 3 | self.tag as u64;
        let mut out = Vec::with_capacity(2 * varint::MAX_LEN + self.data.len());
        varint::put_uvarint(&mut out, header)?;
        varint::put_uvarint(&mut out, self.data.len() as u64)?;
        out.extend_from_slice(&self.data);
        Ok(out)
    }
}

/// Read one frame. `Ok(None)` means the stream ended cleanly before a new
/// frame began; EOF anywhere inside a frame is an error.
pub async fn read_frame<S: ByteStream + ?Sized>(
    io: &S,
    max: usize,
) -> Result<Option<Frame>, FrameError> {
    // First header byte by hand so a clean session end is distinguishable.
    let mut byte = [0u8; 1];
    if io.read_once(&mut byte).await? == 0 {
        return Ok(None);
    }
    let mut header_bytes = vec![byte[0]];
    while header_bytes.last().map(|b| b & 0x80 != 0).unwrap_or(false) {
        if header_bytes.len() >= varint::MAX_LEN {
            return Err(VarintError::Overflow.into());
        }
        read_exact(io, &mut byte).await?;
        header_bytes.push(byte[0]);
    }
    let (header, _) = varint::get_uvarint(&header_bytes)?;
    let tag = Tag::from_header(header & 0x07)?;
    let id = header >> 3;

    let len = read_uvarint(io).await? as usize;
    if len > max {
        return Err(FrameError::MaxSizeExceeded { len, max });
    }
    let mut data = vec![0u8; len];
    read_exact(io, &mut data).await?;
    Ok(Some(Frame::new(id, tag, data)))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

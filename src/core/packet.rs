//! TCP frame format.
//!
//! ```text
//! [Length(4, LE)] [Magic "VT01"(4)] [Body(Length)]
//! ```
//!
//! `Length` counts only the body. The body is one serialized [`Envelope`](super::envelope::Envelope).

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{constants, ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Magic bytes following the length prefix
pub const MAGIC_BYTES: [u8; 4] = *b"VT01";

/// Length prefix plus magic
pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub payload: Bytes,
}

impl Packet {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Append the framed packet to `dst`
    pub fn write_to(&self, dst: &mut BytesMut) -> Result<()> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizedPacket(self.payload.len()));
        }
        dst.reserve(FRAME_HEADER_LEN + self.payload.len());
        dst.put_u32_le(self.payload.len() as u32);
        dst.put_slice(&MAGIC_BYTES);
        dst.put_slice(&self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a complete frame held in `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let body_len = parse_header(bytes)?.ok_or(ProtocolError::InvalidEnvelope(
            constants::ERR_SHORT_HEADER,
        ))?;
        let end = FRAME_HEADER_LEN + body_len;
        if bytes.len() < end {
            return Err(ProtocolError::InvalidEnvelope(constants::ERR_SHORT_HEADER));
        }
        Ok(Self::new(Bytes::copy_from_slice(&bytes[FRAME_HEADER_LEN..end])))
    }
}

/// Validate the frame header and return the body length.
///
/// `Ok(None)` means more bytes are needed before the header can be read.
pub(crate) fn parse_header(bytes: &[u8]) -> Result<Option<usize>> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if bytes[4..8] != MAGIC_BYTES {
        return Err(ProtocolError::InvalidEnvelope(constants::ERR_INVALID_MAGIC));
    }
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::OversizedPacket(len));
    }
    Ok(Some(len))
}

//! Message envelope: the routing header that wraps every payload.
//!
//! ```text
//! [Opcode(4)] [AppId(4)] [SourceJob(8)] [TargetJob(8)] [Payload(N)]
//! ```
//!
//! All integers are little-endian. A job id of `u64::MAX` means "absent".

use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Integer identifying a message's semantic type
pub type Opcode = u32;

/// Size of the fixed envelope header in bytes
pub const HEADER_LEN: usize = 24;

const NO_JOB: u64 = u64::MAX;

/// Client-generated correlation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl JobId {
    fn from_wire(raw: u64) -> Option<Self> {
        (raw != NO_JOB).then_some(Self(raw))
    }

    fn to_wire(id: Option<Self>) -> u64 {
        id.map_or(NO_JOB, |j| j.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Routing identifier carried next to the opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AppId(pub u32);

impl AppId {
    /// The platform itself, used when no application is targeted
    pub const PLATFORM: AppId = AppId(0);
}

/// Routing fields of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub opcode: Opcode,
    pub app_id: AppId,
    pub source_job_id: Option<JobId>,
    pub target_job_id: Option<JobId>,
}

impl MessageHeader {
    pub fn new(opcode: Opcode, app_id: AppId) -> Self {
        Self {
            opcode,
            app_id,
            source_job_id: None,
            target_job_id: None,
        }
    }

    pub fn with_source_job(mut self, job: JobId) -> Self {
        self.source_job_id = Some(job);
        self
    }

    pub fn with_target_job(mut self, job: Option<JobId>) -> Self {
        self.target_job_id = job;
        self
    }
}

/// Header plus opaque payload, as decoded from one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(header: MessageHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Serialize header and payload into one frame body
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32_le(self.header.opcode);
        buf.put_u32_le(self.header.app_id.0);
        buf.put_u64_le(JobId::to_wire(self.header.source_job_id));
        buf.put_u64_le(JobId::to_wire(self.header.target_job_id));
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a frame body. The payload shares the input buffer.
    pub fn from_bytes(frame: &Bytes) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidEnvelope(constants::ERR_SHORT_HEADER));
        }

        let mut head = &frame[..HEADER_LEN];
        let opcode = head.get_u32_le();
        let app_id = AppId(head.get_u32_le());
        let source_job_id = JobId::from_wire(head.get_u64_le());
        let target_job_id = JobId::from_wire(head.get_u64_le());

        Ok(Self {
            header: MessageHeader {
                opcode,
                app_id,
                source_job_id,
                target_job_id,
            },
            payload: frame.slice(HEADER_LEN..),
        })
    }
}

//! # Core Protocol Components
//!
//! Low-level framing and the message envelope.
//!
//! ## Components
//! - **Envelope**: routing header (opcode, app id, job ids) around an opaque payload
//! - **Packet**: TCP frame with length prefix and magic bytes
//! - **Codec**: Tokio codec for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! [Length(4)] [Magic(4)] [Opcode(4)] [AppId(4)] [SourceJob(8)] [TargetJob(8)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum frame size: 16MB (prevents memory exhaustion)
//! - Length validation before allocation

pub mod codec;
pub mod envelope;
pub mod packet;

//! # Error Types
//!
//! Error handling for the session protocol engine.
//!
//! This module defines every error variant that can surface from the client core,
//! from low-level I/O failures up to protocol faults raised by message handlers.
//!
//! ## Error Categories
//! - **Protocol faults**: malformed envelopes, machine-auth size mismatches
//! - **Connection faults**: broken/lost/closed links, pending requests failed with `ConnectionLost`
//! - **Configuration errors**: conflicting registry entries, invalid settings
//! - **Collaborator errors**: credential storage failures
//!
//! Result-coded failures (a rejected logon, a full disk) are *not* errors here:
//! they travel as state transitions or as status fields in replies.
//!
//! ## Example Usage
//! ```rust
//! use session_protocol::error::{ProtocolError, Result};
//!
//! fn check_chunk(declared: u32, actual: usize) -> Result<()> {
//!     if declared as usize != actual {
//!         return Err(ProtocolError::ProtocolFault(format!(
//!             "declared {declared} bytes, received {actual}"
//!         )));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_chunk(4, 4).is_ok());
//! assert!(check_chunk(4, 3).is_err());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Lock errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
    pub const ERR_EVENT_REGISTRY_LOCK: &str = "Failed to acquire event bus registry lock";
    pub const ERR_EVENT_CONSUMER_SPAWN: &str = "Failed to spawn event bus consumer thread";

    /// Envelope validation errors
    pub const ERR_SHORT_HEADER: &str = "Envelope shorter than header";
    pub const ERR_INVALID_MAGIC: &str = "Invalid frame magic";

    /// Connection errors
    pub const ERR_NOT_CONNECTED: &str = "No active connection";
    pub const ERR_NO_RUNTIME: &str = "No tokio runtime available";

    /// Machine-auth errors
    pub const ERR_CHUNK_SIZE_MISMATCH: &str = "assert failed: bytes.len() != bytes_to_write";
    pub const ERR_SENTRY_HASH_MISSING: &str = "Storage reported success but no sentry hash is available";

    /// Datagram errors
    pub const ERR_DATAGRAM_CHECKSUM: &str = "Datagram checksum mismatch";
    pub const ERR_DATAGRAM_TRUNCATED: &str = "Datagram shorter than its declared length";
    pub const ERR_DATAGRAM_TRAILING: &str = "Datagram has bytes after its checksum";
}

/// Failure reported by the credential/storage collaborator.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Storage full: {0}")]
    Full(String),

    #[error("Storage error: {0}")]
    Other(String),
}

// ProtocolError is the primary error type for all client operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(&'static str),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Unknown opcode: {0}")]
    UnknownOpcode(u32),

    #[error("Registry conflict on opcode {opcode}: {existing} already registered, refusing {incoming}")]
    RegistryConflict {
        opcode: u32,
        existing: &'static str,
        incoming: &'static str,
    },

    #[error("Protocol fault: {0}")]
    ProtocolFault(String),

    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Not connected")]
    NotConnected,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Event bus is shut down")]
    EventBusClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

//! # Transport Layer
//!
//! The connection never touches sockets directly. A [`Transport`] opens a
//! [`TransportLink`]: an outbound sender for frame bodies and an inbound
//! stream of [`TransportEvent`]s (state transitions and received frames).
//!
//! ## Implementations
//! - **tcp**: length-prefixed frames over `tokio::net::TcpStream`
//! - **memory**: in-process link driven by a test or simulator
//! - **datagram**: auxiliary UDP channel with CRC-checked packets

use crate::error::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

pub mod datagram;
pub mod memory;
pub mod tcp;

/// Transport-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Established,
    /// The link is unusable; the connection disconnects explicitly
    Broken,
    ConnectionFailed,
    Closed,
    Lost,
}

impl ConnectionState {
    /// States after which the link is discarded
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectionFailed | ConnectionState::Closed | ConnectionState::Lost
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::Broken => "BROKEN",
            ConnectionState::ConnectionFailed => "CONNECTION_FAILED",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Lost => "LOST",
        };
        f.write_str(name)
    }
}

/// Something the transport reports to the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    State(ConnectionState),
    Frame(Bytes),
}

/// One opened link
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<Bytes>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens links to a remote endpoint.
///
/// Implementations report `Connecting` first, then `Established` or
/// `ConnectionFailed`, and later `Closed`, `Lost` or `Broken`. Dropping the
/// link's receiver or closing its outbound sender asks the transport to tear
/// the link down.
pub trait Transport: Send + Sync {
    fn open(&self, addr: &str) -> Result<TransportLink>;
}

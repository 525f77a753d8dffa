//! In-process transport.
//!
//! Each `open` creates a fresh channel pair and parks the far end as a
//! [`MemoryPeer`], which a test or simulator uses to play the server.

use crate::core::envelope::{Envelope, MessageHeader};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::messages::ClientMessage;
use crate::transport::{ConnectionState, Transport, TransportEvent, TransportLink};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Server side of an in-memory link
pub struct MemoryPeer {
    pub addr: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryPeer {
    /// Report a transport state transition to the client
    pub fn set_state(&self, state: ConnectionState) -> Result<()> {
        self.push(TransportEvent::State(state))
    }

    /// Deliver a raw frame body to the client
    pub fn deliver_frame(&self, frame: Bytes) -> Result<()> {
        self.push(TransportEvent::Frame(frame))
    }

    /// Encode and deliver `msg` with the given routing header
    pub fn deliver<T: ClientMessage>(&self, header: MessageHeader, msg: &T) -> Result<()> {
        let env = Envelope::new(header, msg.encode()?);
        self.deliver_frame(env.to_bytes())
    }

    /// Next frame the client sent, if any
    pub fn try_recv(&mut self) -> Option<Envelope> {
        let frame = self.outbound.try_recv().ok()?;
        Envelope::from_bytes(&frame).ok()
    }

    /// Wait for the next frame the client sends
    pub async fn recv(&mut self) -> Option<Envelope> {
        let frame = self.outbound.recv().await?;
        Envelope::from_bytes(&frame).ok()
    }

    /// All frames sent so far
    pub fn drain_sent(&mut self) -> Vec<Envelope> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Whether the client side dropped its link
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    fn push(&self, event: TransportEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| ProtocolError::Custom(constants::ERR_NOT_CONNECTED.into()))
    }
}

/// Transport whose links are driven by [`MemoryPeer`]s
#[derive(Clone, Default)]
pub struct MemoryTransport {
    peers: Arc<Mutex<VecDeque<MemoryPeer>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the peer of the oldest link not yet claimed
    pub fn take_peer(&self) -> Option<MemoryPeer> {
        self.peers.lock().ok()?.pop_front()
    }
}

impl Transport for MemoryTransport {
    fn open(&self, addr: &str) -> Result<TransportLink> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        self.peers
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?
            .push_back(MemoryPeer {
                addr: addr.to_string(),
                events: ev_tx,
                outbound: out_rx,
            });
        Ok(TransportLink {
            outbound: out_tx,
            events: ev_rx,
        })
    }
}

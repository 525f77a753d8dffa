use crate::core::envelope::{Envelope, MessageHeader};
use crate::error::{ProtocolError, Result};
use crate::protocol::messages::ClientMessage;
use crate::utils::metrics::Metrics;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Cloneable handle that writes envelopes onto the current transport link.
///
/// Sending never blocks, so handlers can reply from the delivery path.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Bytes>,
    metrics: Arc<Metrics>,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>, metrics: Arc<Metrics>) -> Self {
        Self { tx, metrics }
    }

    pub fn send<T: ClientMessage>(&self, header: MessageHeader, msg: &T) -> Result<()> {
        let payload = msg.encode()?;
        self.send_envelope(&Envelope::new(header, payload))
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.send_frame(envelope.to_bytes())
    }

    /// Push an already-encoded frame body
    pub fn send_frame(&self, frame: Bytes) -> Result<()> {
        let len = frame.len() as u64;
        self.tx.send(frame).map_err(|_| ProtocolError::NotConnected)?;
        self.metrics.frame_sent(len);
        trace!(bytes = len, "Frame queued");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

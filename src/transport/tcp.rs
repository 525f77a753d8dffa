use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::{ConnectionState, Transport, TransportEvent, TransportLink};
use crate::utils::timeout::{with_timeout_error, DEFAULT_TIMEOUT};
use bytes::Bytes;

/// TCP transport framing envelopes with [`PacketCodec`]
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Transport for TcpTransport {
    fn open(&self, addr: &str) -> Result<TransportLink> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| ProtocolError::Runtime(constants::ERR_NO_RUNTIME.into()))?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        handle.spawn(run_link(addr.to_string(), self.connect_timeout, out_rx, ev_tx));

        Ok(TransportLink {
            outbound: out_tx,
            events: ev_rx,
        })
    }
}

/// Drive one TCP link until either side ends it
#[instrument(skip(outbound, events))]
async fn run_link(
    addr: String,
    connect_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let report = |state| {
        let _ = events.send(TransportEvent::State(state));
    };

    report(ConnectionState::Connecting);

    let stream = match with_timeout_error(
        async { Ok(TcpStream::connect(&addr).await?) },
        connect_timeout,
    )
    .await
    {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Connection attempt failed");
            report(ConnectionState::ConnectionFailed);
            return;
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Could not disable Nagle");
    }

    let mut framed = Framed::new(stream, PacketCodec);
    info!("Connection established");
    report(ConnectionState::Established);

    loop {
        tokio::select! {
            inbound = framed.next() => match inbound {
                Some(Ok(packet)) => {
                    if events.send(TransportEvent::Frame(packet.payload)).is_err() {
                        debug!("Client dropped the link");
                        break;
                    }
                }
                Some(Err(ProtocolError::Io(e))) => {
                    warn!(error = %e, "Read failed");
                    report(ConnectionState::Lost);
                    break;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Undecodable frame, link is broken");
                    report(ConnectionState::Broken);
                    break;
                }
                None => {
                    debug!("Remote closed the connection");
                    report(ConnectionState::Closed);
                    break;
                }
            },
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = framed.send(Packet::new(frame)).await {
                        warn!(error = %e, "Write failed");
                        report(ConnectionState::Lost);
                        break;
                    }
                }
                None => {
                    debug!("Link released by client, closing socket");
                    let _ = framed.close().await;
                    break;
                }
            }
        }
    }
}

//! Auxiliary datagram channel.
//!
//! ```text
//! [Flags(1)] [Sequence(4)] [Length(2)] [Payload(N)] [Checksum(2|4)]
//! ```
//!
//! The checksum covers everything before it. Payloads no longer than the
//! configured short limit carry a 16-bit CRC (flag bit 0 set), longer ones a
//! full CRC32. Packets that fail validation are dropped and counted.

use crate::config::DatagramConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::events::{EmitterId, EventBus};
use crate::utils::crc::{crc16, crc32};
use crate::utils::metrics::Metrics;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const FLAG_SHORT_CHECKSUM: u8 = 0x01;
const DATAGRAM_HEADER_LEN: usize = 7;
const RECV_BUFFER_SIZE: usize = 2048;

/// One checksummed datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramPacket {
    pub sequence: u32,
    pub payload: Bytes,
}

impl DatagramPacket {
    pub fn new(sequence: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            payload: payload.into(),
        }
    }

    pub fn encode(&self, short_checksum_limit: usize) -> Result<Bytes> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| ProtocolError::OversizedPacket(self.payload.len()))?;
        let short = self.payload.len() <= short_checksum_limit;

        let mut buf = BytesMut::with_capacity(DATAGRAM_HEADER_LEN + self.payload.len() + 4);
        buf.put_u8(if short { FLAG_SHORT_CHECKSUM } else { 0 });
        buf.put_u32_le(self.sequence);
        buf.put_u16_le(len);
        buf.extend_from_slice(&self.payload);
        if short {
            let sum = crc16(&buf);
            buf.put_u16_le(sum);
        } else {
            let sum = crc32(&buf);
            buf.put_u32_le(sum);
        }
        Ok(buf.freeze())
    }

    pub fn decode(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < DATAGRAM_HEADER_LEN {
            return Err(ProtocolError::InvalidEnvelope(constants::ERR_DATAGRAM_TRUNCATED));
        }

        let mut head = &datagram[..DATAGRAM_HEADER_LEN];
        let flags = head.get_u8();
        let sequence = head.get_u32_le();
        let len = head.get_u16_le() as usize;
        let short = flags & FLAG_SHORT_CHECKSUM != 0;

        let body_end = DATAGRAM_HEADER_LEN + len;
        let checksum_len = if short { 2 } else { 4 };
        let expected_len = body_end + checksum_len;
        if datagram.len() < expected_len {
            return Err(ProtocolError::InvalidEnvelope(constants::ERR_DATAGRAM_TRUNCATED));
        }
        if datagram.len() > expected_len {
            return Err(ProtocolError::InvalidEnvelope(constants::ERR_DATAGRAM_TRAILING));
        }

        let covered = &datagram[..body_end];
        let mut trailer = &datagram[body_end..body_end + checksum_len];
        let valid = if short {
            trailer.get_u16_le() == crc16(covered)
        } else {
            trailer.get_u32_le() == crc32(covered)
        };
        if !valid {
            return Err(ProtocolError::InvalidEnvelope(constants::ERR_DATAGRAM_CHECKSUM));
        }

        Ok(Self {
            sequence,
            payload: Bytes::copy_from_slice(&datagram[DATAGRAM_HEADER_LEN..body_end]),
        })
    }
}

/// Bus event for every validated inbound datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramReceived {
    pub sequence: u32,
    pub payload: Bytes,
}

struct ActiveChannel {
    socket: Arc<UdpSocket>,
    recv_task: JoinHandle<()>,
    next_sequence: u32,
}

impl Drop for ActiveChannel {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

/// UDP side channel, connected and disconnected together with the client
pub struct DatagramChannel {
    config: DatagramConfig,
    bus: EventBus,
    emitter: EmitterId,
    metrics: Arc<Metrics>,
    active: Option<ActiveChannel>,
}

impl DatagramChannel {
    /// Validated packets are published on `bus` as [`DatagramReceived`] from `emitter`
    pub fn new(config: DatagramConfig, bus: EventBus, emitter: EmitterId, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            bus,
            emitter,
            metrics,
            active: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    /// Local address of the bound socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref()?.socket.local_addr().ok()
    }

    /// Bind a local socket and connect it to the configured address.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&mut self) -> Result<()> {
        self.disconnect();

        let remote: SocketAddr = self
            .config
            .address
            .parse()
            .map_err(|e| ProtocolError::ConfigError(format!("datagram address: {e}")))?;
        let local: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        }
        .parse()
        .map_err(|e| ProtocolError::ConfigError(format!("datagram bind address: {e}")))?;

        let std_socket = std::net::UdpSocket::bind(local)?;
        std_socket.set_nonblocking(true)?;
        std_socket.connect(remote)?;

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| ProtocolError::Runtime(constants::ERR_NO_RUNTIME.into()))?;
        let socket = {
            let _guard = handle.enter();
            Arc::new(UdpSocket::from_std(std_socket)?)
        };

        let recv_task = handle.spawn(receive_loop(
            Arc::clone(&socket),
            self.bus.clone(),
            self.emitter,
            Arc::clone(&self.metrics),
        ));

        info!(%remote, "Datagram channel connected");
        self.active = Some(ActiveChannel {
            socket,
            recv_task,
            next_sequence: rand::random::<u32>(),
        });
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.active.take().is_some() {
            info!("Datagram channel disconnected");
        }
    }

    /// Send one payload; returns the sequence number it was given
    pub fn send(&mut self, payload: impl Into<Bytes>) -> Result<u32> {
        let limit = self.config.short_checksum_limit;
        let active = self.active.as_mut().ok_or(ProtocolError::NotConnected)?;

        let sequence = active.next_sequence;
        active.next_sequence = active.next_sequence.wrapping_add(1);

        let datagram = DatagramPacket::new(sequence, payload).encode(limit)?;
        active.socket.try_send(&datagram)?;
        trace!(sequence, bytes = datagram.len(), "Datagram sent");
        Ok(sequence)
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, bus: EventBus, emitter: EmitterId, metrics: Arc<Metrics>) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => match DatagramPacket::decode(&buf[..len]) {
                Ok(packet) => {
                    bus.emit(
                        emitter,
                        DatagramReceived {
                            sequence: packet.sequence,
                            payload: packet.payload,
                        },
                    );
                }
                Err(e) => {
                    metrics.datagram_rejected();
                    debug!(error = %e, bytes = len, "Dropping invalid datagram");
                }
            },
            Err(e) => {
                warn!(error = %e, "Datagram receive failed");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

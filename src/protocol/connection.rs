//! # Connection
//!
//! Owns the transport link, the merged opcode registry, the pending-request
//! set and the heartbeat task.
//!
//! ## State machine
//! ```text
//! DISCONNECTED -> CONNECTING -> ESTABLISHED
//!                     |             |
//!                     v             v
//!          CONNECTION_FAILED   BROKEN -> (explicit disconnect) -> CLOSED
//!                               CLOSED | LOST
//! ```
//! Transitions are driven by transport events only, and every change is
//! published on the event bus as [`ConnectionStateChanged`]. Entering a
//! terminal state discards the link: pending requests fail with
//! `ConnectionLost`, the heartbeat stops, and nothing more is read from it.
//! A later `connect` opens a fresh link.

use crate::core::envelope::{AppId, Envelope, MessageHeader};
use crate::error::{constants, ProtocolError, Result};
use crate::events::{EmitterId, EventBus};
use crate::protocol::correlator::{Correlator, JobIdSequence, PendingResponse};
use crate::protocol::messages::{ClientHeartBeat, ClientMessage};
use crate::protocol::outbound::Outbound;
use crate::protocol::registry::{ActiveRegistry, DecodedMessage, MessageRegistry};
use crate::transport::{ConnectionState, Transport, TransportEvent};
use crate::utils::metrics::Metrics;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, trace, warn};

/// Published on the bus for every connection state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateChanged {
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

struct Heartbeat {
    interval: Duration,
    task: JoinHandle<()>,
}

/// Everything bound to one transport link
struct ActiveLink {
    outbound: Outbound,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    correlator: Correlator,
    heartbeat: Option<Heartbeat>,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.task.abort();
        }
        // The correlator fails whatever is still pending when it drops.
    }
}

pub struct Connection {
    transport: Arc<dyn Transport>,
    registry: ActiveRegistry,
    link: Option<ActiveLink>,
    state: ConnectionState,
    job_ids: JobIdSequence,
    default_app: AppId,
    bus: EventBus,
    emitter: EmitterId,
    metrics: Arc<Metrics>,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, bus: EventBus, metrics: Arc<Metrics>, default_app: AppId) -> Self {
        let emitter = bus.emitter();
        Self {
            transport,
            registry: ActiveRegistry::new(),
            link: None,
            state: ConnectionState::Disconnected,
            job_ids: JobIdSequence::new(),
            default_app,
            bus,
            emitter,
            metrics,
        }
    }

    /// Identity under which state changes are published
    pub fn emitter(&self) -> EmitterId {
        self.emitter
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// A link exists and the transport reported it established
    pub fn is_alive(&self) -> bool {
        self.link.is_some() && self.state == ConnectionState::Established
    }

    pub fn registry(&self) -> &ActiveRegistry {
        &self.registry
    }

    pub fn add_registry(&mut self, registry: &MessageRegistry) -> Result<()> {
        self.registry.add(registry)
    }

    pub fn remove_registry(&mut self, registry: &MessageRegistry) {
        self.registry.remove(registry)
    }

    /// Open a fresh link to `addr`, discarding any current one first
    #[instrument(skip(self))]
    pub fn connect(&mut self, addr: &str) -> Result<()> {
        self.disconnect();

        let link = self.transport.open(addr)?;
        self.metrics.connection_opened();
        self.link = Some(ActiveLink {
            outbound: Outbound::new(link.outbound, Arc::clone(&self.metrics)),
            events: link.events,
            correlator: Correlator::new(Arc::clone(&self.metrics)),
            heartbeat: None,
        });
        info!(addr, "Connection opened");
        Ok(())
    }

    /// Tear the link down and publish `CLOSED`.
    ///
    /// Returns `false` when there was no link.
    #[instrument(skip(self))]
    pub fn disconnect(&mut self) -> bool {
        let Some(link) = self.link.take() else {
            return false;
        };
        let failed = link.correlator.len();
        drop(link);
        debug!(failed_requests = failed, "Link released");
        self.set_state(ConnectionState::Closed);
        true
    }

    /// Apply a transport-reported state.
    ///
    /// Returns every transition actually made, in order: `BROKEN` expands to
    /// `[BROKEN, CLOSED]`, a repeat of the current state to nothing.
    pub fn handle_state(&mut self, state: ConnectionState) -> Vec<ConnectionState> {
        if state == self.state {
            return Vec::new();
        }

        match state {
            ConnectionState::Broken => {
                self.set_state(ConnectionState::Broken);
                if self.disconnect() {
                    vec![ConnectionState::Broken, ConnectionState::Closed]
                } else {
                    vec![ConnectionState::Broken]
                }
            }
            terminal if terminal.is_terminal() => {
                if let Some(link) = self.link.take() {
                    self.metrics.connection_lost();
                    drop(link);
                }
                self.set_state(terminal);
                vec![terminal]
            }
            other => {
                self.set_state(other);
                vec![other]
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if state == self.state {
            return;
        }
        let previous = std::mem::replace(&mut self.state, state);
        debug!(%previous, current = %state, "Connection state changed");
        self.bus.emit(
            self.emitter,
            ConnectionStateChanged {
                previous,
                current: state,
            },
        );
    }

    /// Wait for the next transport event on the current link.
    ///
    /// `None` when there is no link or the transport has gone away.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.link.as_mut()?.events.recv().await
    }

    /// Next transport event if one is already queued
    pub fn try_next_event(&mut self) -> Option<TransportEvent> {
        self.link.as_mut()?.events.try_recv().ok()
    }

    /// Decode an inbound frame and offer it to the correlator.
    ///
    /// Returns the message when it still needs dispatching: it was not a
    /// response to a pending request. Unknown opcodes and undecodable frames
    /// are dropped here.
    pub fn receive(&mut self, frame: Bytes) -> Option<DecodedMessage> {
        self.metrics.frame_received(frame.len() as u64);

        let envelope = match Envelope::from_bytes(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.decode_failure();
                warn!(error = %e, bytes = frame.len(), "Dropping malformed envelope");
                return None;
            }
        };

        let msg = match self.registry.decode(&envelope) {
            Ok(msg) => msg,
            Err(ProtocolError::UnknownOpcode(opcode)) => {
                self.metrics.unknown_opcode();
                debug!(opcode, "Dropping message with unregistered opcode");
                return None;
            }
            Err(e) => {
                self.metrics.decode_failure();
                warn!(opcode = envelope.header.opcode, error = %e, "Dropping undecodable payload");
                return None;
            }
        };

        trace!(opcode = msg.opcode(), message = msg.type_name(), "Message received");
        match self.link.as_mut() {
            Some(link) => link.correlator.complete(msg),
            None => Some(msg),
        }
    }

    /// Outbound handle for the current link
    pub fn outbound(&self) -> Option<Outbound> {
        self.link.as_ref().map(|link| link.outbound.clone())
    }

    pub fn send<T: ClientMessage>(&self, msg: &T) -> Result<()> {
        self.send_to_app(self.default_app, msg)
    }

    pub fn send_to_app<T: ClientMessage>(&self, app: AppId, msg: &T) -> Result<()> {
        let link = self.link.as_ref().ok_or(ProtocolError::NotConnected)?;
        link.outbound.send(MessageHeader::new(T::OPCODE, app), msg)
    }

    /// Send `msg` under a fresh source job id and track the `Resp` it expects
    pub fn request<Req, Resp>(&mut self, msg: &Req) -> Result<PendingResponse<Resp>>
    where
        Req: ClientMessage,
        Resp: ClientMessage + Clone,
    {
        self.request_to_app(self.default_app, msg)
    }

    pub fn request_to_app<Req, Resp>(&mut self, app: AppId, msg: &Req) -> Result<PendingResponse<Resp>>
    where
        Req: ClientMessage,
        Resp: ClientMessage + Clone,
    {
        let link = self.link.as_mut().ok_or(ProtocolError::NotConnected)?;
        let job = self.job_ids.next_id();
        let header = MessageHeader::new(Req::OPCODE, app).with_source_job(job);

        let pending = link.correlator.track::<Resp>(job);
        if let Err(e) = link.outbound.send(header, msg) {
            link.correlator.forget(job);
            return Err(e);
        }
        debug!(job_id = %job, opcode = Req::OPCODE, "Request sent");
        Ok(pending)
    }

    /// Requests still waiting on the current link
    pub fn pending_requests(&self) -> usize {
        self.link.as_ref().map_or(0, |link| link.correlator.len())
    }

    /// Arm the keep-alive at `interval`, replacing any running one.
    ///
    /// The first heartbeat goes out one interval after arming.
    pub fn enable_heartbeat(&mut self, interval: Duration) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| ProtocolError::Runtime(constants::ERR_NO_RUNTIME.into()))?;
        let link = self.link.as_mut().ok_or(ProtocolError::NotConnected)?;
        if interval.is_zero() {
            return Err(ProtocolError::ConfigError("heartbeat interval must be non-zero".into()));
        }

        let frame = Envelope::new(
            MessageHeader::new(ClientHeartBeat::OPCODE, self.default_app),
            ClientHeartBeat::default().encode()?,
        )
        .to_bytes();
        let outbound = link.outbound.clone();
        let metrics = Arc::clone(&self.metrics);

        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if outbound.send_frame(frame.clone()).is_err() {
                    debug!("Heartbeat stopped: link closed");
                    break;
                }
                metrics.heartbeat_sent();
                trace!("Heartbeat sent");
            }
        });

        if let Some(previous) = link.heartbeat.replace(Heartbeat { interval, task }) {
            previous.task.abort();
        }
        info!(interval_secs = interval.as_secs(), "Heartbeat armed");
        Ok(())
    }

    pub fn disable_heartbeat(&mut self) {
        if let Some(heartbeat) = self.link.as_mut().and_then(|link| link.heartbeat.take()) {
            heartbeat.task.abort();
            debug!("Heartbeat disarmed");
        }
    }

    /// Interval of the running heartbeat, if armed
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.link.as_ref()?.heartbeat.as_ref().map(|h| h.interval)
    }
}

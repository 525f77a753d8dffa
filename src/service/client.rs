//! # Client
//!
//! Orchestrates logon, the session state machine, the machine-auth handshake
//! and the module registry on top of one [`Connection`].
//!
//! ## Driving the client
//! The client does no I/O of its own. Transport events are pulled from the
//! connection and applied one at a time, either by awaiting [`Client::run`] /
//! [`Client::step`] or by calling [`Client::process_pending`] from a custom
//! loop. Bus events are delivered separately: start the consumer with
//! `client.bus().start()` or call `client.bus().drain()`.
//!
//! ## Inbound path
//! decode (merged registry) -> correlator -> self-handled dispatcher -> modules
//! in registration order. Every step is isolated: a failing or panicking
//! handler is logged and counted, and delivery continues.

use crate::config::SessionConfig;
use crate::core::envelope::AppId;
use crate::error::{ProtocolError, Result};
use crate::events::{EmitterId, EventBus};
use crate::protocol::connection::{Connection, ConnectionStateChanged};
use crate::protocol::correlator::PendingResponse;
use crate::protocol::dispatcher::{run_guarded, MessageContext, MessageDispatcher};
use crate::protocol::machine_auth::{accept_login_key, handle_update_machine_auth};
use crate::protocol::messages::{
    ClientAccountInfo, ClientGamesPlayed, ClientHeartBeat, ClientLogon, ClientLogonResponse,
    ClientMessage, ClientNewLoginKey, ClientNewLoginKeyAccepted, ClientPlayingSessionState, ClientUpdateMachineAuth,
    ClientUpdateMachineAuthResponse, GamePlayed, ResultCode, OS_TYPE_UNKNOWN,
};
use crate::protocol::registry::{DecodedMessage, MessageRegistry};
use crate::service::credentials::Credentials;
use crate::service::module::{ClientModule, ModuleContext, ModuleSet, RegisteredModule};
use crate::service::presence::{PersonaState, PresenceModule};
use crate::service::session::{ClientState, Session};
use crate::transport::datagram::DatagramChannel;
use crate::transport::tcp::TcpTransport;
use crate::transport::{ConnectionState, Transport, TransportEvent};
use crate::utils::metrics::{Metrics, Timer};
use std::any::TypeId;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Opcodes the client itself needs decoded
pub fn baseline_registry() -> Result<MessageRegistry> {
    MessageRegistry::new()
        .with::<ClientLogon>()?
        .with::<ClientLogonResponse>()?
        .with::<ClientUpdateMachineAuth>()?
        .with::<ClientUpdateMachineAuthResponse>()?
        .with::<ClientAccountInfo>()?
        .with::<ClientNewLoginKey>()?
        .with::<ClientNewLoginKeyAccepted>()?
        .with::<ClientHeartBeat>()?
        .with::<ClientPlayingSessionState>()?
        .with::<ClientGamesPlayed>()
}

/// Work a self-handler queues for after the self dispatch
enum Deferred {
    SetPresence(PersonaState),
}

/// Client state the self-handled dispatcher operates on
struct ClientCore {
    config: SessionConfig,
    connection: Connection,
    credentials: Arc<dyn Credentials>,
    session: Session,
    bus: EventBus,
    emitter: EmitterId,
    metrics: Arc<Metrics>,
    datagram: Option<DatagramChannel>,
    deferred: Vec<Deferred>,
}

impl ClientCore {
    fn set_client_state(&mut self, next: ClientState) -> bool {
        let leaving_logged_on = self.session.client_state == ClientState::LoggedOn;
        let Some(change) = self.session.transition(next) else {
            return false;
        };
        if leaving_logged_on {
            self.connection.disable_heartbeat();
        }
        self.bus.emit(self.emitter, change);
        true
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        self.session.connection_state = state;
        match state {
            ConnectionState::Connecting => {
                self.set_client_state(ClientState::Connecting);
            }
            ConnectionState::Established => self.perform_logon(),
            ConnectionState::Broken => {
                // The connection has already disconnected itself
                if let Some(datagram) = self.datagram.as_mut() {
                    datagram.disconnect();
                }
            }
            ConnectionState::ConnectionFailed | ConnectionState::Closed => {
                self.set_client_state(ClientState::LoggedOff);
            }
            ConnectionState::Lost => {
                self.set_client_state(ClientState::Lost);
            }
            ConnectionState::Disconnected => {}
        }
    }

    #[instrument(skip(self))]
    fn perform_logon(&mut self) {
        let account_name = self.credentials.account_name();
        if !self.set_client_state(ClientState::LoggingIn) {
            warn!(account = %account_name, "Link established outside a connect attempt, not logging on");
            return;
        }
        info!(account = %account_name, "Performing logon");

        let sentry_hash = self.credentials.sentry_hash();
        let logon = ClientLogon {
            protocol_version: self.config.client.protocol_version,
            account_name,
            password: self.credentials.password(),
            sentry_file_result: if sentry_hash.is_some() {
                ResultCode::OK
            } else {
                ResultCode::FILE_NOT_FOUND
            },
            sentry_hash,
        };
        if let Err(e) = self.connection.send(&logon) {
            warn!(error = %e, "Failed to send logon");
        }
    }

    fn on_logon_response(&mut self, _ctx: &MessageContext, msg: &ClientLogonResponse) -> Result<()> {
        info!(result = %msg.result, "Logon response received");
        if self.session.client_state != ClientState::LoggingIn {
            warn!(state = %self.session.client_state, "Ignoring logon response outside logon");
            return Ok(());
        }

        if !msg.result.is_ok() {
            error!(result = %msg.result, "Logon failed");
            self.set_client_state(ClientState::LogonFailed);
            return Ok(());
        }

        let interval = if msg.heartbeat_seconds > 0 {
            Duration::from_secs(u64::from(msg.heartbeat_seconds))
        } else {
            self.config.client.default_heartbeat_interval
        };
        match self.connection.enable_heartbeat(interval) {
            Ok(()) => self.session.heartbeat_interval = Some(interval),
            Err(e) => warn!(error = %e, "Could not arm heartbeat"),
        }
        self.set_client_state(ClientState::LoggedOn);
        self.session.public_ip = msg.public_ip.map(Ipv4Addr::from);
        info!(public_ip = ?self.session.public_ip, "Logged on");
        self.deferred.push(Deferred::SetPresence(PersonaState::Online));
        Ok(())
    }

    fn on_update_machine_auth(&mut self, ctx: &MessageContext, msg: &ClientUpdateMachineAuth) -> Result<()> {
        let reply = handle_update_machine_auth(self.credentials.as_ref(), msg)?;
        ctx.reply(&reply)
    }

    fn on_new_login_key(&mut self, ctx: &MessageContext, msg: &ClientNewLoginKey) -> Result<()> {
        ctx.reply(&accept_login_key(msg))
    }

    fn on_account_info(&mut self, _ctx: &MessageContext, msg: &ClientAccountInfo) -> Result<()> {
        info!(persona = %msg.persona_name, country = %msg.country, "Account info received");
        self.bus.emit(self.emitter, msg.clone());
        Ok(())
    }

    fn on_playing_session_state(&mut self, _ctx: &MessageContext, msg: &ClientPlayingSessionState) -> Result<()> {
        debug!(blocked = msg.playing_blocked, app = msg.playing_app, "Playing session state");
        self.bus.emit(self.emitter, msg.clone());
        Ok(())
    }
}

pub struct Client {
    core: ClientCore,
    dispatcher: MessageDispatcher<ClientCore>,
    modules: ModuleSet,
}

impl Client {
    /// Client over TCP, with the presence module registered
    pub fn new(config: SessionConfig, credentials: Arc<dyn Credentials>) -> Result<Self> {
        let transport = Arc::new(TcpTransport::new(config.client.connection_timeout));
        Self::with_transport(config, credentials, transport)
    }

    /// Client over a caller-supplied transport, with the presence module registered
    pub fn with_transport(
        config: SessionConfig,
        credentials: Arc<dyn Credentials>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let mut client = Self::bare(config, credentials, transport)?;
        client.register_module(PresenceModule::new())?;
        Ok(client)
    }

    /// Client with no modules registered
    pub fn bare(config: SessionConfig, credentials: Arc<dyn Credentials>, transport: Arc<dyn Transport>) -> Result<Self> {
        let bus = EventBus::new(config.events.clone());
        let emitter = bus.emitter();
        let metrics = Arc::new(Metrics::new());

        let mut connection = Connection::new(
            transport,
            bus.clone(),
            Arc::clone(&metrics),
            AppId(config.client.app_id),
        );
        connection.add_registry(&baseline_registry()?)?;
        bus.passthrough::<ConnectionStateChanged>(connection.emitter(), emitter)?;

        let datagram = config
            .datagram
            .enabled
            .then(|| DatagramChannel::new(config.datagram.clone(), bus.clone(), emitter, Arc::clone(&metrics)));

        let mut dispatcher: MessageDispatcher<ClientCore> = MessageDispatcher::new();
        dispatcher
            .subscribe::<ClientLogonResponse, _>(ClientCore::on_logon_response)
            .subscribe::<ClientUpdateMachineAuth, _>(ClientCore::on_update_machine_auth)
            .subscribe::<ClientAccountInfo, _>(ClientCore::on_account_info)
            .subscribe::<ClientNewLoginKey, _>(ClientCore::on_new_login_key)
            .subscribe::<ClientPlayingSessionState, _>(ClientCore::on_playing_session_state);

        Ok(Self {
            core: ClientCore {
                config,
                connection,
                credentials,
                session: Session::default(),
                bus,
                emitter,
                metrics,
                datagram,
                deferred: Vec::new(),
            },
            dispatcher,
            modules: ModuleSet::new(),
        })
    }

    /// Connect to the configured service endpoint
    pub fn connect(&mut self) -> Result<()> {
        let addr = self.core.config.client.address();
        self.connect_to(&addr)
    }

    /// Connect to `addr`, dropping any current link first
    #[instrument(skip(self))]
    pub fn connect_to(&mut self, addr: &str) -> Result<()> {
        self.disconnect();
        self.core.connection.connect(addr)?;
        if let Some(datagram) = self.core.datagram.as_mut() {
            if let Err(e) = datagram.connect() {
                warn!(error = %e, "Datagram channel unavailable");
            }
        }
        Ok(())
    }

    /// Drop the link: stops the heartbeat and fails pending requests
    #[instrument(skip(self))]
    pub fn disconnect(&mut self) {
        if let Some(datagram) = self.core.datagram.as_mut() {
            datagram.disconnect();
        }
        if self.core.connection.disconnect() {
            self.core.on_connection_state(ConnectionState::Closed);
        }
    }

    pub fn send<T: ClientMessage>(&self, msg: &T) -> Result<()> {
        self.core.connection.send(msg)
    }

    pub fn send_to_app<T: ClientMessage>(&self, app: AppId, msg: &T) -> Result<()> {
        self.core.connection.send_to_app(app, msg)
    }

    /// Send `msg` as a tracked request.
    ///
    /// The returned response expires after the configured `request_timeout`;
    /// use [`PendingResponse::with_timeout`] to wait a different amount.
    pub fn request<Req, Resp>(&mut self, msg: &Req) -> Result<PendingResponse<Resp>>
    where
        Req: ClientMessage,
        Resp: ClientMessage + Clone,
    {
        let timeout = self.request_timeout();
        Ok(self.core.connection.request(msg)?.expire_after(timeout))
    }

    pub fn request_to_app<Req, Resp>(&mut self, app: AppId, msg: &Req) -> Result<PendingResponse<Resp>>
    where
        Req: ClientMessage,
        Resp: ClientMessage + Clone,
    {
        let timeout = self.request_timeout();
        Ok(self.core.connection.request_to_app(app, msg)?.expire_after(timeout))
    }

    pub fn request_timeout(&self) -> Duration {
        self.core.config.client.request_timeout
    }

    /// Report `app_id` as the game being played
    pub fn start_playing(&self, app_id: u32, app_name: impl Into<String>) -> Result<()> {
        self.send(&ClientGamesPlayed {
            games_played: vec![GamePlayed {
                game_id: u64::from(app_id),
                game_extra_info: app_name.into(),
            }],
            client_os_type: OS_TYPE_UNKNOWN,
        })
    }

    pub fn stop_playing(&self) -> Result<()> {
        self.send(&ClientGamesPlayed {
            games_played: Vec::new(),
            client_os_type: OS_TYPE_UNKNOWN,
        })
    }

    /// Change presence through the module that owns it
    pub fn set_persona_state(&mut self, state: PersonaState) -> Result<()> {
        let outbound = self.core.connection.outbound();
        let presence = self
            .modules
            .presence_mut()
            .ok_or_else(|| ProtocolError::Custom("no presence module registered".into()))?;
        presence.set_persona_state(outbound.as_ref(), state)
    }

    /// Register `module`. Returns `false` if a module of that type is
    /// already registered, in which case nothing changes.
    pub fn register_module<M: ClientModule>(&mut self, mut module: M) -> Result<bool> {
        let type_id = TypeId::of::<M>();
        if self.modules.contains(type_id) {
            debug!(module = module.name(), "Module already registered");
            return Ok(false);
        }

        let registry = module.handled_messages()?;
        self.core.connection.add_registry(&registry)?;

        let emitter = self.core.bus.emitter();
        let ctx = ModuleContext {
            bus: self.core.bus.clone(),
            emitter,
            client_emitter: self.core.emitter,
        };
        if let Err(e) = module.attach(ctx) {
            self.core.connection.remove_registry(&registry);
            self.core.bus.deregister_emitter(emitter);
            self.core.bus.remove_passthroughs(emitter);
            return Err(e);
        }

        info!(module = module.name(), opcodes = registry.len(), "Module registered");
        self.modules.push(RegisteredModule {
            module: Box::new(module),
            type_id,
            registry,
            emitter,
        });
        Ok(true)
    }

    /// Unregister the module of type `M`. Returns `false` if none was registered.
    pub fn unregister_module<M: ClientModule>(&mut self) -> bool {
        let Some(mut registered) = self.modules.remove(TypeId::of::<M>()) else {
            return false;
        };
        self.core.connection.remove_registry(&registered.registry);
        self.core.bus.deregister_emitter(registered.emitter);
        self.core.bus.remove_passthroughs(registered.emitter);
        registered.module.detach();
        info!(module = registered.module.name(), "Module unregistered");
        true
    }

    pub fn module<M: ClientModule>(&self) -> Option<&M> {
        self.modules.get::<M>()
    }

    pub fn module_mut<M: ClientModule>(&mut self) -> Option<&mut M> {
        self.modules.get_mut::<M>()
    }

    /// Registered modules in dispatch order
    pub fn modules(&self) -> &ModuleSet {
        &self.modules
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    pub fn is_connection_alive(&self) -> bool {
        self.core.connection.is_alive()
    }

    pub fn session(&self) -> &Session {
        &self.core.session
    }

    pub fn client_state(&self) -> ClientState {
        self.core.session.client_state
    }

    pub fn connection(&self) -> &Connection {
        &self.core.connection
    }

    pub fn bus(&self) -> &EventBus {
        &self.core.bus
    }

    /// The client's identity on its bus.
    ///
    /// Session and connection state changes, account info,
    /// playing-session state, presence changes and datagrams are all
    /// published under it.
    pub fn emitter(&self) -> EmitterId {
        self.core.emitter
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.core.metrics
    }

    pub fn datagram_mut(&mut self) -> Option<&mut DatagramChannel> {
        self.core.datagram.as_mut()
    }

    /// Wait for and apply one transport event.
    ///
    /// Returns `false` once there is no link left to read from.
    pub async fn step(&mut self) -> bool {
        match self.core.connection.next_event().await {
            Some(event) => {
                self.handle_transport_event(event);
                true
            }
            None => false,
        }
    }

    /// Apply transport events until the link is gone
    pub async fn run(&mut self) {
        while self.step().await {}
        debug!(state = %self.core.session.client_state, "Client loop finished");
    }

    /// Apply every transport event already queued, without waiting
    pub fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Some(event) = self.core.connection.try_next_event() {
            self.handle_transport_event(event);
            applied += 1;
        }
        applied
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::State(state) => {
                for applied in self.core.connection.handle_state(state) {
                    self.core.on_connection_state(applied);
                }
                self.apply_deferred();
            }
            TransportEvent::Frame(frame) => {
                if let Some(msg) = self.core.connection.receive(frame) {
                    self.dispatch(msg);
                }
            }
        }
    }

    fn dispatch(&mut self, msg: DecodedMessage) {
        let _timer = Timer::start(msg.type_name());
        let ctx = MessageContext::new(msg.header, self.core.connection.outbound());

        if let Err(e) = self.dispatcher.dispatch(&mut self.core, &ctx, &msg) {
            self.core.metrics.handler_failure();
            warn!(message = msg.type_name(), error = %e, "Client handler failed");
        }
        self.apply_deferred();

        for registered in self.modules.iter_mut() {
            let module = &mut registered.module;
            let name = module.name();
            if let Err(e) = run_guarded(name, || module.handle_message(&ctx, &msg)) {
                self.core.metrics.handler_failure();
                warn!(module = name, message = msg.type_name(), error = %e, "Module handler failed");
            }
        }
    }

    fn apply_deferred(&mut self) {
        for action in std::mem::take(&mut self.core.deferred) {
            match action {
                Deferred::SetPresence(state) => {
                    if self.modules.presence_mut().is_none() {
                        debug!("No presence module, skipping default presence");
                        continue;
                    }
                    if let Err(e) = self.set_persona_state(state) {
                        warn!(error = %e, "Failed to set default presence");
                    }
                }
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
        self.core.bus.shutdown();
    }
}

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Module registration, registry merging and inbound fan-out

use serde::{Deserialize, Serialize};
use session_protocol::config::SessionConfig;
use session_protocol::core::envelope::{AppId, JobId, MessageHeader, Opcode};
use session_protocol::error::{ProtocolError, Result};
use session_protocol::protocol::dispatcher::MessageContext;
use session_protocol::protocol::messages::{
    ClientAccountInfo, ClientHeartBeat, ClientMessage, ClientNewLoginKey, ClientNewLoginKeyAccepted,
};
use session_protocol::protocol::registry::{DecodedMessage, MessageRegistry};
use session_protocol::service::{
    Client, ClientModule, MemoryCredentials, ModuleContext, PersonaState, PersonaStateChanged, PresenceModule,
};
use session_protocol::transport::memory::{MemoryPeer, MemoryTransport};
use std::any::Any;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TradeOffer {
    offer_id: u64,
}

impl ClientMessage for TradeOffer {
    const OPCODE: Opcode = 9_001;
}

/// Claims the heartbeat opcode with a different payload type
#[derive(Debug, Serialize, Deserialize)]
struct FakeHeartBeat {
    junk: u8,
}

impl ClientMessage for FakeHeartBeat {
    const OPCODE: Opcode = ClientHeartBeat::OPCODE;
}

type Log = Arc<Mutex<Vec<String>>>;

/// Test module; `ID` gives each instantiation its own identity
struct Recorder<const ID: u8> {
    log: Log,
    attached: bool,
    detached: Arc<Mutex<bool>>,
}

impl<const ID: u8> Recorder<ID> {
    fn new(log: &Log) -> Self {
        Self {
            log: log.clone(),
            attached: false,
            detached: Arc::new(Mutex::new(false)),
        }
    }
}

impl<const ID: u8> ClientModule for Recorder<ID> {
    fn name(&self) -> &'static str {
        match ID {
            1 => "recorder-1",
            2 => "recorder-2",
            _ => "recorder",
        }
    }

    fn handled_messages(&self) -> Result<MessageRegistry> {
        MessageRegistry::new().with::<TradeOffer>()
    }

    fn attach(&mut self, _ctx: ModuleContext) -> Result<()> {
        self.attached = true;
        Ok(())
    }

    fn detach(&mut self) {
        *self.detached.lock().unwrap() = true;
    }

    fn handle_message(&mut self, _ctx: &MessageContext, msg: &DecodedMessage) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name(), msg.opcode()));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct Panicky;

impl ClientModule for Panicky {
    fn handle_message(&mut self, _ctx: &MessageContext, _msg: &DecodedMessage) -> Result<()> {
        panic!("module bug");
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct Conflicting;

impl ClientModule for Conflicting {
    fn handled_messages(&self) -> Result<MessageRegistry> {
        MessageRegistry::new().with::<FakeHeartBeat>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct FailsToAttach;

impl ClientModule for FailsToAttach {
    fn handled_messages(&self) -> Result<MessageRegistry> {
        MessageRegistry::new().with::<TradeOffer>()
    }

    fn attach(&mut self, _ctx: ModuleContext) -> Result<()> {
        Err(ProtocolError::Custom("attach refused".into()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Sends a heartbeat whenever it sees a login key
struct Echo;

impl ClientModule for Echo {
    fn handle_message(&mut self, ctx: &MessageContext, msg: &DecodedMessage) -> Result<()> {
        if msg.is::<ClientNewLoginKey>() {
            ctx.send(&ClientHeartBeat::default())?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn connected(client: &mut Client, transport: &MemoryTransport) -> MemoryPeer {
    client.connect_to("memory:modules").unwrap();
    transport.take_peer().unwrap()
}

fn client() -> (Client, MemoryTransport) {
    let transport = MemoryTransport::new();
    let client = Client::with_transport(
        SessionConfig::default(),
        Arc::new(MemoryCredentials::new("alice", "pw")),
        Arc::new(transport.clone()),
    )
    .unwrap();
    (client, transport)
}

fn bare_client() -> (Client, MemoryTransport) {
    let transport = MemoryTransport::new();
    let client = Client::bare(
        SessionConfig::default(),
        Arc::new(MemoryCredentials::new("alice", "pw")),
        Arc::new(transport.clone()),
    )
    .unwrap();
    (client, transport)
}

fn account_info() -> ClientAccountInfo {
    ClientAccountInfo {
        persona_name: "alice".into(),
        country: "NZ".into(),
    }
}

#[test]
fn registration_is_idempotent_per_type() {
    let (mut client, _transport) = client();
    assert_eq!(client.modules().names(), vec!["presence"]);

    assert!(!client.register_module(PresenceModule::new()).unwrap());
    assert_eq!(client.modules().len(), 1);

    assert!(client.unregister_module::<PresenceModule>());
    assert!(!client.unregister_module::<PresenceModule>());
    assert!(client.modules().is_empty());
}

#[test]
fn module_routes_do_not_outlive_the_module() {
    let (mut client, _transport) = client();
    let with_presence = client.bus().passthrough_routes();
    assert!(with_presence >= 1);

    for _ in 0..5 {
        assert!(client.unregister_module::<PresenceModule>());
        assert_eq!(client.bus().passthrough_routes(), with_presence - 1);
        assert!(client.register_module(PresenceModule::new()).unwrap());
        assert_eq!(client.bus().passthrough_routes(), with_presence);
    }
}

#[test]
fn registry_slice_follows_module_lifetime() {
    let (mut client, transport) = bare_client();
    let mut peer = connected(&mut client, &transport);
    let log = Log::default();

    peer.deliver(MessageHeader::new(TradeOffer::OPCODE, AppId(440)), &TradeOffer { offer_id: 1 })
        .unwrap();
    client.process_pending();
    assert_eq!(client.metrics().snapshot().unknown_opcodes, 1);

    assert!(client.register_module(Recorder::<1>::new(&log)).unwrap());
    assert!(client.connection().registry().contains(TradeOffer::OPCODE));

    peer.deliver(MessageHeader::new(TradeOffer::OPCODE, AppId(440)), &TradeOffer { offer_id: 2 })
        .unwrap();
    client.process_pending();
    assert_eq!(*log.lock().unwrap(), vec![format!("recorder-1:{}", TradeOffer::OPCODE)]);

    assert!(client.unregister_module::<Recorder<1>>());
    assert!(!client.connection().registry().contains(TradeOffer::OPCODE));
    // Baseline opcodes are untouched
    assert!(client.connection().registry().contains(ClientHeartBeat::OPCODE));
    assert!(peer.try_recv().is_none());
}

#[test]
fn shared_opcode_survives_until_last_declarer_leaves() {
    let (mut client, _transport) = bare_client();
    let log = Log::default();
    client.register_module(Recorder::<1>::new(&log)).unwrap();
    client.register_module(Recorder::<2>::new(&log)).unwrap();

    assert!(client.unregister_module::<Recorder<1>>());
    assert!(client.connection().registry().contains(TradeOffer::OPCODE));
    assert!(client.unregister_module::<Recorder<2>>());
    assert!(!client.connection().registry().contains(TradeOffer::OPCODE));
}

#[test]
fn conflicting_registry_is_rejected() {
    let (mut client, _transport) = client();
    let before = client.connection().registry().len();

    let err = client.register_module(Conflicting).unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::RegistryConflict { opcode, .. } if opcode == ClientHeartBeat::OPCODE
    ));
    assert_eq!(client.modules().len(), 1);
    assert_eq!(client.connection().registry().len(), before);
}

#[test]
fn failed_attach_rolls_back_registry() {
    let (mut client, _transport) = bare_client();
    assert!(client.register_module(FailsToAttach).is_err());
    assert!(client.modules().is_empty());
    assert!(!client.connection().registry().contains(TradeOffer::OPCODE));
}

#[test]
fn modules_see_messages_in_registration_order() {
    let (mut client, transport) = bare_client();
    let mut peer = connected(&mut client, &transport);
    let log = Log::default();
    client.register_module(Recorder::<2>::new(&log)).unwrap();
    client.register_module(Recorder::<1>::new(&log)).unwrap();

    peer.deliver(
        MessageHeader::new(ClientAccountInfo::OPCODE, AppId::PLATFORM),
        &account_info(),
    )
    .unwrap();
    client.process_pending();

    let opcode = ClientAccountInfo::OPCODE;
    assert_eq!(
        *log.lock().unwrap(),
        vec![format!("recorder-2:{opcode}"), format!("recorder-1:{opcode}")]
    );
    assert_eq!(client.modules().names(), vec!["recorder-2", "recorder-1"]);
    assert!(peer.try_recv().is_none());
}

#[test]
fn panicking_module_does_not_stop_delivery() {
    let (mut client, transport) = bare_client();
    let mut peer = connected(&mut client, &transport);
    let log = Log::default();
    client.register_module(Panicky).unwrap();
    client.register_module(Recorder::<1>::new(&log)).unwrap();

    peer.deliver(
        MessageHeader::new(ClientAccountInfo::OPCODE, AppId::PLATFORM),
        &account_info(),
    )
    .unwrap();
    client.process_pending();

    assert_eq!(log.lock().unwrap().len(), 1);
    assert_eq!(client.metrics().snapshot().handler_failures, 1);
    assert!(peer.try_recv().is_none());
}

#[test]
fn client_handlers_run_before_modules() {
    let (mut client, transport) = bare_client();
    let mut peer = connected(&mut client, &transport);
    client.register_module(Echo).unwrap();

    peer.deliver(
        MessageHeader::new(ClientNewLoginKey::OPCODE, AppId::PLATFORM).with_source_job(JobId(77)),
        &ClientNewLoginKey {
            unique_id: 5,
            login_key: "key".into(),
        },
    )
    .unwrap();
    client.process_pending();

    let sent = peer.drain_sent();
    let opcodes: Vec<_> = sent.iter().map(|e| e.header.opcode).collect();
    assert_eq!(opcodes, vec![ClientNewLoginKeyAccepted::OPCODE, ClientHeartBeat::OPCODE]);
    assert_eq!(sent[0].header.target_job_id, Some(JobId(77)));
    assert_eq!(sent[1].header.target_job_id, None);
}

#[test]
fn typed_lookup_reaches_the_concrete_module() {
    let (mut client, _transport) = bare_client();
    let log = Log::default();
    let module = Recorder::<1>::new(&log);
    let detached = module.detached.clone();
    client.register_module(module).unwrap();

    assert!(client.module::<Recorder<1>>().unwrap().attached);
    assert!(client.module::<Recorder<2>>().is_none());
    client.module_mut::<Recorder<1>>().unwrap().attached = false;
    assert!(!client.module::<Recorder<1>>().unwrap().attached);

    client.unregister_module::<Recorder<1>>();
    assert!(client.module::<Recorder<1>>().is_none());
    assert!(*detached.lock().unwrap());
}

#[test]
fn presence_requires_a_module() {
    let (mut client, transport) = bare_client();
    let _peer = connected(&mut client, &transport);
    assert!(matches!(
        client.set_persona_state(PersonaState::Online),
        Err(ProtocolError::Custom(_))
    ));
}

#[test]
fn presence_events_reach_the_client_identity() {
    let (mut client, transport) = client();
    let mut peer = connected(&mut client, &transport);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    client
        .bus()
        .register::<PersonaStateChanged, _>(client.emitter(), move |e| {
            s.lock().unwrap().push((e.previous, e.current));
            Ok(())
        })
        .unwrap();

    client.set_persona_state(PersonaState::Away).unwrap();
    client.set_persona_state(PersonaState::Away).unwrap();
    client.bus().drain();
    assert_eq!(*seen.lock().unwrap(), vec![(PersonaState::Offline, PersonaState::Away)]);
    assert_eq!(peer.drain_sent().len(), 2);

    client.unregister_module::<PresenceModule>();
    client.register_module(PresenceModule::new()).unwrap();
    client.set_persona_state(PersonaState::Busy).unwrap();
    client.bus().drain();
    assert_eq!(
        seen.lock().unwrap().last().copied(),
        Some((PersonaState::Offline, PersonaState::Busy))
    );
}

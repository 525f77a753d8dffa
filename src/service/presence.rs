//! Presence: the user's persona state as seen by friends.

use crate::core::envelope::{AppId, MessageHeader};
use crate::error::{ProtocolError, Result};
use crate::events::{EmitterId, EventBus};
use crate::protocol::messages::{ClientChangeStatus, ClientMessage};
use crate::protocol::outbound::Outbound;
use crate::protocol::registry::MessageRegistry;
use crate::service::module::{ClientModule, ModuleContext};
use serde::{Deserialize, Serialize};
use std::any::Any;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u32)]
pub enum PersonaState {
    #[default]
    Offline = 0,
    Online = 1,
    Busy = 2,
    Away = 3,
    Snooze = 4,
    LookingToTrade = 5,
    LookingToPlay = 6,
}

/// Emitted by the presence module; forwarded through the client's identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersonaStateChanged {
    pub previous: PersonaState,
    pub current: PersonaState,
}

/// Capability the client uses to set the default presence after logon
pub trait Presence {
    fn persona_state(&self) -> PersonaState;

    /// Announce `state` on `link` and record it
    fn set_persona_state(&mut self, link: Option<&Outbound>, state: PersonaState) -> Result<()>;
}

#[derive(Default)]
pub struct PresenceModule {
    state: PersonaState,
    player_name: Option<String>,
    bus: Option<(EventBus, EmitterId)>,
}

impl PresenceModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name announced with every status change
    pub fn with_player_name(mut self, name: impl Into<String>) -> Self {
        self.player_name = Some(name.into());
        self
    }
}

impl Presence for PresenceModule {
    fn persona_state(&self) -> PersonaState {
        self.state
    }

    fn set_persona_state(&mut self, link: Option<&Outbound>, state: PersonaState) -> Result<()> {
        let link = link.ok_or(ProtocolError::NotConnected)?;
        let msg = ClientChangeStatus {
            persona_state: state as u32,
            player_name: self.player_name.clone(),
        };
        link.send(MessageHeader::new(ClientChangeStatus::OPCODE, AppId::PLATFORM), &msg)?;

        let previous = std::mem::replace(&mut self.state, state);
        if previous != state {
            info!(?previous, current = ?state, "Persona state changed");
            if let Some((bus, emitter)) = &self.bus {
                bus.emit(
                    *emitter,
                    PersonaStateChanged {
                        previous,
                        current: state,
                    },
                );
            }
        }
        Ok(())
    }
}

impl ClientModule for PresenceModule {
    fn name(&self) -> &'static str {
        "presence"
    }

    fn handled_messages(&self) -> Result<MessageRegistry> {
        MessageRegistry::new().with::<ClientChangeStatus>()
    }

    fn attach(&mut self, ctx: ModuleContext) -> Result<()> {
        ctx.bus
            .passthrough::<PersonaStateChanged>(ctx.emitter, ctx.client_emitter)?;
        debug!(emitter = %ctx.emitter, "Presence attached");
        self.bus = Some((ctx.bus, ctx.emitter));
        Ok(())
    }

    fn detach(&mut self) {
        self.bus = None;
        self.state = PersonaState::Offline;
    }

    fn presence(&mut self) -> Option<&mut dyn Presence> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

//! Pluggable capability modules.
//!
//! A module contributes an opcode registry slice, receives every inbound
//! message that was not consumed as a response, and may publish domain events
//! under its own bus identity. Identity is the module's concrete type, so the
//! registered set holds at most one module of each type.

use crate::error::Result;
use crate::events::{EmitterId, EventBus};
use crate::protocol::dispatcher::MessageContext;
use crate::protocol::registry::{DecodedMessage, MessageRegistry};
use crate::service::presence::Presence;
use std::any::{Any, TypeId};

/// Handed to a module when it is bound to a client
#[derive(Clone)]
pub struct ModuleContext {
    pub bus: EventBus,
    /// The module's own identity on the bus
    pub emitter: EmitterId,
    /// The owning client's identity on the bus
    pub client_emitter: EmitterId,
}

pub trait ClientModule: Any + Send {
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Opcodes this module needs decoded
    fn handled_messages(&self) -> Result<MessageRegistry> {
        Ok(MessageRegistry::new())
    }

    fn attach(&mut self, _ctx: ModuleContext) -> Result<()> {
        Ok(())
    }

    fn detach(&mut self) {}

    fn handle_message(&mut self, _ctx: &MessageContext, _msg: &DecodedMessage) -> Result<()> {
        Ok(())
    }

    /// The presence capability, for the module that owns it
    fn presence(&mut self) -> Option<&mut dyn Presence> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub(crate) struct RegisteredModule {
    pub(crate) module: Box<dyn ClientModule>,
    pub(crate) type_id: TypeId,
    pub(crate) registry: MessageRegistry,
    pub(crate) emitter: EmitterId,
}

/// Registered modules in insertion order
#[derive(Default)]
pub struct ModuleSet {
    modules: Vec<RegisteredModule>,
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.modules.iter().any(|m| m.type_id == type_id)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Module names in dispatch order
    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.module.name()).collect()
    }

    pub fn get<M: ClientModule>(&self) -> Option<&M> {
        self.modules
            .iter()
            .find(|m| m.type_id == TypeId::of::<M>())
            .and_then(|m| m.module.as_any().downcast_ref::<M>())
    }

    pub fn get_mut<M: ClientModule>(&mut self) -> Option<&mut M> {
        self.modules
            .iter_mut()
            .find(|m| m.type_id == TypeId::of::<M>())
            .and_then(|m| m.module.as_any_mut().downcast_mut::<M>())
    }

    /// First module, in insertion order, that owns presence
    pub fn presence_mut(&mut self) -> Option<&mut dyn Presence> {
        self.modules.iter_mut().find_map(|m| m.module.presence())
    }

    pub(crate) fn push(&mut self, module: RegisteredModule) {
        self.modules.push(module);
    }

    pub(crate) fn remove(&mut self, type_id: TypeId) -> Option<RegisteredModule> {
        let index = self.modules.iter().position(|m| m.type_id == type_id)?;
        Some(self.modules.remove(index))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut RegisteredModule> {
        self.modules.iter_mut()
    }
}

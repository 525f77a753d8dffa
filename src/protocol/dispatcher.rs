use crate::core::envelope::{AppId, MessageHeader};
use crate::error::{ProtocolError, Result};
use crate::protocol::messages::ClientMessage;
use crate::protocol::outbound::Outbound;
use crate::protocol::registry::DecodedMessage;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

type HandlerFn<S> =
    dyn Fn(&mut S, &MessageContext, &(dyn Any + Send + Sync)) -> Result<()> + Send + Sync + 'static;

/// Per-message context handed to handlers.
///
/// Carries the inbound routing header and a handle for replying to the sender.
#[derive(Clone)]
pub struct MessageContext {
    pub header: MessageHeader,
    outbound: Option<Outbound>,
}

impl MessageContext {
    pub fn new(header: MessageHeader, outbound: Option<Outbound>) -> Self {
        Self { header, outbound }
    }

    pub fn app_id(&self) -> AppId {
        self.header.app_id
    }

    /// Send `msg` back to the sender, targeting the inbound source job id.
    pub fn reply<T: ClientMessage>(&self, msg: &T) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(ProtocolError::NotConnected)?;
        let header = MessageHeader::new(T::OPCODE, self.header.app_id)
            .with_target_job(self.header.source_job_id);
        outbound.send(header, msg)
    }

    /// Send an unrelated message on the same link
    pub fn send<T: ClientMessage>(&self, msg: &T) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(ProtocolError::NotConnected)?;
        outbound.send(MessageHeader::new(T::OPCODE, self.header.app_id), msg)
    }
}

/// Routes decoded messages to handlers by payload type.
///
/// Handlers receive `&mut S`, the state the dispatcher is driven with, so a
/// component can keep its handlers as plain methods.
pub struct MessageDispatcher<S> {
    handlers: HashMap<TypeId, Vec<Box<HandlerFn<S>>>>,
}

impl<S> Default for MessageDispatcher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> MessageDispatcher<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn subscribe<T, F>(&mut self, handler: F) -> &mut Self
    where
        S: 'static,
        T: ClientMessage,
        F: Fn(&mut S, &MessageContext, &T) -> Result<()> + Send + Sync + 'static,
    {
        let erased: Box<HandlerFn<S>> = Box::new(
            move |state: &mut S, ctx: &MessageContext, body: &(dyn Any + Send + Sync)| {
                match body.downcast_ref::<T>() {
                    Some(msg) => handler(state, ctx, msg),
                    None => Err(ProtocolError::UnexpectedResponse {
                        expected: std::any::type_name::<T>(),
                        actual: "mismatched body",
                    }),
                }
            },
        );
        self.handlers
            .entry(TypeId::of::<T>())
            .or_default()
            .push(erased);
        self
    }

    pub fn handles(&self, type_id: TypeId) -> bool {
        self.handlers.contains_key(&type_id)
    }

    /// Run every handler subscribed to `msg`'s type.
    ///
    /// Each handler is isolated: an error or panic in one does not skip the
    /// rest. Returns the first failure, if any.
    pub fn dispatch(&self, state: &mut S, ctx: &MessageContext, msg: &DecodedMessage) -> Result<()> {
        let Some(handlers) = self.handlers.get(&msg.type_id()) else {
            return Ok(());
        };

        let mut first_err = None;
        for handler in handlers {
            let outcome = run_guarded(msg.type_name(), || handler(state, ctx, msg.body()));
            if let Err(e) = outcome {
                if first_err.is_none() {
                    first_err = Some(e);
                } else {
                    warn!(message = msg.type_name(), error = %e, "Additional handler failure");
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Run `f`, converting a panic into `ProtocolError::HandlerFailed`.
pub(crate) fn run_guarded<F>(label: &str, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(ProtocolError::HandlerFailed(format!("{label}: {detail}")))
        }
    }
}

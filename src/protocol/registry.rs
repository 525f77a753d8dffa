//! Opcode registries.
//!
//! A [`MessageRegistry`] is one source's opcode -> decoder table (the client's
//! baseline, or one module's slice). The connection decodes with an
//! [`ActiveRegistry`], the additive union of every registered source.
//!
//! Within a union an opcode maps to exactly one payload type. Two sources may
//! both declare the same `(opcode, type)` pair; declaring a *different* type
//! for an opcode already present is a configuration error and leaves the union
//! untouched.

use crate::core::envelope::{Envelope, MessageHeader, Opcode};
use crate::error::{ProtocolError, Result};
use crate::protocol::messages::ClientMessage;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

type Body = Arc<dyn Any + Send + Sync>;
type DecodeFn = fn(&[u8]) -> Result<Body>;

fn decode_as<T: ClientMessage>(bytes: &[u8]) -> Result<Body> {
    Ok(Arc::new(T::decode(bytes)?))
}

/// Decoder for one opcode
#[derive(Clone, Copy)]
pub struct RegistryEntry {
    pub opcode: Opcode,
    pub type_id: TypeId,
    pub type_name: &'static str,
    decode: DecodeFn,
}

impl RegistryEntry {
    pub fn of<T: ClientMessage>() -> Self {
        Self {
            opcode: T::OPCODE,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            decode: decode_as::<T>,
        }
    }

    /// Decode `envelope`'s payload into this entry's type
    pub fn decode(&self, envelope: &Envelope) -> Result<DecodedMessage> {
        let body = (self.decode)(&envelope.payload)?;
        Ok(DecodedMessage {
            header: envelope.header,
            type_id: self.type_id,
            type_name: self.type_name,
            body,
        })
    }

    fn same_type(&self, other: &RegistryEntry) -> bool {
        self.type_id == other.type_id
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("opcode", &self.opcode)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// An inbound message after payload decoding
#[derive(Clone)]
pub struct DecodedMessage {
    pub header: MessageHeader,
    type_id: TypeId,
    type_name: &'static str,
    body: Body,
}

impl DecodedMessage {
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: ClientMessage>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub fn downcast_ref<T: ClientMessage>(&self) -> Option<&T> {
        self.body.downcast_ref::<T>()
    }

    pub(crate) fn body(&self) -> &(dyn Any + Send + Sync) {
        self.body.as_ref()
    }
}

impl fmt::Debug for DecodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedMessage")
            .field("header", &self.header)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// One source's opcode table
#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
    entries: BTreeMap<Opcode, RegistryEntry>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its opcode.
    ///
    /// Re-registering the same type is a no-op; a different type for a taken
    /// opcode is rejected.
    pub fn register<T: ClientMessage>(&mut self) -> Result<&mut Self> {
        let entry = RegistryEntry::of::<T>();
        match self.entries.get(&entry.opcode) {
            Some(existing) if existing.same_type(&entry) => {}
            Some(existing) => {
                return Err(ProtocolError::RegistryConflict {
                    opcode: entry.opcode,
                    existing: existing.type_name,
                    incoming: entry.type_name,
                })
            }
            None => {
                self.entries.insert(entry.opcode, entry);
            }
        }
        Ok(self)
    }

    /// Builder form of [`register`](Self::register)
    pub fn with<T: ClientMessage>(mut self) -> Result<Self> {
        self.register::<T>()?;
        Ok(self)
    }

    pub fn get(&self, opcode: Opcode) -> Option<&RegistryEntry> {
        self.entries.get(&opcode)
    }

    pub fn contains(&self, opcode: Opcode) -> bool {
        self.entries.contains_key(&opcode)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }
}

#[derive(Debug)]
struct MergedEntry {
    entry: RegistryEntry,
    sources: usize,
}

/// Union of registries used to decode inbound envelopes
#[derive(Debug, Default)]
pub struct ActiveRegistry {
    merged: HashMap<Opcode, MergedEntry>,
}

impl ActiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `registry` into the union.
    ///
    /// All-or-nothing: if any entry conflicts, nothing is merged.
    pub fn add(&mut self, registry: &MessageRegistry) -> Result<()> {
        for entry in registry.iter() {
            if let Some(existing) = self.merged.get(&entry.opcode) {
                if !existing.entry.same_type(entry) {
                    return Err(ProtocolError::RegistryConflict {
                        opcode: entry.opcode,
                        existing: existing.entry.type_name,
                        incoming: entry.type_name,
                    });
                }
            }
        }

        for entry in registry.iter() {
            self.merged
                .entry(entry.opcode)
                .and_modify(|m| m.sources += 1)
                .or_insert(MergedEntry {
                    entry: *entry,
                    sources: 1,
                });
        }
        Ok(())
    }

    /// Withdraw a previously merged registry.
    ///
    /// Opcodes still declared by another source stay decodable.
    pub fn remove(&mut self, registry: &MessageRegistry) {
        for entry in registry.iter() {
            let drop_it = match self.merged.get_mut(&entry.opcode) {
                Some(m) if m.entry.same_type(entry) => {
                    m.sources -= 1;
                    m.sources == 0
                }
                _ => false,
            };
            if drop_it {
                self.merged.remove(&entry.opcode);
            }
        }
    }

    pub fn lookup(&self, opcode: Opcode) -> Option<&RegistryEntry> {
        self.merged.get(&opcode).map(|m| &m.entry)
    }

    pub fn contains(&self, opcode: Opcode) -> bool {
        self.merged.contains_key(&opcode)
    }

    pub fn len(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    /// Look up the envelope's opcode and decode its payload
    pub fn decode(&self, envelope: &Envelope) -> Result<DecodedMessage> {
        self.lookup(envelope.header.opcode)
            .ok_or(ProtocolError::UnknownOpcode(envelope.header.opcode))?
            .decode(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::envelope::AppId;
    use crate::protocol::messages::{ClientHeartBeat, ClientNewLoginKey, ClientNewLoginKeyAccepted};
    use serde::{Deserialize, Serialize};

    /// Claims the heartbeat opcode with a different shape
    #[derive(Debug, Serialize, Deserialize)]
    struct Impostor(u8);

    impl ClientMessage for Impostor {
        const OPCODE: Opcode = ClientHeartBeat::OPCODE;
    }

    #[test]
    fn same_type_twice_is_idempotent() {
        let mut reg = MessageRegistry::new();
        reg.register::<ClientHeartBeat>().unwrap();
        reg.register::<ClientHeartBeat>().unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn conflicting_type_is_rejected() {
        let mut reg = MessageRegistry::new();
        reg.register::<ClientHeartBeat>().unwrap();
        let err = reg.register::<Impostor>().unwrap_err();
        assert!(matches!(err, ProtocolError::RegistryConflict { opcode, .. } if opcode == ClientHeartBeat::OPCODE));
    }

    #[test]
    fn union_merge_is_all_or_nothing() {
        let mut active = ActiveRegistry::new();
        active
            .add(&MessageRegistry::new().with::<ClientHeartBeat>().unwrap())
            .unwrap();

        let bad = MessageRegistry::new()
            .with::<ClientNewLoginKey>()
            .unwrap()
            .with::<Impostor>()
            .unwrap();
        assert!(active.add(&bad).is_err());
        assert!(!active.contains(ClientNewLoginKey::OPCODE));
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn shared_opcode_survives_partial_removal() {
        let a = MessageRegistry::new().with::<ClientHeartBeat>().unwrap();
        let b = MessageRegistry::new()
            .with::<ClientHeartBeat>()
            .unwrap()
            .with::<ClientNewLoginKeyAccepted>()
            .unwrap();

        let mut active = ActiveRegistry::new();
        active.add(&a).unwrap();
        active.add(&b).unwrap();
        active.remove(&b);

        assert!(active.contains(ClientHeartBeat::OPCODE));
        assert!(!active.contains(ClientNewLoginKeyAccepted::OPCODE));
        active.remove(&a);
        assert!(active.is_empty());
    }

    #[test]
    fn decode_unknown_opcode() {
        let active = ActiveRegistry::new();
        let env = Envelope::new(MessageHeader::new(1, AppId::PLATFORM), Vec::new());
        assert!(matches!(
            active.decode(&env),
            Err(ProtocolError::UnknownOpcode(1))
        ));
    }

    #[test]
    fn decode_produces_typed_body() {
        let mut active = ActiveRegistry::new();
        active
            .add(&MessageRegistry::new().with::<ClientNewLoginKey>().unwrap())
            .unwrap();
        let payload = ClientNewLoginKey {
            unique_id: 9,
            login_key: "abc".into(),
        }
        .encode()
        .unwrap();
        let env = Envelope::new(
            MessageHeader::new(ClientNewLoginKey::OPCODE, AppId::PLATFORM),
            payload,
        );
        let decoded = active.decode(&env).unwrap();
        assert!(decoded.is::<ClientNewLoginKey>());
        assert_eq!(decoded.downcast_ref::<ClientNewLoginKey>().unwrap().unique_id, 9);
    }
}

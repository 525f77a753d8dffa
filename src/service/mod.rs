//! # Client Service
//!
//! Session orchestration above the protocol layer.
//!
//! ## Components
//! - **client**: logon, session state machine, inbound fan-out, module registry
//! - **session**: `ClientState` and the session record
//! - **module**: `ClientModule` trait and the ordered module set
//! - **presence**: default module owning persona state
//! - **credentials**: credential/sentry storage collaborator and its in-memory and file implementations

pub mod client;
pub mod credentials;
pub mod module;
pub mod presence;
pub mod session;

pub use client::Client;
pub use credentials::{Credentials, FileCredentials, MemoryCredentials};
pub use module::{ClientModule, ModuleContext};
pub use presence::{PersonaState, PersonaStateChanged, Presence, PresenceModule};
pub use session::{ClientState, ClientStateChanged, Session};

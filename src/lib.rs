//! # session-protocol
//!
//! Client-side engine for a binary session protocol: connection lifecycle,
//! typed message dispatch, job-id request correlation, an instance-scoped
//! event bus and pluggable capability modules, plus a CRC-checked auxiliary
//! datagram channel.
//!
//! ## Quick start
//! ```no_run
//! use std::sync::Arc;
//! use session_protocol::config::SessionConfig;
//! use session_protocol::service::{Client, ClientStateChanged, MemoryCredentials};
//!
//! # async fn demo() -> session_protocol::error::Result<()> {
//! let credentials = Arc::new(MemoryCredentials::new("account", "password"));
//! let mut client = Client::new(SessionConfig::default(), credentials)?;
//!
//! client.bus().register::<ClientStateChanged, _>(client.emitter(), |change| {
//!     println!("session: {} -> {}", change.previous, change.current);
//!     Ok(())
//! })?;
//! client.bus().start()?;
//!
//! client.connect()?;
//! client.run().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::SessionConfig;
pub use crate::error::{ProtocolError, Result};
pub use crate::events::EventBus;
pub use crate::service::Client;

//! # Protocol Layer
//!
//! Typed messages, opcode registries, dispatch, request correlation and the
//! connection state machine.
//!
//! ## Components
//! - **messages**: `ClientMessage` trait, opcode catalog, result codes, baseline payloads
//! - **registry**: per-source opcode tables and their merged union
//! - **dispatcher**: type-keyed handler fan-out with panic isolation
//! - **correlator**: job ids, pending requests, awaitable responses
//! - **connection**: link ownership, state publication, heartbeat
//! - **machine_auth**: sentry chunk validation and login-key acknowledgment

pub mod connection;
pub mod correlator;
pub mod dispatcher;
pub mod machine_auth;
pub mod messages;
pub mod outbound;
pub mod registry;

//! # Event Bus
//!
//! Instance-scoped publish/subscribe used to surface connection state,
//! session state and module domain events without coupling the emitters to
//! their observers.
//!
//! ## Delivery
//! - One bounded FIFO queue per bus; overflow follows `EventBusConfig::overflow`
//! - One consumer at a time: invocations never run concurrently
//! - A failing or panicking subscriber is logged and skipped
//!
//! ## Lifecycle
//! `EventBus::new` -> `start()` (consumer thread) -> `shutdown()`; `drain()` runs
//! queued invocations synchronously, which is what tests and custom drivers use.

pub mod bus;

pub use bus::{EmitterId, EventBus, EventBusStats, SubscriptionId};

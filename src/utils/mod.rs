//! # Utility Modules
//!
//! Supporting utilities for integrity checks, logging, metrics and timing.
//!
//! ## Components
//! - **CRC**: 32-bit checksum and its folded 16-bit variant for datagrams
//! - **Logging**: `tracing-subscriber` installation from configuration
//! - **Metrics**: Per-client atomic counters
//! - **Timeout**: Async timeout wrappers and default intervals

pub mod crc;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use crc::{crc16, crc32};

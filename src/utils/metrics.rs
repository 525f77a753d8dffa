//! Observability and Metrics
//!
//! Per-client counters for monitoring session health.
//!
//! Uses atomic counters for thread-safe collection. Each `Client` owns its own
//! `Metrics` so independent clients in one process never mix their numbers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for one client instance
#[derive(Debug)]
pub struct Metrics {
    /// Transport links opened
    pub connections_total: AtomicU64,
    /// Links torn down by failure, loss or close
    pub connections_lost: AtomicU64,
    /// Total frames sent
    pub frames_sent: AtomicU64,
    /// Total frames received
    pub frames_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Frames dropped because the opcode was not registered
    pub unknown_opcodes: AtomicU64,
    /// Frames dropped because the envelope or payload did not decode
    pub decode_failures: AtomicU64,
    /// Handler invocations that returned an error or panicked
    pub handler_failures: AtomicU64,
    /// Requests issued with a job id
    pub requests_issued: AtomicU64,
    /// Requests completed by a matching response
    pub requests_completed: AtomicU64,
    /// Requests failed by connection teardown
    pub requests_failed: AtomicU64,
    /// Heartbeats sent
    pub heartbeats_sent: AtomicU64,
    /// Datagrams dropped by checksum validation
    pub datagrams_rejected: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            unknown_opcodes: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            requests_issued: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            datagrams_rejected: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame sent
    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a frame received
    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn unknown_opcode(&self) {
        self.unknown_opcodes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_issued(&self) {
        self.requests_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `count` requests failed at once by a teardown
    pub fn requests_failed(&self, count: u64) {
        self.requests_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagram_rejected(&self) {
        self.datagrams_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_lost: self.connections_lost.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            unknown_opcodes: self.unknown_opcodes.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            requests_issued: self.requests_issued.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            datagrams_rejected: self.datagrams_rejected.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_lost = snapshot.connections_lost,
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            unknown_opcodes = snapshot.unknown_opcodes,
            decode_failures = snapshot.decode_failures,
            handler_failures = snapshot.handler_failures,
            requests_issued = snapshot.requests_issued,
            requests_completed = snapshot.requests_completed,
            requests_failed = snapshot.requests_failed,
            heartbeats_sent = snapshot.heartbeats_sent,
            datagrams_rejected = snapshot.datagrams_rejected,
            uptime_seconds = snapshot.uptime_seconds,
            "Session metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_lost: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub unknown_opcodes: u64,
    pub decode_failures: u64,
    pub handler_failures: u64,
    pub requests_issued: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub heartbeats_sent: u64,
    pub datagrams_rejected: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}

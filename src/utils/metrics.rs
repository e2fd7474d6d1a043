//! Observability and Metrics
//!
//! Per-server counters for connections, accepted votes and failures.
//!
//! Uses atomic counters so connection tasks can record without locking.
//! Every [`Server`](crate::server::Server) owns one instance; there is no
//! process-wide collector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

use crate::core::vote::ProtocolVersion;

/// Metrics collector for one server
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted
    pub connections_total: AtomicU64,
    /// Connections currently being handled
    pub connections_active: AtomicU64,
    /// Votes delivered to the handler over v1
    pub votes_v1: AtomicU64,
    /// Votes delivered to the handler over v2
    pub votes_v2: AtomicU64,
    /// Messages that failed to decode or authenticate
    pub decode_failures: AtomicU64,
    /// Handler invocations that returned an error or panicked
    pub handler_faults: AtomicU64,
    /// Read/write/timeout failures on accepted connections
    pub transport_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            votes_v1: AtomicU64::new(0),
            votes_v2: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            handler_faults: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a vote handed to the application
    pub fn vote_accepted(&self, version: ProtocolVersion) {
        match version {
            ProtocolVersion::V1 => self.votes_v1.fetch_add(1, Ordering::Relaxed),
            ProtocolVersion::V2 => self.votes_v2.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record a decode or auth failure
    pub fn decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed handler invocation
    pub fn handler_fault(&self) {
        self.handler_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transport failure
    pub fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of connections still being handled
    pub fn active(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            votes_v1: self.votes_v1.load(Ordering::Relaxed),
            votes_v2: self.votes_v2.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handler_faults: self.handler_faults.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            votes_v1 = snapshot.votes_v1,
            votes_v2 = snapshot.votes_v2,
            decode_failures = snapshot.decode_failures,
            handler_faults = snapshot.handler_faults,
            transport_errors = snapshot.transport_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Votifier metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub votes_v1: u64,
    pub votes_v2: u64,
    pub decode_failures: u64,
    pub handler_faults: u64,
    pub transport_errors: u64,
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
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

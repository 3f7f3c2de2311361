//! Observability and Metrics
//!
//! Counters for the transport layer: datagrams and connections handled, decode failures,
//! request outcomes by abort cause and idle events.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::AbortCause;

/// Global metrics collector for transport operations
#[derive(Debug)]
pub struct Metrics {
    /// UDP datagrams received
    pub datagrams_received: AtomicU64,
    /// UDP datagrams sent
    pub datagrams_sent: AtomicU64,
    /// Total TCP connections accepted or opened
    pub connections_total: AtomicU64,
    /// Currently open TCP connections
    pub connections_active: AtomicU64,
    /// Messages decoded successfully
    pub messages_received: AtomicU64,
    /// Messages encoded and handed to a socket
    pub messages_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    /// Packets dropped because they did not decode
    pub decode_errors: AtomicU64,
    /// Requests completed with a response
    pub requests_completed: AtomicU64,
    /// Requests failed as peer abort or peer error
    pub peer_aborts: AtomicU64,
    /// Requests failed by timeout
    pub timeouts: AtomicU64,
    /// Requests cancelled locally
    pub user_aborts: AtomicU64,
    /// Idle events raised by idle detectors
    pub idle_events: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            datagrams_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            peer_aborts: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            user_aborts: AtomicU64::new(0),
            idle_events: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn datagram_received(&self, byte_count: u64) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn datagram_sent(&self, byte_count: u64) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Bytes of one length-prefixed TCP frame written
    pub fn frame_sent(&self, byte_count: u64) {
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Bytes of one length-prefixed TCP frame read
    pub fn frame_received(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
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

    /// Records a new connection and closes it again when the guard drops.
    pub fn track_connection(&self) -> ConnectionGuard<'_> {
        self.connection_established();
        ConnectionGuard { metrics: self }
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an encoded message. Its bytes are counted where they hit the socket.
    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed request under its abort cause
    pub fn request_failed(&self, cause: AbortCause) {
        let counter = match cause {
            AbortCause::PeerAbort | AbortCause::PeerError => &self.peer_aborts,
            AbortCause::Timeout => &self.timeouts,
            AbortCause::UserAbort => &self.user_aborts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idle_event(&self) {
        self.idle_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            peer_aborts: self.peer_aborts.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            user_aborts: self.user_aborts.load(Ordering::Relaxed),
            idle_events: self.idle_events.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            datagrams_received = snapshot.datagrams_received,
            datagrams_sent = snapshot.datagrams_sent,
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            messages_received = snapshot.messages_received,
            messages_sent = snapshot.messages_sent,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            decode_errors = snapshot.decode_errors,
            requests_completed = snapshot.requests_completed,
            peer_aborts = snapshot.peer_aborts,
            timeouts = snapshot.timeouts,
            user_aborts = snapshot.user_aborts,
            idle_events = snapshot.idle_events,
            uptime_seconds = snapshot.uptime_seconds,
            "Transport metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub connections_total: u64,
    pub connections_active: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub decode_errors: u64,
    pub requests_completed: u64,
    pub peer_aborts: u64,
    pub timeouts: u64,
    pub user_aborts: u64,
    pub idle_events: u64,
    pub uptime_seconds: u64,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Open-connection gauge entry, released on drop.
#[must_use = "the connection is counted closed as soon as the guard drops"]
#[derive(Debug)]
pub struct ConnectionGuard<'a> {
    metrics: &'a Metrics,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.metrics.connection_closed();
    }
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

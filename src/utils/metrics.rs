//! Observability counters.
//!
//! Each server or client owns one [`Metrics`] instance shared with its connections
//! through an `Arc`, so counters in one container never mix with another's.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

macro_rules! counters {
    ($( $(#[$doc:meta])* $field:ident => $record:ident ),* $(,)?) => {
        /// Atomic counters for one container and all of its connections
        #[derive(Debug)]
        pub struct Metrics {
            $( $(#[$doc])* pub $field: AtomicU64, )*
            /// Frame bytes written
            pub bytes_sent: AtomicU64,
            /// Frame bytes read
            pub bytes_received: AtomicU64,
            start_time: Instant,
        }

        impl Metrics {
            pub fn new() -> Self {
                Self {
                    $( $field: AtomicU64::new(0), )*
                    bytes_sent: AtomicU64::new(0),
                    bytes_received: AtomicU64::new(0),
                    start_time: Instant::now(),
                }
            }

            $(
                #[inline]
                pub fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            /// Current values of every counter
            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $( $field: self.$field.load(Ordering::Relaxed), )*
                    bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
                    bytes_received: self.bytes_received.load(Ordering::Relaxed),
                    uptime_seconds: self.start_time.elapsed().as_secs(),
                }
            }
        }

        /// Snapshot of metrics at a point in time
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct MetricsSnapshot {
            $( pub $field: u64, )*
            pub bytes_sent: u64,
            pub bytes_received: u64,
            pub uptime_seconds: u64,
        }
    };
}

counters! {
    /// Connections that completed setup
    connections_established => connection_established,
    /// Connections that stopped being alive
    connections_lost => connection_lost,
    /// Key exchanges started
    handshakes_total => handshake_attempt,
    /// Key exchanges that reached the secured state
    handshakes_success => handshake_success,
    /// Key exchanges that failed
    handshakes_failed => handshake_failed,
    /// Frames handed to a transport
    packets_sent => packet_sent_count,
    /// Frames read from a transport
    packets_received => packet_received_count,
    /// RegisterType round trips started by this side
    registrations_sent => registration_sent,
    /// RegisterType announcements accepted from peers
    registrations_accepted => registration_accepted,
    /// RegisterType announcements refused
    registrations_rejected => registration_rejected,
    /// Requests issued
    requests_sent => request_sent,
    /// Requests that hit their deadline
    requests_timed_out => request_timed_out,
    /// Responses that arrived after their request was settled
    late_responses => late_response,
    /// Heartbeats written
    heartbeats_sent => heartbeat_sent,
    /// Frames that failed signature, decryption or state checks
    security_failures => security_failure,
    /// Frames or control packets that violated the protocol
    protocol_errors => protocol_error,
    /// Client reconnection attempts
    reconnect_attempts => reconnect_attempt,
}

// Byte totals add a size rather than one, so they sit outside the macro
impl Metrics {
    pub fn packet_sent(&self, bytes: usize) {
        self.packet_sent_count();
        self.bytes_sent_add(bytes);
    }

    pub fn packet_received(&self, bytes: usize) {
        self.packet_received_count();
        self.bytes_received_add(bytes);
    }

    fn bytes_sent_add(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn bytes_received_add(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            connections_established = s.connections_established,
            connections_lost = s.connections_lost,
            handshakes_success = s.handshakes_success,
            handshakes_failed = s.handshakes_failed,
            packets_sent = s.packets_sent,
            packets_received = s.packets_received,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            registrations_sent = s.registrations_sent,
            requests_sent = s.requests_sent,
            requests_timed_out = s.requests_timed_out,
            security_failures = s.security_failures,
            protocol_errors = s.protocol_errors,
            reconnect_attempts = s.reconnect_attempts,
            uptime_seconds = s.uptime_seconds,
            "Packet link metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

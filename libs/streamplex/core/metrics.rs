use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-engine counters
///
/// Written only by the engine's event loop; read from anywhere through an
/// `Arc`. Relaxed ordering is enough since the counters are independent.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    messages_received: AtomicU64,
    frames_sent: AtomicU64,
    pings_sent: AtomicU64,
    pongs_received: AtomicU64,
    reconnect_attempts: AtomicU64,
    protocol_violations: AtomicU64,
    buffer_overflows: AtomicU64,
    connections_open: AtomicU64,
    failed_subscriptions: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub frames_sent: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub reconnect_attempts: u64,
    pub protocol_violations: u64,
    pub buffer_overflows: u64,
    pub connections_open: u64,
    pub failed_subscriptions: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ping(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pong(&self) {
        self.pongs_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self) {
        self.buffer_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_subscription(&self) {
        self.failed_subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Never wraps below zero
        let _ = self
            .connections_open
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn connections_open(&self) -> u64 {
        self.connections_open.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            pongs_received: self.pongs_received.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            buffer_overflows: self.buffer_overflows.load(Ordering::Relaxed),
            connections_open: self.connections_open.load(Ordering::Relaxed),
            failed_subscriptions: self.failed_subscriptions.load(Ordering::Relaxed),
        }
    }
}

impl Add for MetricsSnapshot {
    type Output = MetricsSnapshot;

    fn add(self, other: MetricsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received + other.messages_received,
            frames_sent: self.frames_sent + other.frames_sent,
            pings_sent: self.pings_sent + other.pings_sent,
            pongs_received: self.pongs_received + other.pongs_received,
            reconnect_attempts: self.reconnect_attempts + other.reconnect_attempts,
            protocol_violations: self.protocol_violations + other.protocol_violations,
            buffer_overflows: self.buffer_overflows + other.buffer_overflows,
            connections_open: self.connections_open + other.connections_open,
            failed_subscriptions: self.failed_subscriptions + other.failed_subscriptions,
        }
    }
}

impl std::iter::Sum for MetricsSnapshot {
    fn sum<I: Iterator<Item = MetricsSnapshot>>(iter: I) -> Self {
        iter.fold(MetricsSnapshot::default(), Add::add)
    }
}

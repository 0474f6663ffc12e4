//! Per-connection liveness tracking
//!
//! Tracks outstanding Pings to detect dead peers. A connection is considered
//! dead once its first unanswered Ping is older than the timeout. Later Pings
//! do not move that marker, so a steady ping schedule cannot keep a silent
//! peer alive.
//!
//! All methods take `now` explicitly so the event loop can use a single
//! timestamp per wakeup and tests can drive time by hand.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Liveness {
    /// Last time any bytes arrived on the connection
    last_activity: Instant,
    /// Last Pong received (None until the first one)
    last_pong: Option<Instant>,
    /// When the oldest still-unanswered Ping was sent
    awaiting_pong_since: Option<Instant>,
    /// How long a Ping may stay unanswered
    timeout: Duration,
}

impl Liveness {
    /// # Arguments
    /// * `now` - When the connection reached `Open`
    /// * `timeout` - How long to wait for a Pong after a Ping
    pub fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            last_activity: now,
            last_pong: None,
            awaiting_pong_since: None,
            timeout,
        }
    }

    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Record that a Ping was just written
    pub fn record_ping_sent(&mut self, now: Instant) {
        if self.awaiting_pong_since.is_none() {
            self.awaiting_pong_since = Some(now);
        }
    }

    /// Record that a Pong arrived; clears the outstanding Ping
    pub fn record_pong_received(&mut self, now: Instant) {
        self.last_pong = Some(now);
        self.awaiting_pong_since = None;
    }

    /// Healthy unless a Ping has gone unanswered for longer than the timeout
    pub fn is_healthy(&self, now: Instant) -> bool {
        match self.awaiting_pong_since {
            None => true,
            Some(sent) => now.saturating_duration_since(sent) <= self.timeout,
        }
    }

    pub fn is_awaiting_pong(&self) -> bool {
        self.awaiting_pong_since.is_some()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Returns None if no Pong has ever been received
    pub fn time_since_last_pong(&self, now: Instant) -> Option<Duration> {
        self.last_pong
            .map(|pong| now.saturating_duration_since(pong))
    }

    /// How long the oldest outstanding Ping has waited
    pub fn awaiting_for(&self, now: Instant) -> Option<Duration> {
        self.awaiting_pong_since
            .map(|sent| now.saturating_duration_since(sent))
    }
}

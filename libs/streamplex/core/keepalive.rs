//! Keepalive timers for the event loop
//!
//! # Architecture
//!
//! The engine owns one scheduler and sleeps until [`KeepaliveScheduler::next_deadline`]
//! alongside its I/O:
//!
//! ```text
//! ┌──────────────────────────┐
//! │  Event loop              │
//! │                          │
//! │  select! {               │
//! │    reads / commands ─────┼──> on_activity(now)   (pushes idle deadline)
//! │    sleep_until(next) ────┼──> poll(now) ──> KeepaliveDue { ping, check }
//! │  }                       │
//! └──────────────────────────┘
//! ```
//!
//! Three timers are tracked:
//!
//! - **Idle tick**: no event reached the loop for `idle_tick` → ping everyone
//! - **Broadcast**: every `broadcast_interval` → ping everyone regardless of traffic
//! - **Liveness check**: every `check_interval` → evict connections with overdue Pongs
//!
//! Missed deadlines are not replayed; a late poll fires each timer once and
//! reschedules it from `now`.

use std::time::Duration;
use tokio::time::Instant;

/// What the loop should do after a keepalive wakeup
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveDue {
    /// Send a Ping on every Open connection
    pub ping: bool,
    /// Run the dead-peer check
    pub check: bool,
}

#[derive(Debug, Clone)]
pub struct KeepaliveScheduler {
    idle_tick: Duration,
    broadcast_interval: Duration,
    check_interval: Duration,
    idle_deadline: Instant,
    broadcast_deadline: Instant,
    check_deadline: Instant,
}

impl KeepaliveScheduler {
    pub fn new(
        now: Instant,
        idle_tick: Duration,
        broadcast_interval: Duration,
        check_interval: Duration,
    ) -> Self {
        Self {
            idle_tick,
            broadcast_interval,
            check_interval,
            idle_deadline: now + idle_tick,
            broadcast_deadline: now + broadcast_interval,
            check_deadline: now + check_interval,
        }
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do
    pub fn next_deadline(&self) -> Instant {
        self.idle_deadline
            .min(self.broadcast_deadline)
            .min(self.check_deadline)
    }

    /// An event reached the loop; restart the idle countdown
    pub fn on_activity(&mut self, now: Instant) {
        self.idle_deadline = now + self.idle_tick;
    }

    /// Fire every timer whose deadline has passed
    pub fn poll(&mut self, now: Instant) -> KeepaliveDue {
        let mut due = KeepaliveDue::default();

        if now >= self.idle_deadline {
            due.ping = true;
            self.idle_deadline = now + self.idle_tick;
        }

        if now >= self.broadcast_deadline {
            due.ping = true;
            self.broadcast_deadline = now + self.broadcast_interval;
        }

        if now >= self.check_deadline {
            due.check = true;
            self.check_deadline = now + self.check_interval;
        }

        due
    }
}

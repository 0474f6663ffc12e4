use crate::traits::{
    BackoffKind, ExponentialBackoff, FixedDelay, LinearBackoff, ReconnectionStrategy, Result,
    StreamError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Engine tuning knobs
///
/// Every field has a default, so an empty YAML/JSON object is a valid
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ping everyone after this long without any event
    #[serde(default = "default_idle_tick_ms")]
    pub idle_tick_ms: u64,

    /// Ping everyone this often regardless of traffic
    #[serde(default = "default_ping_broadcast_interval_ms")]
    pub ping_broadcast_interval_ms: u64,

    /// How often outstanding Pings are checked
    #[serde(default = "default_liveness_check_interval_ms")]
    pub liveness_check_interval_ms: u64,

    /// A Ping unanswered for longer than this marks the peer dead
    #[serde(default = "default_dead_peer_timeout_ms")]
    pub dead_peer_timeout_ms: u64,

    /// Receive buffer size beyond which buffered bytes are discarded
    #[serde(default = "default_receive_buffer_ceiling")]
    pub receive_buffer_ceiling: usize,

    /// Bytes requested per socket read
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// A frame write that cannot finish within this fails the connection
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Backoff schedule applied when a subscription's connection dies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub backoff: BackoffKind,

    /// First delay (and the step for linear backoff)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// None = retry forever
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<usize>,
}

fn default_idle_tick_ms() -> u64 {
    30_000
}

fn default_ping_broadcast_interval_ms() -> u64 {
    120_000
}

fn default_liveness_check_interval_ms() -> u64 {
    5_000
}

fn default_dead_peer_timeout_ms() -> u64 {
    35_000
}

fn default_receive_buffer_ceiling() -> usize {
    16 * 1024
}

fn default_read_chunk_size() -> usize {
    4096
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> Option<usize> {
    Some(10)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_tick_ms: default_idle_tick_ms(),
            ping_broadcast_interval_ms: default_ping_broadcast_interval_ms(),
            liveness_check_interval_ms: default_liveness_check_interval_ms(),
            dead_peer_timeout_ms: default_dead_peer_timeout_ms(),
            receive_buffer_ceiling: default_receive_buffer_ceiling(),
            read_chunk_size: default_read_chunk_size(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffKind::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl EngineConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("idle_tick_ms", self.idle_tick_ms),
            ("ping_broadcast_interval_ms", self.ping_broadcast_interval_ms),
            ("liveness_check_interval_ms", self.liveness_check_interval_ms),
            ("dead_peer_timeout_ms", self.dead_peer_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(StreamError::Configuration(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.read_chunk_size == 0 {
            return Err(StreamError::Configuration(
                "read_chunk_size must be greater than 0".to_string(),
            ));
        }

        if self.receive_buffer_ceiling < self.read_chunk_size {
            return Err(StreamError::Configuration(format!(
                "receive_buffer_ceiling ({}) must be at least read_chunk_size ({})",
                self.receive_buffer_ceiling, self.read_chunk_size
            )));
        }

        if self.dead_peer_timeout_ms <= self.liveness_check_interval_ms {
            return Err(StreamError::Configuration(format!(
                "dead_peer_timeout_ms ({}) must be larger than liveness_check_interval_ms ({})",
                self.dead_peer_timeout_ms, self.liveness_check_interval_ms
            )));
        }

        self.reconnect.validate()
    }

    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }

    pub fn ping_broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.ping_broadcast_interval_ms)
    }

    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_check_interval_ms)
    }

    pub fn dead_peer_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_peer_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Log configuration summary
    pub fn log(&self) {
        info!("Engine configuration:");
        info!("  Idle ping tick: {:?}", self.idle_tick());
        info!("  Ping broadcast interval: {:?}", self.ping_broadcast_interval());
        info!(
            "  Dead peer timeout: {:?} (checked every {:?})",
            self.dead_peer_timeout(),
            self.liveness_check_interval()
        );
        info!(
            "  Handshake timeout: {:?}, write timeout: {:?}",
            self.handshake_timeout(),
            self.write_timeout()
        );
        info!(
            "  Receive buffer ceiling: {} bytes, read chunk: {} bytes",
            self.receive_buffer_ceiling, self.read_chunk_size
        );
        info!(
            "  Reconnect: {:?} backoff, {}ms..{}ms, max attempts {:?}",
            self.reconnect.backoff,
            self.reconnect.initial_delay_ms,
            self.reconnect.max_delay_ms,
            self.reconnect.max_attempts
        );
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(StreamError::Configuration(format!(
                "reconnect.max_delay_ms ({}) must be at least initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        Ok(())
    }

    /// Build the configured backoff schedule
    pub fn strategy(&self) -> Box<dyn ReconnectionStrategy> {
        let initial = Duration::from_millis(self.initial_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);
        match self.backoff {
            BackoffKind::Fixed => Box::new(FixedDelay::new(initial, self.max_attempts)),
            BackoffKind::Linear => Box::new(LinearBackoff::new(initial, max, self.max_attempts)),
            BackoffKind::Exponential => {
                Box::new(ExponentialBackoff::new(initial, max, self.max_attempts))
            }
        }
    }
}

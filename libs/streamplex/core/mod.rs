//! # Streamplex Core
//!
//! The engine and the pieces it is built from, leaves first:
//!
//! - [`frame`]: RFC 6455 frame codec
//! - [`reassembler`]: fragmented message reassembly
//! - [`connection`] / [`registry`]: per-connection state and the id index
//! - [`liveness`] / [`keepalive`]: dead-peer detection and ping timers
//! - [`handshake`] / [`transport`]: HTTP Upgrade and the TCP/TLS connector
//! - [`supervisor`]: staged connection setup and reconnect backoff
//! - [`engine`]: the event loop tying it together
//!
//! ## Example
//!
//! ```rust,ignore
//! let (handler, events) = ChannelHandler::unbounded();
//!
//! let (engine, handle) = streamplex::builder()
//!     .url("wss://stream.binance.com:9443/ws")
//!     .handler(handler)
//!     .subscription(JsonMethodSubscription::new("@aggTrade"))
//!     .topics(["btcusdt", "ethusdt"])
//!     .build()?;
//!
//! let task = engine.spawn();
//!
//! while let Ok(event) = events.recv() {
//!     println!("{:?}", event);
//! }
//!
//! handle.shutdown();
//! task.await?;
//! ```

pub mod builder;
pub mod config;
pub mod connection;
pub mod engine;
pub mod frame;
pub mod handshake;
pub mod keepalive;
pub mod liveness;
pub mod metrics;
pub mod reassembler;
pub mod registry;
pub mod supervisor;
pub mod transport;

// Re-export main types
pub use builder::{states, EngineBuilder};
pub use config::{EngineConfig, ReconnectConfig};
pub use connection::{Connection, ConnectionId, ConnectionStatus, Dispatch};
pub use engine::{Command, Engine, EngineHandle};
pub use frame::{Decode, Frame, FrameError, OpCode};
pub use keepalive::{KeepaliveDue, KeepaliveScheduler};
pub use liveness::Liveness;
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use reassembler::{Assembly, Reassembler};
pub use registry::Registry;
pub use transport::TcpConnector;

// Re-export traits for convenience
pub use crate::traits::*;

/// Create a new engine builder
///
/// # Example
/// ```ignore
/// let (engine, handle) = streamplex::builder()
///     .url("wss://stream.binance.com:9443/ws")
///     .handler(MyHandler)
///     .topic("btcusdt")
///     .build()?;
/// ```
pub fn builder() -> EngineBuilder<states::NoEndpoint, states::NoHandler, ()> {
    EngineBuilder::new()
}

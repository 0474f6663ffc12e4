//! # Streamplex
//!
//! A client-side engine that keeps many WebSocket subscriptions to a single
//! streaming endpoint alive on one event loop.
//!
//! ## Features
//!
//! - **Incremental codec**: Frames decoded from arbitrary read boundaries, fragments reassembled
//! - **Single-task event loop**: One tokio task per engine, no locks on the hot path
//! - **Liveness**: Idle and periodic pings, dead-peer eviction on unanswered pings
//! - **Supervised reconnects**: Staged setup with pluggable backoff and a retry bound
//! - **Type-state builder**: Compile-time guarantees for required configuration
//! - **Sharding**: [`EnginePool`] spreads topics over engines on separate threads

pub mod traits;
pub mod core;
pub mod manager;

// Re-export all traits
pub use traits::*;

// Re-export core engine functionality
pub use crate::core::{
    builder, config, connection, engine, frame, metrics,
    builder::{states, EngineBuilder},
    config::{EngineConfig, ReconnectConfig},
    connection::{ConnectionId, ConnectionStatus},
    engine::{Engine, EngineHandle},
    metrics::{EngineMetrics, MetricsSnapshot},
    transport::TcpConnector,
};

// Re-export manager
pub use manager::EnginePool;

// Convenience function
pub use crate::core::builder as engine_builder;

/// Type alias for Result with StreamError
pub type Result<T> = std::result::Result<T, traits::StreamError>;

//! # Streamplex Manager
//!
//! Sharding of topics across several engines, each on its own thread.

pub mod pool;

pub use pool::EnginePool;
pub use crate::core::*;
pub use crate::traits::*;

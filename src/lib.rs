//! Streamplex feed - main library
//!
//! Application layer around the `streamplex` engine: configuration loading,
//! logging setup and the runner shared by the binaries.
//!
//! ## Architecture
//!
//! - **bin_common**: Common utilities for binary executables (CLI, config, runner)
//! - **streamplex**: Multi-connection WebSocket engine (re-exported from workspace)
//!
//! ## Usage in Binaries
//!
//! ```ignore
//! use streamplex_feed::bin_common::{load_config_from_env, ConfigType, FeedConfig};
//!
//! let config = FeedConfig::load(load_config_from_env(ConfigType::Streams))?;
//! ```

// Re-export workspace libraries for convenience
pub use streamplex;

// Binary common utilities
pub mod bin_common {
    //! Common utilities for binary executables

    pub mod cli;
    pub mod config;
    pub mod runner;

    pub use cli::{load_config_from_env, parse_args, ConfigType, STREAMS_PATH_ENV_VAR};
    pub use config::{ConfigError, FeedConfig};
    pub use runner::{init_tracing, BinaryRunner, RunConfig};
}

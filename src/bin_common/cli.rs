//! Configuration file lookup for binaries
//!
//! A path given on the command line wins; otherwise the shipped streams config
//! is used, unless `STREAMS_CONFIG_PATH` points elsewhere.

use std::path::PathBuf;

/// Environment variable overriding the streams config location
pub const STREAMS_PATH_ENV_VAR: &str = "STREAMS_CONFIG_PATH";

const STREAMS_DEFAULT_PATH: &str = "config/streams.yaml";

/// Which configuration file to load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigType {
    /// `config/streams.yaml`, or `STREAMS_CONFIG_PATH` when set
    Streams,
    /// Explicit path; the environment is not consulted
    Custom(PathBuf),
}

impl ConfigType {
    /// First positional argument as a custom path, else [`ConfigType::Streams`]
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        args.into_iter()
            .map(Into::into)
            .find(|arg: &String| !arg.starts_with('-'))
            .map(|path| ConfigType::Custom(PathBuf::from(path)))
            .unwrap_or(ConfigType::Streams)
    }
}

/// Resolve the configuration path for `config_type`
///
/// # Examples
/// ```ignore
/// use streamplex_feed::bin_common::{load_config_from_env, parse_args, ConfigType};
///
/// let path = load_config_from_env(ConfigType::from_args(parse_args()));
/// ```
pub fn load_config_from_env(config_type: ConfigType) -> PathBuf {
    match config_type {
        ConfigType::Custom(path) => path,
        ConfigType::Streams => std::env::var_os(STREAMS_PATH_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(STREAMS_DEFAULT_PATH)),
    }
}

/// Command line arguments, excluding the program name
pub fn parse_args() -> Vec<String> {
    std::env::args().skip(1).collect()
}

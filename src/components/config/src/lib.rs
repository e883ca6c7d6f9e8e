//!
//! # Platform-chain configuration
//!
//! Staking bounds, fees and the reward schedule, loaded from toml.
//!

#![deny(missing_docs)]

pub mod staking;

use thiserror::Error;

/// Failures while loading or writing a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be opened, created or written.
    #[error("config io on `{path}`: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying io failure.
        source: std::io::Error,
    },
    /// The file exists but is neither valid toml nor valid json.
    #[error("config parse on `{path}`: {msg}")]
    Parse {
        /// Offending path.
        path: String,
        /// Parser message.
        msg: String,
    },
    /// The values parse but contradict each other.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result alias for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be parsed.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration parsed but holds inconsistent values.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

// src/error.rs
use std::io;
use thiserror::Error;

/// Result type used throughout the forwarder
pub type Result<T> = std::result::Result<T, ForwarderError>;

/// Custom Error type for the forwarder
#[derive(Error, Debug)]
pub enum ForwarderError {
    /// Object type or family could not be resolved for a sample
    #[error("Lookup error: {0}")]
    Lookup(String),

    /// A sample could not be turned into a point
    #[error("Encode error: {0}")]
    Encode(String),

    /// Socket or HTTP failure
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl ForwarderError {
    /// Build a transport error with some context about what was attempted
    pub fn transport(context: &str, err: impl std::fmt::Display) -> Self {
        ForwarderError::Transport(format!("{}: {}", context, err))
    }

    pub fn is_lookup(&self) -> bool {
        matches!(self, ForwarderError::Lookup(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ForwarderError::Transport(_))
    }
}

impl From<reqwest::Error> for ForwarderError {
    fn from(err: reqwest::Error) -> Self {
        ForwarderError::Transport(err.to_string())
    }
}

impl From<config::ConfigError> for ForwarderError {
    fn from(err: config::ConfigError) -> Self {
        ForwarderError::Config(err.to_string())
    }
}

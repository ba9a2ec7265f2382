//! Stage error types

use crate::poll::PollTimeout;
use thiserror::Error;

/// Stage errors
///
/// Every implementation (built-in, VirtualBox, plugin) reports failures through
/// this taxonomy so the caller can render the deepest message verbatim.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("invalid stage configuration: {0}")]
    Configuration(String),

    #[error("{program} failed: {stderr}")]
    Process { program: String, stderr: String },

    #[error("host-only network {network} collides with host interface {interface}; choose another range")]
    NetworkCollision { network: String, interface: String },

    #[error(transparent)]
    Timeout(#[from] PollTimeout),

    #[error("cannot {operation} stage '{stage}' while it is {status}")]
    InvalidState {
        stage: String,
        operation: &'static str,
        status: String,
    },

    #[error("stage has not been initialized")]
    NotInitialized,

    #[error("stage type '{stage_type}' does not support {operation}")]
    Unsupported {
        stage_type: String,
        operation: &'static str,
    },

    #[error("stage is locked: {0}")]
    Locked(String),

    #[error("no plugin found for stage type '{stage_type}' (searched: {searched})")]
    PluginNotFound { stage_type: String, searched: String },

    #[error("plugin handshake failed: {0}")]
    Handshake(String),

    #[error("{0}")]
    Remote(String),

    #[error("{0}")]
    Provider(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<dodo_config::ConfigError> for StageError {
    fn from(err: dodo_config::ConfigError) -> Self {
        StageError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StageError>;

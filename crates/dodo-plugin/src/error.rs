//! Plugin error types

use dodo_stage::StageError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("no plugin found for stage type '{stage_type}'")]
    NotFound {
        stage_type: String,
        searched: Vec<PathBuf>,
    },

    #[error("plugin handshake failed: {0}")]
    Handshake(String),

    #[error("plugin protocol error: {0}")]
    Protocol(String),

    #[error("plugin closed the connection")]
    Closed,

    #[error("{0}")]
    Remote(String),

    #[error("invalid stage configuration blob: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PluginError> for StageError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::NotFound {
                stage_type,
                searched,
            } => StageError::PluginNotFound {
                stage_type,
                searched: searched
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            },
            PluginError::Handshake(message) => StageError::Handshake(message),
            PluginError::Remote(message) => StageError::Remote(message),
            PluginError::Stage(inner) => inner,
            PluginError::Json(e) => StageError::Json(e),
            PluginError::Io(e) => StageError::Io(e),
            other => StageError::Provider(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;

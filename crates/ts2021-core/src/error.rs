use thiserror::Error;

use crate::capver::{self, CapabilityVersion};

/// Errors produced by the TS2021 protocol layer.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("unsupported client version: {} ({})", capver::display_version(*.0), .0)]
    UnsupportedClientVersion(CapabilityVersion),

    #[error("peer sent error: {0}")]
    PeerError(String),

    #[error("connection closed")]
    Closed,

    #[error("noise error: {0}")]
    Noise(#[from] snow::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ControlResult<T> = Result<T, ControlError>;

use hrp_common::token::AuthError;
use thiserror::Error;

use crate::registry::RegistryError;

/// Errors that can occur during relay server operation.
#[derive(Error, Debug)]
pub enum HrpsError {
    /// The presented access token was rejected.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    /// A registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A network write did not complete within the configured bound.
    #[error("write timed out")]
    WriteTimeout,
    /// The connection was closed by the remote peer or by policy.
    #[error("connection closed")]
    ConnectionClosed,
}

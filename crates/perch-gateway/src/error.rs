use thiserror::Error;

/// Gateway-related errors.
///
/// Only [`GatewayError::MissingToken`] and [`GatewayError::AlreadyConnected`]
/// surface to callers; everything else drives state-machine transitions and
/// is observable through the debug sink.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no credential set; provide a token before connecting")]
    MissingToken,

    #[error("session is already connected")]
    AlreadyConnected,

    #[error("session has shut down")]
    Shutdown,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

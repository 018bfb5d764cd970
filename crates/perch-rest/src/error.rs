use std::time::Duration;

use thiserror::Error;

/// Unified error type for REST operations.
#[derive(Error, Debug)]
pub enum RestError {
    #[error("missing or invalid credential")]
    Auth,

    #[error("rate limited on {route} (bucket {bucket}, global: {global}), reset after {reset_after:?}")]
    RateLimited {
        route: String,
        bucket: String,
        global: bool,
        reset_after: Duration,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server error: {status} on {method} {url}")]
    Server {
        method: String,
        url: String,
        status: u16,
    },

    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RestError>;

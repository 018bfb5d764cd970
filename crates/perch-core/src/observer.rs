//! Debug observability
//!
//! A closed set of typed debug records and the sink interface they fan out
//! through. The REST dispatcher and the gateway session emit these instead
//! of free-form event arguments.

use std::time::Duration;

/// A structured debug record emitted by the transport layer.
#[derive(Debug, Clone)]
pub enum DebugEvent {
    /// An outgoing HTTP request is about to be sent.
    Request {
        method: String,
        url: String,
        route: String,
        attempt: u32,
    },
    /// An HTTP response was received.
    Response { method: String, url: String, status: u16 },
    /// A rate limit was hit or is expected.
    RateLimit {
        route: String,
        bucket: String,
        method: String,
        global: bool,
        reset_after: Duration,
    },
    /// A hash entry or bucket was evicted by a sweep.
    Sweep { kind: SweepKind, key: String },
    /// A gateway lifecycle note (connection, heartbeat, resume).
    Gateway { message: String },
}

/// What a sweep evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    Hash,
    Bucket,
}

/// Receives [`DebugEvent`] records.
///
/// Implementations must be cheap and non-blocking; they are called on the
/// request path.
pub trait DebugSink: Send + Sync {
    fn emit(&self, event: DebugEvent);
}

/// Default sink that forwards every record to `tracing::debug!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DebugSink for TracingSink {
    fn emit(&self, event: DebugEvent) {
        match event {
            DebugEvent::Request {
                method,
                url,
                route,
                attempt,
            } => {
                tracing::debug!(%method, %url, %route, attempt, "sending request");
            }
            DebugEvent::Response { method, url, status } => {
                tracing::debug!(%method, %url, status, "received response");
            }
            DebugEvent::RateLimit {
                route,
                bucket,
                method,
                global,
                reset_after,
            } => {
                tracing::debug!(
                    %route,
                    %bucket,
                    %method,
                    global,
                    reset_after_ms = reset_after.as_millis() as u64,
                    "rate limited"
                );
            }
            DebugEvent::Sweep { kind, key } => {
                tracing::debug!(?kind, %key, "swept idle entry");
            }
            DebugEvent::Gateway { message } => {
                tracing::debug!(%message, "gateway");
            }
        }
    }
}

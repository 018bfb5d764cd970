//! Gateway collaborator interfaces
//!
//! The transport core never owns entity schemas or handler tables; it only
//! pushes decoded payloads through these two narrow seams.

use serde_json::Value;

/// Event-dispatch table keyed by gateway event name.
///
/// Called once per inbound dispatch event, in receipt order for a given
/// connection.
pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: &str, payload: Value);
}

/// Write-through entity cache.
///
/// Invoked with the decoded payload before the event reaches the dispatch
/// table, so handlers observe an up-to-date cache.
pub trait EntityCache: Send + Sync {
    fn apply(&self, event: &str, payload: &Value);
}

/// Cache that ignores everything. Useful for cache-less consumers and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl EntityCache for NoopCache {
    fn apply(&self, _event: &str, _payload: &Value) {}
}

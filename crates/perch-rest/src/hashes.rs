//! Route hash registry
//!
//! Remembers which rate-limit bucket the server last reported for each
//! canonicalized (method, route pattern) pair. Entries idle longer than the
//! configured lifetime are swept.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use perch_core::observer::{DebugEvent, DebugSink, SweepKind};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct HashEntry {
    bucket_id: String,
    last_access: Instant,
}

/// Maps `"{method}:{bucket_route}"` to the last server-reported bucket id.
#[derive(Debug, Default)]
pub struct RouteHashRegistry {
    entries: DashMap<String, HashEntry>,
}

impl RouteHashRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn key(method: &str, bucket_route: &str) -> String {
        format!("{}:{}", method, bucket_route)
    }

    /// Return the learned bucket id for a route, or a synthesized ungrouped
    /// id when the server has not revealed one yet. Every route starts in
    /// its own bucket. Refreshes the entry's last access.
    pub fn resolve(&self, method: &str, bucket_route: &str) -> String {
        let key = Self::key(method, bucket_route);
        match self.entries.get_mut(&key) {
            Some(mut entry) => {
                entry.last_access = Instant::now();
                entry.bucket_id.clone()
            }
            None => format!("Global({})", key),
        }
    }

    /// Record (or overwrite) the bucket id the server reported for a route.
    pub fn record(&self, method: &str, bucket_route: &str, bucket_id: &str) {
        let key = Self::key(method, bucket_route);
        self.entries.insert(
            key,
            HashEntry {
                bucket_id: bucket_id.to_string(),
                last_access: Instant::now(),
            },
        );
    }

    /// Refresh the last access of an existing mapping without changing it.
    pub fn touch(&self, method: &str, bucket_route: &str) {
        if let Some(mut entry) = self.entries.get_mut(&Self::key(method, bucket_route)) {
            entry.last_access = Instant::now();
        }
    }

    /// Evict entries idle longer than `lifetime`. Requests already holding
    /// a resolved hash are unaffected; only future resolves change.
    pub fn sweep(&self, lifetime: Duration, sink: &Arc<dyn DebugSink>) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| now.duration_since(entry.value().last_access) > lifetime)
            .map(|entry| entry.key().clone())
            .collect();

        let count = stale.len();
        for key in stale {
            self.entries.remove(&key);
            sink.emit(DebugEvent::Sweep {
                kind: SweepKind::Hash,
                key,
            });
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

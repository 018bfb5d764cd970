//! Request bucket
//!
//! Serializes all calls sharing a (bucket id, major parameter) pair and
//! enforces the limits the server has declared for that bucket: the local
//! window from the rate-limit headers, the shared global ceiling, and the
//! retry budget for transient failures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use perch_core::observer::{DebugEvent, DebugSink};
use perch_core::routes::RouteData;
use perch_core::TokenProvider;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{RestError, Result};
use crate::global::GlobalQuota;
use crate::hashes::RouteHashRegistry;
use crate::options::RestOptions;
use crate::transport::{HttpTransport, TransportFailure, TransportRequest};

/// A decoded successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum RestResponse {
    /// A JSON body.
    Json(serde_json::Value),
    /// A non-JSON body, returned as raw bytes.
    Binary(Vec<u8>),
    /// No content (204).
    Empty,
}

/// Everything the dispatcher owns and every bucket shares.
pub(crate) struct SharedState {
    pub options: RestOptions,
    pub token: Arc<TokenProvider>,
    pub transport: Arc<dyn HttpTransport>,
    pub sink: Arc<dyn DebugSink>,
    pub hashes: Arc<RouteHashRegistry>,
    pub global: GlobalQuota,
    pub invalid: InvalidRequestTracker,
}

#[derive(Debug)]
struct LocalLimit {
    /// Max requests per window; `None` until the server declares one.
    limit: Option<u32>,
    remaining: u32,
    reset_at: Option<Instant>,
}

/// One serialized execution queue for a (bucket id, major parameter) pair.
pub struct RequestBucket {
    hash_id: String,
    queue: tokio::sync::Mutex<()>,
    state: Mutex<LocalLimit>,
    pending: AtomicUsize,
    shared: Arc<SharedState>,
}

impl RequestBucket {
    pub(crate) fn new(hash_id: String, shared: Arc<SharedState>) -> Self {
        Self {
            hash_id,
            queue: tokio::sync::Mutex::new(()),
            state: Mutex::new(LocalLimit {
                limit: None,
                remaining: 1,
                reset_at: None,
            }),
            pending: AtomicUsize::new(0),
            shared,
        }
    }

    /// The bucket id this queue was created under. A differing id in a
    /// response only affects future resolutions, never this queue.
    pub fn hash_id(&self) -> &str {
        &self.hash_id
    }

    /// Inactive buckets have no queued work and no pending limit; the
    /// dispatcher sweeps them to bound memory.
    pub fn is_inactive(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0 && !self.limited()
    }

    fn local_wait(&self) -> Option<Duration> {
        let state = self.state.lock().expect("bucket state lock poisoned");
        match state.reset_at {
            Some(reset_at) if state.remaining == 0 => {
                let now = Instant::now();
                (now < reset_at).then(|| reset_at - now)
            }
            _ => None,
        }
    }

    fn limited(&self) -> bool {
        self.local_wait().is_some() || self.shared.global.exhausted_for().is_some()
    }

    /// Queue behind any call already running on this bucket and execute.
    /// FIFO; the fair async mutex guarantees enqueue order equals execution
    /// order.
    pub async fn enqueue(&self, request: TransportRequest, route: RouteData) -> Result<RestResponse> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let result = async {
            let _guard = self.queue.lock().await;
            self.run(request, &route).await
        }
        .await;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        result
    }

    async fn run(&self, request: TransportRequest, route: &RouteData) -> Result<RestResponse> {
        let method = request.method.as_str().to_string();
        let mut attempt: u32 = 0;

        loop {
            // Wait (or error, per policy) while the bucket is limited.
            // Bounded only by the server-declared reset times. The global
            // slot is checked and consumed in one atomic step so parallel
            // buckets cannot slip past the shared ceiling.
            loop {
                let (global, wait) = if let Some(wait) = self.local_wait() {
                    (false, wait)
                } else {
                    match self.shared.global.try_acquire() {
                        Ok(()) => break,
                        Err(wait) => (true, wait),
                    }
                };

                self.shared.sink.emit(DebugEvent::RateLimit {
                    route: route.full_route.clone(),
                    bucket: self.hash_id.clone(),
                    method: method.clone(),
                    global,
                    reset_after: wait,
                });

                if self.shared.options.thrown_rate_limit {
                    return Err(RestError::RateLimited {
                        route: route.full_route.clone(),
                        bucket: self.hash_id.clone(),
                        global,
                        reset_after: wait,
                    });
                }

                tokio::time::sleep(wait).await;
            }

            self.shared.sink.emit(DebugEvent::Request {
                method: method.clone(),
                url: request.url.clone(),
                route: route.full_route.clone(),
                attempt,
            });

            let response = match self.shared.transport.execute(request.clone()).await {
                Ok(response) => response,
                Err(TransportFailure::TimedOut) if attempt < self.shared.options.retries => {
                    attempt += 1;
                    continue;
                }
                Err(failure) => return Err(RestError::Transport(failure.to_string())),
            };

            let status = response.status;
            self.shared.sink.emit(DebugEvent::Response {
                method: method.clone(),
                url: request.url.clone(),
                status: status.as_u16(),
            });

            let headers = RateLimitHeaders::parse(&response.headers);
            self.apply_headers(&headers);
            self.record_hash(&method, route, headers.bucket.as_deref());

            if matches!(status.as_u16(), 401 | 403 | 429) {
                self.shared.invalid.record(
                    self.shared.options.invalid_requests_warning_interval,
                );
            }

            if status.is_success() {
                return decode_body(&response.headers, status, response.body);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                // Re-derive whether the limit was global or local and go
                // back around; the wait loop above does the sleeping. This
                // path does not consume the retry budget.
                let (global, wait) = match self.shared.global.exhausted_for() {
                    Some(wait) => (true, wait),
                    None => {
                        let wait = headers
                            .retry_after
                            .or_else(|| self.local_wait())
                            .unwrap_or_default();
                        (false, wait)
                    }
                };

                self.shared.sink.emit(DebugEvent::RateLimit {
                    route: route.full_route.clone(),
                    bucket: self.hash_id.clone(),
                    method: method.clone(),
                    global,
                    reset_after: wait,
                });

                if self.shared.options.thrown_rate_limit {
                    return Err(RestError::RateLimited {
                        route: route.full_route.clone(),
                        bucket: self.hash_id.clone(),
                        global,
                        reset_after: wait,
                    });
                }

                // A 429 carrying only Retry-After leaves the local state
                // open after apply_headers; fold the server's hint into the
                // local reset so the wait loop honors it.
                if !global && !wait.is_zero() {
                    let mut state = self.state.lock().expect("bucket state lock poisoned");
                    let reset_at = Instant::now() + wait;
                    state.remaining = 0;
                    if state.reset_at.is_none_or(|t| t < reset_at) {
                        state.reset_at = Some(reset_at);
                    }
                }
                continue;
            }

            if status.is_server_error() {
                if attempt < self.shared.options.retries {
                    attempt += 1;
                    continue;
                }
                return Err(RestError::Server {
                    method,
                    url: request.url.clone(),
                    status: status.as_u16(),
                });
            }

            if matches!(status.as_u16(), 401 | 403) {
                // Fail fast on every later call until a new token arrives.
                self.shared.token.invalidate();
                return Err(RestError::Auth);
            }

            // Remaining 4xx: surface the decoded error body verbatim.
            let body = match serde_json::from_slice::<serde_json::Value>(&response.body) {
                Ok(value) => value.to_string(),
                Err(_) => String::from_utf8_lossy(&response.body).into_owned(),
            };
            return Err(RestError::Client {
                status: status.as_u16(),
                body,
            });
        }
    }

    /// Update local quota state from the rate-limit response headers.
    fn apply_headers(&self, headers: &RateLimitHeaders) {
        let offset = self.shared.options.offset;
        let mut state = self.state.lock().expect("bucket state lock poisoned");
        state.limit = headers.limit;
        state.remaining = headers.remaining.unwrap_or(1);
        state.reset_at = Some(match headers.reset_after {
            Some(delay) => Instant::now() + delay + offset,
            None => Instant::now(),
        });
    }

    /// Record a server-revealed bucket id. The queue's own identity never
    /// changes mid-flight; only future resolutions pick up the new mapping.
    fn record_hash(&self, method: &str, route: &RouteData, reported: Option<&str>) {
        match reported {
            Some(bucket_id) if bucket_id != self.hash_id => {
                self.shared
                    .hashes
                    .record(method, &route.bucket_route, bucket_id);
            }
            Some(_) => self.shared.hashes.touch(method, &route.bucket_route),
            None => {}
        }
    }
}

fn decode_body(
    headers: &HeaderMap,
    status: StatusCode,
    body: Vec<u8>,
) -> Result<RestResponse> {
    if status == StatusCode::NO_CONTENT || body.is_empty() {
        return Ok(RestResponse::Empty);
    }
    let is_json = headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if is_json {
        Ok(RestResponse::Json(serde_json::from_slice(&body)?))
    } else {
        Ok(RestResponse::Binary(body))
    }
}

/// The four rate-limit headers plus `Retry-After`, decoded.
#[derive(Debug, Default, Clone)]
pub(crate) struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    pub fn parse(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let number = |name: &str| text(name).and_then(|v| v.parse::<u32>().ok());
        // Reset delays may be fractional seconds.
        let seconds = |name: &str| {
            text(name)
                .and_then(|v| v.parse::<f64>().ok())
                .map(Duration::from_secs_f64)
        };

        Self {
            limit: number("X-RateLimit-Limit"),
            remaining: number("X-RateLimit-Remaining"),
            reset_after: seconds("X-RateLimit-Reset-After"),
            bucket: text("X-RateLimit-Bucket"),
            retry_after: seconds("Retry-After"),
        }
    }
}

/// Process-wide counter for 401/403/429 responses. Warns periodically so a
/// misbehaving caller is visible before the platform bans the client.
#[derive(Debug, Default)]
pub(crate) struct InvalidRequestTracker {
    state: Mutex<InvalidWindow>,
}

#[derive(Debug, Default)]
struct InvalidWindow {
    count: u64,
    reset_at: Option<Instant>,
}

impl InvalidRequestTracker {
    const WINDOW: Duration = Duration::from_secs(600);

    pub fn record(&self, warn_interval: u32) {
        let mut state = self.state.lock().expect("invalid tracker lock poisoned");
        let now = Instant::now();
        if state.reset_at.is_none_or(|t| t < now) {
            state.reset_at = Some(now + Self::WINDOW);
            state.count = 0;
        }
        state.count += 1;
        if warn_interval > 0 && state.count % u64::from(warn_interval) == 0 {
            warn!(
                count = state.count,
                "high invalid request volume in the current ten-minute window"
            );
        }
    }

    #[cfg(test)]
    pub fn count(&self) -> u64 {
        self.state
            .lock()
            .expect("invalid tracker lock poisoned")
            .count
    }
}

//! REST dispatcher façade
//!
//! Canonicalizes routes, resolves buckets through the hash registry, builds
//! the final URL/headers/body, and forwards to the owning bucket's queue.
//! Also owns the periodic hash and bucket sweeps.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use perch_core::observer::{DebugEvent, DebugSink, SweepKind, TracingSink};
use perch_core::routes::{resolve_route, RouteData};
use perch_core::TokenProvider;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::Method;
use tokio::task::JoinHandle;

use crate::bucket::{RequestBucket, RestResponse, SharedState};
use crate::error::{RestError, Result};
use crate::global::GlobalQuota;
use crate::hashes::RouteHashRegistry;
use crate::options::{RequestOptions, RestOptions};
use crate::transport::{HttpTransport, RequestBody, ReqwestTransport, TransportRequest};

const BASE_USER_AGENT: &str = concat!("Perch (https://perch.rs, ", env!("CARGO_PKG_VERSION"), ")");

/// Sweep intervals above this are a configuration error, not a default to
/// clamp.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(4 * 3600);

/// The request dispatcher.
///
/// Cheap to share behind an `Arc`; every bucket runs independently and the
/// only cross-bucket coupling is the global requests-per-second window.
pub struct Rest {
    shared: Arc<SharedState>,
    buckets: Arc<DashMap<String, Arc<RequestBucket>>>,
    sweepers: Vec<JoinHandle<()>>,
}

impl Rest {
    /// Create a dispatcher with default options and the default transport.
    ///
    /// Must be called within a tokio runtime; the sweep tasks are spawned
    /// here.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_options(token, RestOptions::default())
    }

    /// Create a dispatcher with custom options.
    pub fn with_options(token: impl Into<String>, options: RestOptions) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(options.timeout)?);
        let token = Arc::new(TokenProvider::new(options.auth_prefix.clone(), token));
        Self::with_parts(options, token, transport, Arc::new(TracingSink))
    }

    /// Create a dispatcher from explicit collaborators: a token provider, a
    /// custom outbound transport, and a debug sink.
    pub fn with_parts(
        options: RestOptions,
        token: Arc<TokenProvider>,
        transport: Arc<dyn HttpTransport>,
        sink: Arc<dyn DebugSink>,
    ) -> Result<Self> {
        check_sweep_interval(options.hash_sweep_interval)?;
        check_sweep_interval(options.bucket_sweep_interval)?;

        let shared = Arc::new(SharedState {
            global: GlobalQuota::new(options.global_requests_per_second),
            invalid: Default::default(),
            hashes: Arc::new(RouteHashRegistry::new()),
            token,
            transport,
            sink,
            options,
        });
        let buckets = Arc::new(DashMap::new());

        let mut rest = Self {
            shared,
            buckets,
            sweepers: Vec::new(),
        };
        rest.spawn_sweepers();
        Ok(rest)
    }

    fn spawn_sweepers(&mut self) {
        let shared = Arc::clone(&self.shared);
        let hash_interval = shared.options.hash_sweep_interval;
        let hash_lifetime = shared.options.hash_lifetime;
        self.sweepers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hash_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                shared.hashes.sweep(hash_lifetime, &shared.sink);
            }
        }));

        let shared = Arc::clone(&self.shared);
        let buckets = Arc::clone(&self.buckets);
        let bucket_interval = shared.options.bucket_sweep_interval;
        self.sweepers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bucket_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                buckets.retain(|key, bucket| {
                    if bucket.is_inactive() {
                        shared.sink.emit(DebugEvent::Sweep {
                            kind: SweepKind::Bucket,
                            key: key.clone(),
                        });
                        false
                    } else {
                        true
                    }
                });
            }
        }));
    }

    /// The credential provider; callers replace or inspect the token here.
    pub fn token(&self) -> &Arc<TokenProvider> {
        &self.shared.token
    }

    /// The hash registry (exposed for inspection).
    pub fn hashes(&self) -> &Arc<RouteHashRegistry> {
        &self.shared.hashes
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Send a request through the owning bucket's queue.
    pub async fn request(
        &self,
        method: Method,
        route: &str,
        options: RequestOptions,
    ) -> Result<RestResponse> {
        let route_data = resolve_route(route);
        let bucket_id = self
            .shared
            .hashes
            .resolve(method.as_str(), &route_data.bucket_route);
        let bucket = self.bucket_for(&bucket_id, &route_data.major_parameter);
        let request = self.resolve_request(method, &route_data, options)?;
        bucket.enqueue(request, route_data).await
    }

    pub async fn get(&self, route: &str, options: RequestOptions) -> Result<RestResponse> {
        self.request(Method::GET, route, options).await
    }

    pub async fn post(
        &self,
        route: &str,
        body: Option<serde_json::Value>,
        mut options: RequestOptions,
    ) -> Result<RestResponse> {
        options.body = body.or(options.body);
        self.request(Method::POST, route, options).await
    }

    pub async fn put(
        &self,
        route: &str,
        body: Option<serde_json::Value>,
        mut options: RequestOptions,
    ) -> Result<RestResponse> {
        options.body = body.or(options.body);
        self.request(Method::PUT, route, options).await
    }

    pub async fn patch(
        &self,
        route: &str,
        body: Option<serde_json::Value>,
        mut options: RequestOptions,
    ) -> Result<RestResponse> {
        options.body = body.or(options.body);
        self.request(Method::PATCH, route, options).await
    }

    pub async fn delete(&self, route: &str, options: RequestOptions) -> Result<RestResponse> {
        self.request(Method::DELETE, route, options).await
    }

    /// Fetch or create the bucket owning (bucket id, major parameter).
    fn bucket_for(&self, bucket_id: &str, major_parameter: &str) -> Arc<RequestBucket> {
        let key = format!("{}:{}", bucket_id, major_parameter);
        self.buckets
            .entry(key)
            .or_insert_with(|| {
                Arc::new(RequestBucket::new(
                    bucket_id.to_string(),
                    Arc::clone(&self.shared),
                ))
            })
            .clone()
    }

    /// Build the final URL, headers and body for a request.
    fn resolve_request(
        &self,
        method: Method,
        route: &RouteData,
        options: RequestOptions,
    ) -> Result<TransportRequest> {
        let opts = &self.shared.options;

        let version = if options.versioned {
            format!("/v{}", opts.version)
        } else {
            String::new()
        };
        let query = options
            .query
            .map(|q| format!("?{}", q))
            .unwrap_or_default();
        let url = format!("{}{}{}{}", opts.api, version, route.full_route, query);

        let mut headers = HeaderMap::new();
        let user_agent = format!("{} {}", BASE_USER_AGENT, opts.user_agent_suffix);
        headers.insert(USER_AGENT, header_value(user_agent.trim())?);

        if options.auth {
            let authorization = self
                .shared
                .token
                .authorization()
                .ok_or(RestError::Auth)?;
            headers.insert(AUTHORIZATION, header_value(&authorization)?);
        }

        if let Some(reason) = options.reason.as_deref() {
            headers.insert("X-Audit-Log-Reason", header_value(reason)?);
        }

        for (name, value) in opts.headers.iter() {
            headers.insert(header_name(name)?, header_value(value)?);
        }
        for (name, value) in &options.headers {
            headers.insert(header_name(name)?, header_value(value)?);
        }

        let payload = options
            .body
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()?;
        let body = if options.files.is_empty() {
            match payload {
                Some(bytes) => RequestBody::Json(bytes),
                None => RequestBody::None,
            }
        } else {
            RequestBody::Multipart {
                files: options.files,
                payload_json: payload,
            }
        };

        Ok(TransportRequest {
            method,
            url,
            headers,
            body,
        })
    }
}

impl Drop for Rest {
    fn drop(&mut self) {
        for sweeper in &self.sweepers {
            sweeper.abort();
        }
    }
}

fn check_sweep_interval(interval: Duration) -> Result<()> {
    if interval > MAX_SWEEP_INTERVAL {
        return Err(RestError::Config(
            "sweep intervals cannot exceed 4 hours".to_string(),
        ));
    }
    Ok(())
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| RestError::Config(format!("invalid header name {}: {}", name, e)))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| RestError::Config(format!("invalid header value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_sweep_intervals_over_four_hours() {
        let options = RestOptions {
            hash_sweep_interval: Duration::from_secs(5 * 3600),
            ..Default::default()
        };
        let rest = Rest::with_options("token", options);
        assert!(matches!(rest, Err(RestError::Config(_))));
    }

    #[tokio::test]
    async fn test_request_fails_fast_without_token() {
        let rest = Rest::new("abc").unwrap();
        rest.token().invalidate();
        let err = rest
            .get("/users/@me", RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RestError::Auth));
    }

    #[tokio::test]
    async fn test_unversioned_requests_skip_version_segment() {
        let rest = Rest::new("abc").unwrap();
        let route = resolve_route("/gateway/bot");
        let request = rest
            .resolve_request(
                Method::GET,
                &route,
                RequestOptions {
                    versioned: false,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(request.url, "https://discord.com/api/gateway/bot");
    }

    #[tokio::test]
    async fn test_resolved_request_carries_auth_and_reason() {
        let rest = Rest::new("abc").unwrap();
        let route = resolve_route("/channels/886631972233949286");
        let request = rest
            .resolve_request(
                Method::DELETE,
                &route,
                RequestOptions::default().with_reason("cleanup"),
            )
            .unwrap();
        assert_eq!(request.url, "https://discord.com/api/v9/channels/886631972233949286");
        assert_eq!(request.headers.get(AUTHORIZATION).unwrap(), "Bot abc");
        assert_eq!(request.headers.get("X-Audit-Log-Reason").unwrap(), "cleanup");
    }

    #[tokio::test]
    async fn test_files_switch_body_to_multipart_with_payload_json() {
        let rest = Rest::new("abc").unwrap();
        let route = resolve_route("/channels/886631972233949286/messages");
        let options = RequestOptions::default()
            .with_body(serde_json::json!({"content": "hi"}))
            .with_file(crate::transport::AttachedFile::new("a.png", vec![1, 2]));
        let request = rest
            .resolve_request(Method::POST, &route, options)
            .unwrap();
        match request.body {
            RequestBody::Multipart {
                files,
                payload_json,
            } => {
                assert_eq!(files.len(), 1);
                let payload: serde_json::Value =
                    serde_json::from_slice(&payload_json.unwrap()).unwrap();
                assert_eq!(payload["content"], "hi");
            }
            other => panic!("expected multipart body, got {:?}", other),
        }
    }
}

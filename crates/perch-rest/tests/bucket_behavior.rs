//! Behavior tests for bucket serialization, rate-limit waits and retries,
//! driven through a scripted mock transport under paused time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use perch_core::observer::TracingSink;
use perch_core::TokenProvider;
use perch_rest::{
    HttpTransport, RequestOptions, Rest, RestError, RestOptions, RestResponse,
    TransportFailure, TransportRequest, TransportResponse,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use tokio::time::Instant;

struct Scripted {
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
    timed_out: bool,
}

impl Scripted {
    fn ok_json() -> Self {
        Self {
            status: StatusCode::OK,
            headers: vec![("Content-Type", "application/json".to_string())],
            body: br#"{"ok":true}"#.to_vec(),
            timed_out: false,
        }
    }

    fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Self::ok_json()
        }
    }

    fn with_rate_limit(mut self, limit: u32, remaining: u32, reset_after: &str) -> Self {
        self.headers.push(("X-RateLimit-Limit", limit.to_string()));
        self.headers
            .push(("X-RateLimit-Remaining", remaining.to_string()));
        self.headers
            .push(("X-RateLimit-Reset-After", reset_after.to_string()));
        self
    }

    fn with_bucket(mut self, bucket: &str) -> Self {
        self.headers
            .push(("X-RateLimit-Bucket", bucket.to_string()));
        self
    }

    fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    fn with_header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }
}

/// Transport that replays a script and records every call with its paused
/// clock timestamp.
struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl MockTransport {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn call_times(&self) -> Vec<(String, Instant)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportFailure> {
        let marker = request
            .headers
            .get("X-Test-Marker")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| request.url.clone());
        self.calls.lock().unwrap().push((marker, Instant::now()));

        let scripted = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(Scripted::ok_json);

        if scripted.timed_out {
            return Err(TransportFailure::TimedOut);
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &scripted.headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        Ok(TransportResponse {
            status: scripted.status,
            headers,
            body: scripted.body,
        })
    }
}

fn rest_with(transport: Arc<MockTransport>, options: RestOptions) -> Rest {
    let token = Arc::new(TokenProvider::new("Bot", "test-token"));
    Rest::with_parts(options, token, transport, Arc::new(TracingSink)).unwrap()
}

fn marked(marker: &str) -> RequestOptions {
    let mut options = RequestOptions::default();
    options.headers.push(("X-Test-Marker".to_string(), marker.to_string()));
    options
}

#[tokio::test(start_paused = true)]
async fn test_same_bucket_executes_in_enqueue_order() {
    let transport = MockTransport::new(vec![]);
    let rest = Arc::new(rest_with(Arc::clone(&transport), RestOptions::default()));

    let mut handles = Vec::new();
    for index in 0..4 {
        let rest = Arc::clone(&rest);
        handles.push(tokio::spawn(async move {
            rest.get(
                "/channels/886631972233949286/messages",
                marked(&format!("call-{}", index)),
            )
            .await
            .unwrap();
        }));
        // Let the task reach the bucket queue before enqueuing the next.
        tokio::task::yield_now().await;
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let order: Vec<String> = transport.call_times().into_iter().map(|(m, _)| m).collect();
    assert_eq!(order, vec!["call-0", "call-1", "call-2", "call-3"]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_bucket_waits_for_reset() {
    let transport = MockTransport::new(vec![
        Scripted::ok_json().with_rate_limit(5, 0, "2"),
        Scripted::ok_json().with_rate_limit(5, 4, "2"),
    ]);
    let rest = rest_with(Arc::clone(&transport), RestOptions::default());

    let start = Instant::now();
    rest.get("/channels/886631972233949286", marked("first"))
        .await
        .unwrap();
    rest.get("/channels/886631972233949286", marked("second"))
        .await
        .unwrap();

    let times = transport.call_times();
    assert!(times[0].1 - start < Duration::from_millis(10));
    // Second call starts no earlier than the declared reset plus offset.
    assert!(times[1].1 - start >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_429_retries_the_same_call() {
    let transport = MockTransport::new(vec![
        Scripted::ok_json()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .with_rate_limit(5, 0, "1")
            .with_header("Retry-After", "1"),
        Scripted::ok_json().with_rate_limit(5, 4, "1"),
    ]);
    let rest = rest_with(Arc::clone(&transport), RestOptions::default());

    let response = rest
        .get("/channels/886631972233949286", marked("call"))
        .await
        .unwrap();
    assert_eq!(response, RestResponse::Json(serde_json::json!({"ok": true})));
    assert_eq!(transport.call_count(), 2);

    let times = transport.call_times();
    assert!(times[1].1 - times[0].1 >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_thrown_rate_limit_surfaces_instead_of_waiting() {
    let transport = MockTransport::new(vec![Scripted::ok_json()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .with_rate_limit(5, 0, "3")
        .with_header("Retry-After", "3")]);
    let options = RestOptions::default().with_thrown_rate_limit(true);
    let rest = rest_with(Arc::clone(&transport), options);

    let err = rest
        .get("/channels/886631972233949286", marked("call"))
        .await
        .unwrap_err();
    match err {
        RestError::RateLimited {
            global,
            reset_after,
            ..
        } => {
            assert!(!global);
            assert_eq!(reset_after, Duration::from_secs(3));
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_server_errors_retry_up_to_budget() {
    let transport = MockTransport::new(vec![
        Scripted::ok_json().status(StatusCode::INTERNAL_SERVER_ERROR),
        Scripted::ok_json().status(StatusCode::INTERNAL_SERVER_ERROR),
        Scripted::ok_json().status(StatusCode::INTERNAL_SERVER_ERROR),
    ]);
    let options = RestOptions::default().with_retries(2);
    let rest = rest_with(Arc::clone(&transport), options);

    let err = rest
        .get("/channels/886631972233949286", marked("call"))
        .await
        .unwrap_err();
    match err {
        RestError::Server { status, method, .. } => {
            assert_eq!(status, 500);
            assert_eq!(method, "GET");
        }
        other => panic!("expected Server, got {:?}", other),
    }
    // Initial attempt plus two retries.
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_invalidates_the_token() {
    let transport = MockTransport::new(vec![Scripted::ok_json().status(StatusCode::UNAUTHORIZED)]);
    let rest = rest_with(Arc::clone(&transport), RestOptions::default());

    let err = rest
        .get("/users/@me", marked("first"))
        .await
        .unwrap_err();
    assert!(matches!(err, RestError::Auth));
    assert!(rest.token().raw().is_none());

    // The next call fails fast without reaching the transport.
    let err = rest.get("/users/@me", marked("second")).await.unwrap_err();
    assert!(matches!(err, RestError::Auth));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_client_errors_surface_the_body_verbatim() {
    let transport = MockTransport::new(vec![Scripted {
        status: StatusCode::BAD_REQUEST,
        body: br#"{"code":50006,"message":"Cannot send an empty message"}"#.to_vec(),
        ..Scripted::ok_json()
    }]);
    let rest = rest_with(Arc::clone(&transport), RestOptions::default());

    let err = rest
        .post(
            "/channels/886631972233949286/messages",
            Some(serde_json::json!({})),
            marked("call"),
        )
        .await
        .unwrap_err();
    match err {
        RestError::Client { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("50006"));
        }
        other => panic!("expected Client, got {:?}", other),
    }
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_buckets_do_not_couple_across_major_parameters() {
    let transport = MockTransport::new(vec![
        // Exhaust the first channel's bucket for a long time.
        Scripted::ok_json().with_rate_limit(5, 0, "1000"),
        Scripted::ok_json(),
    ]);
    let rest = Arc::new(rest_with(Arc::clone(&transport), RestOptions::default()));

    let start = Instant::now();
    rest.get("/channels/886631972233949286/messages", marked("limited"))
        .await
        .unwrap();

    // Same pattern, different major parameter: must not wait.
    rest.get("/channels/886631972233949299/messages", marked("free"))
        .await
        .unwrap();

    let times = transport.call_times();
    assert_eq!(times[1].0, "free");
    assert!(times[1].1 - start < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_global_ceiling_couples_all_buckets() {
    let transport = MockTransport::new(vec![]);
    let options = RestOptions::default().with_global_requests_per_second(2);
    let rest = rest_with(Arc::clone(&transport), options);

    let start = Instant::now();
    rest.get("/channels/886631972233949286", marked("a"))
        .await
        .unwrap();
    rest.get("/guilds/886631972233949287", marked("b"))
        .await
        .unwrap();
    rest.get("/users/@me", marked("c")).await.unwrap();

    let times = transport.call_times();
    assert!(times[1].1 - start < Duration::from_millis(10));
    // Third call waits out the shared one-second window.
    assert!(times[2].1 - start >= Duration::from_millis(990));
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_retry_up_to_budget_then_surface() {
    let transport = MockTransport::new(vec![
        Scripted::timed_out(),
        Scripted::timed_out(),
        Scripted::timed_out(),
    ]);
    let options = RestOptions::default().with_retries(2);
    let rest = rest_with(Arc::clone(&transport), options);

    let err = rest
        .get("/channels/886631972233949286", marked("call"))
        .await
        .unwrap_err();
    assert!(matches!(err, RestError::Transport(_)));
    // Initial attempt plus two retries.
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_success_recovers() {
    let transport = MockTransport::new(vec![Scripted::timed_out(), Scripted::ok_json()]);
    let rest = rest_with(Arc::clone(&transport), RestOptions::default());

    let response = rest
        .get("/channels/886631972233949286", marked("call"))
        .await
        .unwrap();
    assert_eq!(response, RestResponse::Json(serde_json::json!({"ok": true})));
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_429_with_only_retry_after_waits_before_retrying() {
    // A server-side global 429 omits the bucket headers; the Retry-After
    // hint alone must still delay the retry.
    let transport = MockTransport::new(vec![
        Scripted::ok_json()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .with_header("Retry-After", "2"),
        Scripted::ok_json(),
    ]);
    let rest = rest_with(Arc::clone(&transport), RestOptions::default());

    rest.get("/channels/886631972233949286", marked("call"))
        .await
        .unwrap();

    let times = transport.call_times();
    assert_eq!(transport.call_count(), 2);
    assert!(times[1].1 - times[0].1 >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_global_admission_never_exceeds_the_ceiling() {
    let transport = MockTransport::new(vec![]);
    let options = RestOptions::default().with_global_requests_per_second(2);
    let rest = Arc::new(rest_with(Arc::clone(&transport), options));

    // Three buckets race for a ceiling of two; exactly two run in the first
    // window and the third waits for the next one.
    let mut handles = Vec::new();
    for (index, route) in [
        "/channels/886631972233949286",
        "/guilds/886631972233949287",
        "/users/@me",
    ]
    .into_iter()
    .enumerate()
    {
        let rest = Arc::clone(&rest);
        let marker = format!("call-{}", index);
        handles.push(tokio::spawn(async move {
            rest.get(route, marked(&marker)).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let start = transport.call_times()[0].1;
    let in_first_window = transport
        .call_times()
        .iter()
        .filter(|(_, at)| *at - start < Duration::from_secs(1))
        .count();
    assert_eq!(in_first_window, 2);
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_reported_bucket_id_regroups_future_resolutions() {
    let transport = MockTransport::new(vec![Scripted::ok_json().with_bucket("shared-bucket")]);
    let rest = rest_with(Arc::clone(&transport), RestOptions::default());

    rest.get("/channels/886631972233949286", marked("call"))
        .await
        .unwrap();

    assert_eq!(
        rest.hashes().resolve("GET", "/channels/:id"),
        "shared-bucket"
    );
}

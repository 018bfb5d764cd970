//! Dispatcher configuration

use std::collections::HashMap;
use std::time::Duration;

use perch_core::routes::{BASE_API_VERSION, BASE_URL};

/// Configuration for the [`Rest`](crate::Rest) dispatcher.
#[derive(Debug, Clone)]
pub struct RestOptions {
    /// Base API URL, without the version segment.
    pub api: String,
    /// Version segment appended to the base URL for versioned requests.
    pub version: u8,
    /// Prefix for the `Authorization` header (`"Bot"` or `"Bearer"`).
    pub auth_prefix: String,
    /// Static headers added to every request.
    pub headers: HashMap<String, String>,
    /// Appended to the library user agent.
    pub user_agent_suffix: String,
    /// Per-request timeout applied by the transport.
    pub timeout: Duration,
    /// Retry budget for timeouts and 5xx responses.
    pub retries: u32,
    /// Safety margin added to every server-declared reset delay.
    pub offset: Duration,
    /// Shared requests-per-second ceiling across all buckets.
    pub global_requests_per_second: u32,
    /// How often idle route hashes are swept.
    pub hash_sweep_interval: Duration,
    /// How long an unused route hash survives before eviction.
    pub hash_lifetime: Duration,
    /// How often inactive buckets are swept.
    pub bucket_sweep_interval: Duration,
    /// Surface an expected rate limit as an error instead of waiting.
    pub thrown_rate_limit: bool,
    /// Warn every N invalid (401/403/429) responses in a ten-minute window.
    /// Zero disables the warning.
    pub invalid_requests_warning_interval: u32,
}

impl Default for RestOptions {
    fn default() -> Self {
        Self {
            api: BASE_URL.to_string(),
            version: BASE_API_VERSION,
            auth_prefix: "Bot".to_string(),
            headers: HashMap::new(),
            user_agent_suffix: String::new(),
            timeout: Duration::from_secs(5),
            retries: 5,
            offset: Duration::from_millis(50),
            global_requests_per_second: 50,
            hash_sweep_interval: Duration::from_secs(3600),
            hash_lifetime: Duration::from_secs(86_400),
            bucket_sweep_interval: Duration::from_secs(3600),
            thrown_rate_limit: false,
            invalid_requests_warning_interval: 500,
        }
    }
}

impl RestOptions {
    pub fn with_api(mut self, api: impl Into<String>) -> Self {
        self.api = api.into();
        self
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn with_auth_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.auth_prefix = prefix.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_offset(mut self, offset: Duration) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_global_requests_per_second(mut self, ceiling: u32) -> Self {
        self.global_requests_per_second = ceiling;
        self
    }

    pub fn with_thrown_rate_limit(mut self, thrown: bool) -> Self {
        self.thrown_rate_limit = thrown;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Per-request options for [`Rest::request`](crate::Rest::request).
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// JSON body, encoded as the request body or embedded as `payload_json`
    /// when files are attached.
    pub body: Option<serde_json::Value>,
    /// Files to upload as a multipart form.
    pub files: Vec<crate::transport::AttachedFile>,
    /// Pre-encoded query string, without the leading `?`.
    pub query: Option<String>,
    /// Audit-log reason forwarded as `X-Audit-Log-Reason`.
    pub reason: Option<String>,
    /// Extra headers for this request only.
    pub headers: Vec<(String, String)>,
    /// Attach the `Authorization` header. Defaults to true.
    pub auth: bool,
    /// Include the version segment in the URL. Defaults to true.
    pub versioned: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            body: None,
            files: Vec::new(),
            query: None,
            reason: None,
            headers: Vec::new(),
            auth: true,
            versioned: true,
        }
    }
}

impl RequestOptions {
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_file(mut self, file: crate::transport::AttachedFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn without_auth(mut self) -> Self {
        self.auth = false;
        self
    }
}

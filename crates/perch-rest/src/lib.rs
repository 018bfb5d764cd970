//! Perch REST - rate-limit-aware request dispatcher
//!
//! Canonicalizes routes into rate-limit buckets, serializes calls per
//! bucket, honors the server-declared and global quotas, and retries
//! transient failures up to a configured budget.

mod bucket;
mod error;
mod global;
mod hashes;
mod options;
mod rest;
mod transport;

pub use bucket::{RequestBucket, RestResponse};
pub use error::{Result, RestError};
pub use global::GlobalQuota;
pub use hashes::RouteHashRegistry;
pub use options::{RequestOptions, RestOptions};
pub use rest::Rest;
pub use transport::{
    AttachedFile, HttpTransport, RequestBody, ReqwestTransport, TransportFailure,
    TransportRequest, TransportResponse,
};

pub use reqwest::Method;

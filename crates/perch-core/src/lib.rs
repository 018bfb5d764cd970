//! Perch core - shared leaf types for the transport layer
//!
//! Route canonicalization, the credential provider, and the narrow
//! collaborator interfaces (debug sink, event dispatch, entity cache)
//! consumed by the REST and gateway crates.

pub mod auth;
pub mod dispatch;
pub mod observer;
pub mod routes;

pub use auth::TokenProvider;
pub use dispatch::{EntityCache, EventSink, NoopCache};
pub use observer::{DebugEvent, DebugSink, TracingSink};
pub use routes::{resolve_route, RouteData, BASE_API_VERSION, BASE_URL, GATEWAY_BEARER, GATEWAY_BOT};

//! Route canonicalization
//!
//! Turns a concrete API route into the stable pattern and major parameter
//! used as rate-limit bucket keys.

use once_cell::sync::Lazy;
use regex::Regex;

/// Base URL of the remote API, without the version segment.
pub const BASE_URL: &str = "https://discord.com/api";

/// API version appended to [`BASE_URL`] unless a request opts out.
pub const BASE_API_VERSION: u8 = 9;

/// Route returning the gateway URL for bot credentials.
pub const GATEWAY_BOT: &str = "/gateway/bot";

/// Route returning the gateway URL for bearer credentials.
pub const GATEWAY_BEARER: &str = "/gateway";

static ID_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{16,19}").unwrap());
static REACTION_TAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"/reactions/.*").unwrap());
static MAJOR_PARAMETER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/(?:channels|guilds|webhooks)/(\d{16,19})").unwrap());

/// A canonicalized route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteData {
    /// The concrete route as the caller passed it.
    pub full_route: String,
    /// The route with identifier segments replaced by placeholders.
    pub bucket_route: String,
    /// The resource-scoping id segment, or `"global"` when the route has none.
    pub major_parameter: String,
}

/// Canonicalize a route into its bucket pattern and major parameter.
///
/// Two ordered substitution rules produce the bucket pattern: every 16-19
/// digit identifier becomes `:id`, then anything following `/reactions/`
/// collapses to `/reactions/:reaction` so that all reaction emojis on a
/// message share one bucket. The major parameter is the leading channel,
/// guild or webhook id; routes with different major parameters never share
/// a bucket even when their patterns match.
pub fn resolve_route(route: &str) -> RouteData {
    let bucket_route = ID_SEGMENT.replace_all(route, ":id");
    let bucket_route = REACTION_TAIL.replace(&bucket_route, "/reactions/:reaction");

    let major_parameter = MAJOR_PARAMETER
        .captures(route)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| "global".to_string());

    RouteData {
        full_route: route.to_string(),
        bucket_route: bucket_route.into_owned(),
        major_parameter,
    }
}

//! Error types used across the crate, kept in a single module with no
//! internal dependencies so error-handling code can never pull in a
//! circular import.
//!
//! The taxonomy matters more than the variants: [`UpstreamError`] is the
//! "partner unavailable" class (any failure causally linked to the Ghibli
//! API) and is the *only* class eligible for best-effort stale fallback in
//! the cache orchestrator. Everything else surfaces to the caller unchanged.

use thiserror::Error;

/// Any failure causally linked to the upstream Ghibli API: connection or
/// timeout trouble, a non-success status code, an undecodable payload, or a
/// batch where every single record failed to parse.
///
/// All variants carry the endpoint they were talking to.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The request never completed, even after retries.
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The partner answered with a non-200 status.
    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },

    /// The response body was not the JSON we expected.
    #[error("undecodable payload from {endpoint}: {source}")]
    Payload {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    /// The partner returned records, but not one of them parsed. A batch
    /// with *some* parse failures is accepted (bad records are logged and
    /// skipped); losing every record points at schema drift on one side or
    /// the other and is treated as a partner failure.
    #[error("{endpoint} returned records, but none of them parsed")]
    NoParseableRecords { endpoint: String },
}

/// Errors produced by ghibli-proxy.
#[derive(Debug, Error)]
pub enum Error {
    /// A fetch operation was passed to the cache orchestrator (or to
    /// [`CacheRegistry::cache`](crate::cache::CacheRegistry::cache)) without
    /// ever being bound. This is a programming error in the caller, not a
    /// cache miss: it is never retried and never given fallback treatment.
    #[error("operation `{op}` is not bound to a cache")]
    NotCacheable { op: &'static str },

    /// The partner-unavailable class — see [`UpstreamError`].
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl Error {
    /// Whether this error belongs to the partner-unavailable class, the only
    /// class the orchestrator may swallow in favour of stale cache results.
    pub fn is_partner_unavailable(&self) -> bool {
        matches!(self, Self::Upstream(_))
    }
}

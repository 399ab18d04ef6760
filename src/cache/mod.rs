//! The caching layer: an upsert-only TTL store, the registry that binds
//! fetch operations to it, and the orchestrator that serves requests
//! through it.
//!
//! Three pieces, layered:
//!
//! - [`UpsertCache`] — the store itself. Keys can be inserted and
//!   overwritten, never removed; staleness is tracked against a monotonic
//!   clock; observers can register for post-update callbacks.
//! - [`CacheRegistry::bind`] — marks a fetch operation as cacheable by
//!   pairing it with a fresh store, a key selector, and callbacks. The
//!   operation itself is untouched and stays independently callable.
//! - [`CacheRegistry::request_through_cache`] — the serving path: cache hit
//!   when fresh, full drain-then-commit refresh when due, and best-effort
//!   fallback to stale results when the upstream partner is unavailable.
//!
//! Explicit cache use is the point of this design: callers route through
//! the registry on purpose, low-level fetch operations stay trivially
//! testable, and a forced refresh is one `ttl_override` away. This is a
//! single-process cache; if coherence across processes ever matters, that
//! is a different (redis-shaped) design.

mod registry;
mod store;

pub use registry::{CacheRegistry, FetchOp, FetchStream, Fetcher, KeySelector};
pub use store::{UpdateCallback, UpsertCache};

//! # ghibli-proxy
//!
//! A caching proxy for the Studio Ghibli API.
//!
//! The proxy fetches the partner's films and people collections, joins them
//! through a derived film→people lookup, and serves everything through an
//! upsert-only TTL cache with best-effort stale fallback: when the partner
//! is down and we have previously cached data, we keep serving it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ghibli_proxy::app::App;
//! use ghibli_proxy::config::Config;
//! use ghibli_proxy::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env();
//!     let app = Arc::new(App::new(&config)?);
//!     let server = Server::bind(&config.bind_addr).await?;
//!     server.run(app).await?;
//!     Ok(())
//! }
//! ```
//!
//! The interesting machinery lives in [`cache`]: the [`cache::UpsertCache`]
//! store, the [`cache::CacheRegistry`] that marks fetch operations as
//! cacheable, and the orchestrator
//! ([`cache::CacheRegistry::request_through_cache`]) that decides between
//! cache hits, refreshes, and stale fallback.

pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod lookup;
pub mod server;
pub mod upstream;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use app::App;
pub use cache::{CacheRegistry, FetchOp, UpsertCache};
pub use config::Config;
pub use error::{Error, UpstreamError};
pub use server::{Server, ServerError};

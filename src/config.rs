//! Process configuration.
//!
//! A small constants-with-overrides surface: every knob has a hardcoded
//! default matching the expected deployment, and a handful of environment
//! variables can override them at startup. Anything unparseable falls back
//! to the default with a warning rather than refusing to boot.

use std::time::Duration;

use tracing::warn;

/// Default address the proxy listens on.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Default base URL of the upstream Ghibli API.
pub const DEFAULT_BASE_URL: &str = "https://ghibliapi.herokuapp.com";

/// Per-request timeout against the upstream API.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// How many times a failed upstream request is retried before giving up.
pub const DEFAULT_RETRIES: u32 = 2;

/// Default TTL for both the films and the people cache.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Runtime configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Base URL of the upstream Ghibli API, without a trailing slash.
    pub base_url: String,
    /// Per-request timeout for upstream calls.
    pub request_timeout: Duration,
    /// Transport-level retries per upstream call.
    pub retries: u32,
    /// Default TTL handed to every cache binding.
    pub cache_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_owned(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retries: DEFAULT_RETRIES,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

impl Config {
    /// Build a configuration from the process environment.
    ///
    /// Recognized variables:
    ///
    /// - `GHIBLI_PROXY_ADDR` — listen address (`host:port`)
    /// - `GHIBLI_BASE_URL` — upstream base URL
    /// - `GHIBLI_PROXY_TTL_SECS` — cache TTL in whole seconds
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// The lookup-injected core of [`Config::from_env`], split out so tests
    /// don't have to mutate the process environment.
    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("GHIBLI_PROXY_ADDR") {
            config.bind_addr = addr;
        }

        if let Some(url) = var("GHIBLI_BASE_URL") {
            config.base_url = url.trim_end_matches('/').to_owned();
        }

        if let Some(raw) = var("GHIBLI_PROXY_TTL_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) => config.cache_ttl = Duration::from_secs(secs),
                Err(_) => warn!(
                    value = %raw,
                    "GHIBLI_PROXY_TTL_SECS is not a whole number of seconds — using default"
                ),
            }
        }

        config
    }
}

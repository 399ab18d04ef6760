//! The upsert-only cache store.
//!
//! [`UpsertCache`] is a dependable, appendable key-value store: keys can be
//! inserted and overwritten but never removed. That restriction is what makes
//! serving stale results safe: once data has landed, it stays available as a
//! fallback no matter how many refreshes fail afterwards. If removal were ever
//! needed, purging would have to be delayed until the *next* successful
//! refresh to keep that guarantee; that scheme is deliberately not built.
//!
//! Staleness is tracked with a monotonic clock ([`tokio::time::Instant`]), so
//! correctness depends only on elapsed time. Wall-clock jumps and DST have no
//! effect, and the paused Tokio clock drives the timing tests.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;

/// A post-update observer. Callbacks run synchronously inside
/// [`UpsertCache::update`], in registration order, after the update
/// timestamp has been set. A panicking callback propagates to the caller of
/// `update`.
pub type UpdateCallback<K, V> = Box<dyn Fn(&UpsertCache<K, V>) + Send + Sync>;

/// Entries plus the timestamp that governs their staleness. Guarded by one
/// lock so a reader can never see a new batch with an old timestamp or vice
/// versa.
struct State<K, V> {
    /// The committed entries. Swapped wholesale on update, so snapshots
    /// handed out earlier are never mutated underneath their holders.
    entries: Arc<HashMap<K, V>>,
    /// When the last successful update completed. `None` until the first
    /// one; the distinction drives [`UpsertCache::can_fallback_to_stale`].
    last_update: Option<Instant>,
}

/// An upsert-only, TTL-governed cache with post-update callbacks.
///
/// The store does not fetch anything itself; a
/// [`CacheRegistry`](crate::cache::CacheRegistry) pairs it with a fetch
/// operation and a key selector, and the orchestrator decides when to refresh
/// it. The store's own contract is small:
///
/// - [`update`](Self::update) merges a fully materialized batch, then stamps
///   the update time, then fires callbacks — in that order.
/// - [`needs_update`](Self::needs_update) compares elapsed time against the
///   TTL (default or per-call override).
/// - [`all`](Self::all) hands out an immutable snapshot of the committed
///   entries.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use std::time::Duration;
/// use ghibli_proxy::cache::UpsertCache;
///
/// let cache: UpsertCache<&str, u32> = UpsertCache::new(Duration::from_secs(60));
/// assert!(cache.needs_update(None));
///
/// cache.update(HashMap::from([("porco", 1992)]));
/// assert!(!cache.needs_update(None));
/// assert_eq!(cache.get(&"porco"), Some(1992));
/// ```
pub struct UpsertCache<K, V> {
    default_ttl: Duration,
    state: RwLock<State<K, V>>,
    callbacks: Vec<UpdateCallback<K, V>>,
}

impl<K, V> UpsertCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty store with the given default TTL and no callbacks.
    pub fn new(default_ttl: Duration) -> Self {
        Self::with_callbacks(default_ttl, Vec::new())
    }

    /// Creates an empty store with the given default TTL and post-update
    /// callbacks. The callback list is fixed for the store's lifetime.
    pub fn with_callbacks(default_ttl: Duration, callbacks: Vec<UpdateCallback<K, V>>) -> Self {
        Self {
            default_ttl,
            state: RwLock::new(State {
                entries: Arc::new(HashMap::new()),
                last_update: None,
            }),
            callbacks,
        }
    }

    /// The TTL used when [`needs_update`](Self::needs_update) is called
    /// without an override.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Whether the store is due for a refresh: `true` if no update has ever
    /// completed, or if at least `ttl` (the override, or the default TTL)
    /// has elapsed since the last one.
    pub fn needs_update(&self, ttl: Option<Duration>) -> bool {
        let state = self.state.read().expect("cache lock poisoned");
        match state.last_update {
            None => true,
            Some(at) => at.elapsed() >= ttl.unwrap_or(self.default_ttl),
        }
    }

    /// Merges `batch` into the store and stamps the update time.
    ///
    /// Every key in `batch` is inserted or overwritten; existing keys absent
    /// from `batch` are left untouched; nothing is ever removed. The
    /// timestamp is written only after the merge has fully committed, and
    /// callbacks fire only after the timestamp, so an observer always sees
    /// the store in its post-update shape.
    ///
    /// The merge builds a fresh map and swaps it in, which keeps previously
    /// handed-out [`all`](Self::all) snapshots stable and means no reader
    /// can observe a half-applied batch.
    pub fn update(&self, batch: HashMap<K, V>) {
        {
            let mut state = self.state.write().expect("cache lock poisoned");
            let mut merged = HashMap::clone(&state.entries);
            merged.extend(batch);
            state.entries = Arc::new(merged);
            state.last_update = Some(Instant::now());
        }

        // Lock released above: callbacks are free to read the store.
        for callback in &self.callbacks {
            callback(self);
        }
    }

    /// Looks up a single entry, cloning the value out.
    pub fn get(&self, key: &K) -> Option<V> {
        let state = self.state.read().expect("cache lock poisoned");
        state.entries.get(key).cloned()
    }

    /// Whether at least one update has ever completed, i.e. whether there
    /// are results (however stale) to fall back on when a refresh fails.
    pub fn can_fallback_to_stale(&self) -> bool {
        let state = self.state.read().expect("cache lock poisoned");
        state.last_update.is_some()
    }

    /// A read-only snapshot of every committed entry.
    ///
    /// The snapshot is the store's current entry map behind a shared
    /// reference count: cheap to hand out, impossible to mutate the store
    /// through, and unaffected by later updates.
    pub fn all(&self) -> Arc<HashMap<K, V>> {
        let state = self.state.read().expect("cache lock poisoned");
        Arc::clone(&state.entries)
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        let state = self.state.read().expect("cache lock poisoned");
        state.entries.len()
    }

    /// `true` if no entries have been committed yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> fmt::Debug for UpsertCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().expect("cache lock poisoned");
        f.debug_struct("UpsertCache")
            .field("default_ttl", &self.default_ttl)
            .field("entries", &state.entries.len())
            .field("last_update", &state.last_update)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

//! Binding fetch operations to cache stores, and the request orchestrator.
//!
//! A fetch operation stays a plain client method: directly callable, tested
//! in isolation, knowing nothing about caching. What makes it *cacheable* is
//! an entry in a [`CacheRegistry`]: the operation's identity token
//! ([`FetchOp`]) mapped to a freshly built [`UpsertCache`], a key selector,
//! and a fetcher closure. The registry is populated once at startup via
//! [`bind`](CacheRegistry::bind) and looked up explicitly by
//! [`request_through_cache`](CacheRegistry::request_through_cache). There is
//! no hidden metadata stuck onto the operation itself.
//!
//! An operation that was never bound is a usage error, not a cache miss:
//! both lookup paths fail with [`Error::NotCacheable`].

use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, warn};

use crate::cache::store::{UpdateCallback, UpsertCache};
use crate::error::Error;

/// The lazy, finite, non-restartable sequence a fetch operation produces:
/// each `Ok` item is one record destined for the cache, and the first `Err`
/// aborts the whole drain.
pub type FetchStream<V> = BoxStream<'static, Result<V, Error>>;

/// Derives the cache key for an item, typically a field accessor like
/// `|film: &FilmRecord| film.id`.
pub type KeySelector<K, V> = Box<dyn Fn(&V) -> K + Send + Sync>;

/// Produces a fresh [`FetchStream`] per refresh. A factory rather than a
/// stream, because streams here are single-use: every refresh drains one to
/// completion.
pub type Fetcher<V> = Box<dyn Fn() -> FetchStream<V> + Send + Sync>;

/// The identity token for a fetch operation.
///
/// Carries the operation's name plus the key/item types it yields, so a
/// registry lookup is checked against both. Declare one `const` per
/// operation next to the operation itself:
///
/// ```
/// use ghibli_proxy::cache::FetchOp;
/// use ghibli_proxy::upstream::FilmRecord;
/// use uuid::Uuid;
///
/// pub const ALL_FILMS: FetchOp<Uuid, FilmRecord> = FetchOp::new("all_films");
/// ```
pub struct FetchOp<K, V> {
    name: &'static str,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> FetchOp<K, V> {
    /// Creates an operation token. The name is the registry key, so it must
    /// be unique across bound operations.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _types: PhantomData,
        }
    }

    /// The operation's registry name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Everything the orchestrator needs to route one operation through its
/// cache.
struct Binding<K, V> {
    store: Arc<UpsertCache<K, V>>,
    key_of: KeySelector<K, V>,
    fetch: Fetcher<V>,
}

/// The side table mapping operation identities to their cache bindings.
///
/// Bindings are registered once at startup (`&mut self`), after which the
/// registry is shared immutably across request handlers. Item types vary per
/// operation, so bindings are stored type-erased and recovered by downcast;
/// a token whose types don't match what was bound behaves exactly like an
/// unbound one.
#[derive(Default)]
pub struct CacheRegistry {
    bindings: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl CacheRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `op` to a freshly constructed [`UpsertCache`] with the given
    /// TTL and callbacks, a key selector, and the fetcher the orchestrator
    /// will invoke on refresh.
    ///
    /// Binding registers metadata only: nothing is fetched or cached here,
    /// and the underlying operation remains directly callable without the
    /// registry. Re-binding the same name replaces the previous binding,
    /// fresh store included.
    pub fn bind<K, V>(
        &mut self,
        op: &FetchOp<K, V>,
        fetch: impl Fn() -> FetchStream<V> + Send + Sync + 'static,
        default_ttl: Duration,
        key_of: impl Fn(&V) -> K + Send + Sync + 'static,
        callbacks: Vec<UpdateCallback<K, V>>,
    ) where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let binding = Binding {
            store: Arc::new(UpsertCache::with_callbacks(default_ttl, callbacks)),
            key_of: Box::new(key_of) as KeySelector<K, V>,
            fetch: Box::new(fetch) as Fetcher<V>,
        };
        self.bindings.insert(op.name, Box::new(binding));
    }

    fn binding<K, V>(&self, op: &FetchOp<K, V>) -> Result<&Binding<K, V>, Error>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.bindings
            .get(op.name)
            .and_then(|entry| entry.downcast_ref::<Binding<K, V>>())
            .ok_or(Error::NotCacheable { op: op.name })
    }

    /// The cache store bound to `op`, for introspection and tests.
    ///
    /// # Errors
    ///
    /// [`Error::NotCacheable`] if `op` was never bound.
    pub fn cache<K, V>(&self, op: &FetchOp<K, V>) -> Result<Arc<UpsertCache<K, V>>, Error>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        Ok(Arc::clone(&self.binding(op)?.store))
    }

    /// Serves `op`'s results through its cache, refreshing from upstream
    /// only when the cache is due.
    ///
    /// If the store is within its TTL (the binding's default, or
    /// `ttl_override` for this call), the committed snapshot is returned
    /// without touching upstream. Otherwise the bound fetcher runs and its
    /// stream is drained *completely* into a fresh batch before anything is
    /// committed, so a failed or cancelled drain leaves the store exactly as
    /// it was.
    ///
    /// When the drain fails with a partner-unavailable error and
    /// `best_effort` is `true`, previously cached results are served instead
    /// (logged as a warning), provided at least one refresh has ever
    /// succeeded. With `best_effort` false the caller gets fresh data or an
    /// error, never silently stale data.
    ///
    /// Two tasks that concurrently find the same store stale will both
    /// refresh: both batches merge and the later commit owns the next TTL
    /// window. The registry makes no at-most-one-refresh guarantee.
    ///
    /// # Errors
    ///
    /// - [`Error::NotCacheable`] if `op` was never bound.
    /// - Any partner-unavailable error from the drain, when fallback is
    ///   declined (`best_effort` false) or impossible (no successful
    ///   history).
    /// - Any other error from the drain, unconditionally.
    pub async fn request_through_cache<K, V>(
        &self,
        op: &FetchOp<K, V>,
        best_effort: bool,
        ttl_override: Option<Duration>,
    ) -> Result<Arc<HashMap<K, V>>, Error>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let binding = self.binding(op)?;
        let store = &binding.store;

        if !store.needs_update(ttl_override) {
            debug!(op = op.name, "cache hit");
            return Ok(store.all());
        }

        debug!(op = op.name, "cache due for refresh");
        match drain(binding).await {
            Ok(fresh) => {
                store.update(fresh);
                Ok(store.all())
            }
            Err(err)
                if err.is_partner_unavailable()
                    && best_effort
                    && store.can_fallback_to_stale() =>
            {
                warn!(op = op.name, error = %err, "partner unavailable — serving stale cache");
                Ok(store.all())
            }
            Err(err) => Err(err),
        }
    }
}

/// Materializes one run of the bound fetch operation into a keyed batch.
/// The first stream error aborts the drain; nothing partial escapes.
async fn drain<K, V>(binding: &Binding<K, V>) -> Result<HashMap<K, V>, Error>
where
    K: Eq + Hash,
{
    let mut stream = (binding.fetch)();
    let mut batch = HashMap::new();
    while let Some(item) = stream.next().await {
        let item = item?;
        batch.insert((binding.key_of)(&item), item);
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::stream;
    use tokio::time::advance;

    use crate::error::UpstreamError;

    const TTL: Duration = Duration::from_secs(60);

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Item {
        key: &'static str,
        value: u32,
    }

    const OP: FetchOp<&str, Item> = FetchOp::new("test_op");

    /// A fetcher yielding the given items on every invocation, counting how
    /// often upstream was actually hit.
    fn fetcher_of(
        items: Vec<Item>,
        hits: Arc<AtomicUsize>,
    ) -> impl Fn() -> FetchStream<Item> + Send + Sync + 'static {
        move || {
            hits.fetch_add(1, Ordering::SeqCst);
            stream::iter(items.clone().into_iter().map(Ok)).boxed()
        }
    }

    /// A fetcher that fails with a partner-unavailable error on every
    /// invocation.
    fn failing_fetcher(
        hits: Arc<AtomicUsize>,
    ) -> impl Fn() -> FetchStream<Item> + Send + Sync + 'static {
        move || {
            hits.fetch_add(1, Ordering::SeqCst);
            stream::iter([Err(Error::from(UpstreamError::Status {
                endpoint: "/test".to_owned(),
                status: 503,
            }))])
            .boxed()
        }
    }

    fn item(key: &'static str, value: u32) -> Item {
        Item { key, value }
    }

    fn bind_items(registry: &mut CacheRegistry, items: Vec<Item>) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        registry.bind(
            &OP,
            fetcher_of(items, Arc::clone(&hits)),
            TTL,
            |item: &Item| item.key,
            Vec::new(),
        );
        hits
    }

    #[tokio::test]
    async fn unbound_op_is_not_cacheable() {
        let registry = CacheRegistry::new();
        assert!(matches!(
            registry.cache(&OP),
            Err(Error::NotCacheable { op: "test_op" })
        ));
        assert!(matches!(
            registry.request_through_cache(&OP, true, None).await,
            Err(Error::NotCacheable { op: "test_op" })
        ));
    }

    #[tokio::test]
    async fn unbound_fetch_stream_still_drains_directly() {
        // The operation itself needs no registry: it can be invoked and
        // drained in isolation.
        let hits = Arc::new(AtomicUsize::new(0));
        let fetch = fetcher_of(vec![item("totoro", 1988)], Arc::clone(&hits));

        let drained: Vec<_> = fetch().collect().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_request_populates_the_cache() {
        let mut registry = CacheRegistry::new();
        let hits = bind_items(&mut registry, vec![item("totoro", 1988)]);

        let view = registry.request_through_cache(&OP, true, None).await.unwrap();
        assert_eq!(view.get("totoro"), Some(&item("totoro", 1988)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let store = registry.cache(&OP).unwrap();
        assert!(store.can_fallback_to_stale());
    }

    #[tokio::test]
    async fn cache_hit_skips_upstream() {
        let mut registry = CacheRegistry::new();
        let hits = bind_items(&mut registry, vec![item("totoro", 1988)]);

        registry.request_through_cache(&OP, true, None).await.unwrap();
        let view = registry.request_through_cache(&OP, true, None).await.unwrap();

        assert_eq!(view.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_cache_refreshes_from_upstream() {
        let mut registry = CacheRegistry::new();
        let hits = bind_items(&mut registry, vec![item("totoro", 1988)]);

        registry.request_through_cache(&OP, true, None).await.unwrap();
        advance(TTL + TTL / 2).await;

        let view = registry.request_through_cache(&OP, true, None).await.unwrap();
        assert_eq!(view.get("totoro"), Some(&item("totoro", 1988)));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_override_defers_refresh() {
        let mut registry = CacheRegistry::new();
        let hits = bind_items(&mut registry, vec![item("totoro", 1988)]);

        registry.request_through_cache(&OP, true, None).await.unwrap();
        advance(TTL + TTL / 2).await;

        // Stale by the default TTL, but fresh under the widened override.
        registry
            .request_through_cache(&OP, true, Some(TTL * 2))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        advance(TTL).await;
        registry
            .request_through_cache(&OP, true, Some(TTL * 2))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_fallback_serves_previous_snapshot() {
        let mut registry = CacheRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.bind(
            &OP,
            failing_fetcher(Arc::clone(&hits)),
            TTL,
            |item: &Item| item.key,
            Vec::new(),
        );

        // Seed the store directly, as if an earlier refresh had succeeded.
        let store = registry.cache(&OP).unwrap();
        store.update(HashMap::from([("totoro", item("totoro", 1988))]));
        advance(TTL + TTL / 2).await;
        assert!(store.needs_update(None));

        let view = registry.request_through_cache(&OP, true, None).await.unwrap();
        assert_eq!(view.get("totoro"), Some(&item("totoro", 1988)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_fallback_without_history() {
        // A store that has never been successfully updated propagates the
        // failure even with best_effort.
        let mut registry = CacheRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.bind(
            &OP,
            failing_fetcher(Arc::clone(&hits)),
            TTL,
            |item: &Item| item.key,
            Vec::new(),
        );

        let result = registry.request_through_cache(&OP, true, None).await;
        assert!(matches!(result, Err(Error::Upstream(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn best_effort_false_never_serves_stale() {
        let mut registry = CacheRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.bind(
            &OP,
            failing_fetcher(Arc::clone(&hits)),
            TTL,
            |item: &Item| item.key,
            Vec::new(),
        );

        let store = registry.cache(&OP).unwrap();
        store.update(HashMap::from([("totoro", item("totoro", 1988))]));
        advance(TTL * 2).await;

        let result = registry.request_through_cache(&OP, false, None).await;
        assert!(matches!(result, Err(Error::Upstream(_))));
    }

    #[tokio::test]
    async fn non_partner_errors_always_propagate() {
        // Only the partner-unavailable class gets fallback treatment; any
        // other error passes through even with usable stale data.
        let mut registry = CacheRegistry::new();
        registry.bind(
            &OP,
            || stream::iter([Err(Error::NotCacheable { op: "inner" })]).boxed(),
            TTL,
            |item: &Item| item.key,
            Vec::new(),
        );

        let store = registry.cache(&OP).unwrap();
        store.update(HashMap::from([("totoro", item("totoro", 1988))]));

        // Force a refresh attempt by making the store look stale.
        tokio::time::pause();
        advance(TTL * 2).await;

        let result = registry.request_through_cache(&OP, true, None).await;
        assert!(matches!(result, Err(Error::NotCacheable { op: "inner" })));
    }

    #[tokio::test]
    async fn failed_drain_commits_nothing() {
        // Items already yielded before the stream error must not reach the
        // store: the drain is all-or-nothing.
        let mut registry = CacheRegistry::new();
        registry.bind(
            &OP,
            || {
                stream::iter([
                    Ok(item("totoro", 1988)),
                    Err(Error::from(UpstreamError::Status {
                        endpoint: "/test".to_owned(),
                        status: 502,
                    })),
                ])
                .boxed()
            },
            TTL,
            |item: &Item| item.key,
            Vec::new(),
        );

        let result = registry.request_through_cache(&OP, true, None).await;
        assert!(result.is_err());

        let store = registry.cache(&OP).unwrap();
        assert!(store.is_empty());
        assert!(!store.can_fallback_to_stale());
    }

    #[tokio::test]
    async fn binding_callbacks_fire_on_refresh_only() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = {
            let calls = Arc::clone(&calls);
            Box::new(move |_: &UpsertCache<&str, Item>| {
                calls.fetch_add(1, Ordering::SeqCst);
            }) as UpdateCallback<&str, Item>
        };

        let mut registry = CacheRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.bind(
            &OP,
            fetcher_of(vec![item("totoro", 1988)], Arc::clone(&hits)),
            TTL,
            |item: &Item| item.key,
            vec![counter],
        );

        registry.request_through_cache(&OP, true, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Cache hit: no refresh, no callback.
        registry.request_through_cache(&OP, true, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_refreshes_both_hit_upstream() {
        // Accepted race, asserted deliberately: two callers observing a due
        // cache both refresh, both batches merge, and the later commit owns
        // the next TTL window. Single-flight coordination would be a
        // behavior change, not a fix.
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = CacheRegistry::new();
        registry.bind(
            &OP,
            {
                let hits = Arc::clone(&hits);
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    stream::once(async {
                        // Suspend mid-drain so the second caller gets a look
                        // at the still-stale store.
                        tokio::task::yield_now().await;
                        Ok(item("totoro", 1988))
                    })
                    .boxed()
                }
            },
            TTL,
            |item: &Item| item.key,
            Vec::new(),
        );

        let (a, b) = tokio::join!(
            registry.request_through_cache(&OP, true, None),
            registry.request_through_cache(&OP, true, None),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let store = registry.cache(&OP).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn rebinding_replaces_the_store() {
        let mut registry = CacheRegistry::new();
        bind_items(&mut registry, vec![item("totoro", 1988)]);
        registry.request_through_cache(&OP, true, None).await.unwrap();

        bind_items(&mut registry, vec![item("ponyo", 2008)]);
        let store = registry.cache(&OP).unwrap();
        assert!(store.is_empty());
        assert!(!store.can_fallback_to_stale());
    }
}

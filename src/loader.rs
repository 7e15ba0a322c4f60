use std::{
    any::Any,
    borrow::Cow,
    fmt::{self, Debug, Formatter},
    future::IntoFuture,
    hash::Hash,
    num::NonZeroUsize,
    sync::Arc,
};

use arc_swap::ArcSwapOption;
use futures::future;
use serde::Deserialize;

use crate::{
    batch::{Batch, BatchFn, KeyBatch, Publisher},
    cache::{PromiseCache, PromiseCacheKey, Subscription},
    error::LoadError,
    promise::{Promise, PromiseFuture},
    scope::DataScope,
};

/// Configuration of a [`DataLoader`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderOptions {
    /// Maximum number of unique keys per batch. When the open batch is
    /// full, a new one is started.
    pub max_batch_size: Option<NonZeroUsize>,
    /// Memoize promises in the scope's cache. Without caching, duplicate
    /// keys are still coalesced within a batch, but every batch fetches its
    /// keys anew.
    pub caching: bool,
    /// Publish every value this loader resolves to the cache's observers,
    /// so that sibling loaders can prime themselves with it.
    pub publish: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_batch_size: None,
            caching: true,
            publish: false,
        }
    }
}

/// A loader for one kind of entity, batching and caching lookups within a
/// [`DataScope`].
///
/// Every call to [`load`](Self::load) joins the loader's open batch (or
/// starts one and hands it to the scope's scheduler). Within the scope, each
/// key is fetched at most once: the promise for a key is cached under
/// `(kind, key)`, and later loads of the key wait on the same promise.
pub struct DataLoader<K, V, E> {
    kind: Cow<'static, str>,
    options: LoaderOptions,
    scope: DataScope,
    fetch: Arc<dyn BatchFn<K, V, E>>,
    current: ArcSwapOption<KeyBatch<K, V, E>>,
}

impl<K, V, E> Debug for DataLoader<K, V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLoader")
            .field("kind", &self.kind)
            .field("options", &self.options)
            .field("scope", &self.scope)
            .field("fetch", &"<closure>")
            .finish()
    }
}

fn same_batch<T>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl<K, V, E> DataLoader<K, V, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(
        scope: &DataScope,
        kind: impl Into<Cow<'static, str>>,
        options: LoaderOptions,
        fetch: impl BatchFn<K, V, E> + 'static,
    ) -> Self {
        Self {
            kind: kind.into(),
            options,
            scope: scope.clone(),
            fetch: Arc::new(fetch),
            current: ArcSwapOption::empty(),
        }
    }

    /// The cache key kind of this loader's entries.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn scope(&self) -> &DataScope {
        &self.scope
    }

    pub fn cache_key(&self, key: K) -> PromiseCacheKey {
        PromiseCacheKey::new(self.kind.clone(), key)
    }

    /// Load the value for a single key. The returned future completes once
    /// the batch carrying the key has been dispatched by the scheduler.
    pub fn load(&self, key: K) -> PromiseFuture<V, E> {
        self.promise(key).into_future()
    }

    /// Load several keys. All of them are enqueued before anything is
    /// awaited, so they share batches. Each key gets its own result.
    pub async fn load_many(
        &self,
        keys: impl IntoIterator<Item = K>,
    ) -> Vec<Result<V, LoadError<E>>> {
        let pending: Vec<_> = keys.into_iter().map(|key| self.load(key)).collect();
        future::join_all(pending).await
    }

    /// Get the promise for `key`: the cached one, or a new one fed by the
    /// open batch.
    pub fn promise(&self, key: K) -> Promise<V, E> {
        if !self.options.caching {
            return self.enqueue(key);
        }

        let cache_key = self.cache_key(key.clone());
        self.scope
            .cache()
            .get_or_add_task(cache_key, |_| self.enqueue(key))
            .unwrap_or_else(|error| Promise::rejected(LoadError::Cache(error)))
    }

    /// Seed the cache with a known value. Returns false if the key already
    /// has an entry (or caching is disabled); existing entries are kept.
    pub fn prime(&self, key: K, value: V) -> bool {
        self.options.caching
            && self
                .scope
                .cache()
                .try_add(self.cache_key(key), Promise::<V, E>::resolved(value))
    }

    /// Forget the cached promise for `key`, so that the next load fetches it
    /// again.
    pub fn remove(&self, key: &K) -> bool {
        self.scope.cache().try_remove(&self.cache_key(key.clone()))
    }

    /// Forget every cached promise of this loader. Entries of other kinds in
    /// the shared cache are left alone.
    pub fn clear(&self) {
        let removed = self.scope.cache().clear_kind(&self.kind);
        tracing::debug!(kind = %self.kind, removed, "cleared loader cache entries");
    }

    /// Prime this loader from values published by other loaders in the
    /// scope. `extract` maps each published `P` to the key-value pairs it
    /// provides for this loader; existing entries are never overwritten.
    /// Publications by this loader itself are skipped.
    pub fn observe<P, F, I>(&self, extract: F) -> Subscription
    where
        P: Any,
        F: Fn(&P) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = (K, V)>,
    {
        let kind = self.kind.clone();

        self.scope.cache().subscribe(
            move |cache: &PromiseCache, published: &P| {
                for (key, value) in extract(published) {
                    let key = PromiseCacheKey::new(kind.clone(), key);
                    cache.try_add(key, Promise::<V, E>::resolved(value));
                }
            },
            Some(&self.kind),
        )
    }

    /// Get the branch of this loader registered under `branch_key`, or create
    /// it from `state`. Branches share this loader's scope, so they see each
    /// other's publications, and they are keyed by this loader's kind.
    pub fn branch<L, S>(
        &self,
        branch_key: &str,
        state: S,
        create: impl FnOnce(&DataScope, S) -> L,
    ) -> Arc<L>
    where
        L: Send + Sync + 'static,
    {
        let key = format!("{}/{}", self.kind, branch_key);
        self.scope.branch(&key, move |scope| create(scope, state))
    }

    fn publisher(&self) -> Option<Publisher<V>> {
        if !self.options.publish {
            return None;
        }

        let cache = self.scope.cache().clone();
        let kind = self.kind.clone();
        Some(Arc::new(move |value: &V| cache.publish_from(&kind, value)))
    }

    /// Add `key` to the open batch, opening a new one if there is none or
    /// the open one no longer accepts keys.
    fn enqueue(&self, key: K) -> Promise<V, E> {
        loop {
            let current = self.current.load_full();

            if let Some(batch) = current.as_ref() {
                if let Ok(promise) = batch.add_item(key.clone()) {
                    return promise;
                }
            }

            // The key goes in before the batch is published, so that whoever
            // else finds the batch can never observe it empty.
            let fresh = Arc::new(
                KeyBatch::new(Arc::clone(&self.fetch), self.options.max_batch_size)
                    .with_publisher(self.publisher()),
            );
            let promise = match fresh.add_item(key.clone()) {
                Ok(promise) => promise,
                Err(_) => continue,
            };

            let previous = self
                .current
                .compare_and_swap(&current, Some(Arc::clone(&fresh)));

            if same_batch(&previous, &current) {
                tracing::trace!(kind = %self.kind, batch = %fresh.id(), "opened batch");
                self.scope.scheduler().schedule(fresh);
                return promise;
            }

            // Lost the race against another caller; join their batch instead.
            // Nobody has seen the fresh batch or its promise.
        }
    }
}

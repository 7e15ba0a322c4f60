//! The per-scope promise cache.
//!
//! A [`PromiseCache`] maps composite keys to promises, so that every key is
//! fetched at most once per scope and every concurrent caller observes the
//! same in-flight result. One cache can be shared by loaders of many kinds:
//! each [`PromiseCacheKey`] is namespaced by its `kind`, and entries are
//! type-erased and downcast on access.
//!
//! The cache is bounded. When inserting a new entry would exceed its
//! capacity, the oldest inserted entry that has already settled is evicted
//! (least-recently-added). Lookups don't refresh an entry's age.
//!
//! Pending entries are never evicted: dropping one would let a later lookup
//! of the same key create a second promise, and fetch the key a second time,
//! while the first fetch is still in flight. While every entry is pending the
//! cache grows past its capacity, and shrinks back on later insertions once
//! they settle.

use std::{
    any::{Any, TypeId},
    borrow::Cow,
    collections::{HashMap, VecDeque},
    fmt::{self, Debug, Formatter},
    hash::{Hash, Hasher},
    sync::atomic::{AtomicBool, Ordering},
    sync::{Arc, Mutex, Weak},
};

use serde::Deserialize;

use crate::{error::CacheError, interceptor::CacheInterceptor, lock, promise::Promise};

/// A promise with its value and error types erased, as stored by the cache
/// and by interceptors.
pub type ErasedPromise = Arc<dyn Any + Send + Sync>;

/// A lookup key that can live in a [`PromiseCacheKey`]. This is implemented
/// for every `Eq + Hash + Debug` type that is `Send + Sync + 'static`; keys
/// of different types never compare equal.
pub trait CacheKeyValue: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn CacheKeyValue) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
}

impl<T> CacheKeyValue for T
where
    T: Any + Debug + Eq + Hash + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn CacheKeyValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map_or(false, |other| self == other)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }
}

/// The composite key of a cache entry: the loader kind it belongs to, and
/// the loader-specific lookup key.
#[derive(Clone)]
pub struct PromiseCacheKey {
    kind: Cow<'static, str>,
    key: Arc<dyn CacheKeyValue>,
}

impl PromiseCacheKey {
    pub fn new(kind: impl Into<Cow<'static, str>>, key: impl CacheKeyValue) -> Self {
        Self {
            kind: kind.into(),
            key: Arc::new(key),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn key(&self) -> &dyn CacheKeyValue {
        &*self.key
    }

    /// Get the lookup key as a concrete type, if it is one.
    pub fn downcast_key<T: Any>(&self) -> Option<&T> {
        self.key.as_any().downcast_ref()
    }
}

impl Debug for PromiseCacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.kind, self.key)
    }
}

impl PartialEq for PromiseCacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.key.dyn_eq(&*other.key)
    }
}

impl Eq for PromiseCacheKey {}

impl Hash for PromiseCacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.key.dyn_hash(state);
    }
}

/// Configuration of a [`PromiseCache`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Maximum number of entries. A capacity of 0 is treated as 1.
    pub capacity: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

struct Entry {
    promise: ErasedPromise,
    generation: u64,
    // Captured at insertion, when the promise's concrete type is known.
    is_settled: fn(&ErasedPromise) -> bool,
}

impl Entry {
    fn evictable(&self) -> bool {
        (self.is_settled)(&self.promise)
    }
}

fn promise_settled<V, E>(promise: &ErasedPromise) -> bool
where
    V: Send + 'static,
    E: Send + 'static,
{
    // An entry of some other type can't be awaited as this one; it has
    // nobody to strand.
    promise
        .downcast_ref::<Promise<V, E>>()
        .map_or(true, Promise::is_settled)
}

struct Table {
    entries: HashMap<PromiseCacheKey, Entry>,
    // Insertion order, oldest first. Entries removed or replaced since their
    // insertion leave stale records behind, recognized by their generation.
    order: VecDeque<(u64, PromiseCacheKey)>,
    next_generation: u64,
    interceptors: HashMap<Cow<'static, str>, Arc<dyn CacheInterceptor>>,
}

impl Table {
    fn insert<V, E>(&mut self, capacity: usize, key: PromiseCacheKey, promise: ErasedPromise)
    where
        V: Send + 'static,
        E: Send + 'static,
    {
        while self.entries.len() >= capacity {
            if !self.evict_oldest() {
                break;
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        self.order.push_back((generation, key.clone()));
        self.entries.insert(
            key,
            Entry {
                promise,
                generation,
                is_settled: promise_settled::<V, E>,
            },
        );

        if self.order.len() > self.entries.len() * 2 + 16 {
            let entries = &self.entries;
            self.order.retain(|(generation, key)| {
                entries
                    .get(key)
                    .map_or(false, |entry| entry.generation == *generation)
            });
        }
    }

    /// Evict the oldest settled entry. Returns false if every entry is
    /// still pending.
    fn evict_oldest(&mut self) -> bool {
        let entries = &self.entries;
        let position = self.order.iter().position(|(generation, key)| {
            entries
                .get(key)
                .map_or(false, |entry| entry.generation == *generation && entry.evictable())
        });

        match position.and_then(|position| self.order.remove(position)) {
            Some((_generation, key)) => {
                tracing::trace!(key = ?key, "evicting oldest settled cache entry");
                self.entries.remove(&key);
                true
            }
            None => {
                tracing::trace!(usage = entries.len(), "every cache entry is pending, none evicted");
                false
            }
        }
    }

    fn interceptor(&self, key: &PromiseCacheKey) -> Option<Arc<dyn CacheInterceptor>> {
        self.interceptors.get(key.kind()).cloned()
    }
}

type Observer = Box<dyn Fn(&PromiseCache, &dyn Any) + Send + Sync>;

struct Subscriber {
    id: u64,
    value_type: TypeId,
    skip_kind: Option<String>,
    active: AtomicBool,
    observer: Observer,
}

#[derive(Default)]
struct Subscribers {
    list: Vec<Arc<Subscriber>>,
    next_id: u64,
}

struct Inner {
    capacity: usize,
    table: Mutex<Table>,
    subscribers: Mutex<Subscribers>,
}

/// A bounded, thread-safe map from [`PromiseCacheKey`] to [`Promise`].
///
/// `PromiseCache` is a handle; clones share the same table.
#[derive(Clone)]
pub struct PromiseCache {
    inner: Arc<Inner>,
}

impl Debug for PromiseCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseCache")
            .field("size", &self.size())
            .field("usage", &self.usage())
            .field("subscribers", &lock(&self.inner.subscribers).list.len())
            .finish()
    }
}

impl Default for PromiseCache {
    fn default() -> Self {
        Self::new(CacheOptions::default())
    }
}

fn downcast<V, E>(key: &PromiseCacheKey, promise: &ErasedPromise) -> Result<Promise<V, E>, CacheError>
where
    V: Send + 'static,
    E: Send + 'static,
{
    promise
        .downcast_ref::<Promise<V, E>>()
        .cloned()
        .ok_or_else(|| CacheError::TypeMismatch {
            kind: key.kind().to_owned(),
        })
}

impl PromiseCache {
    pub fn new(options: CacheOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: options.capacity.max(1),
                table: Mutex::new(Table {
                    entries: HashMap::new(),
                    order: VecDeque::new(),
                    next_generation: 0,
                    interceptors: HashMap::new(),
                }),
                subscribers: Mutex::new(Subscribers::default()),
            }),
        }
    }

    /// Route every entry of the given kind through `interceptor` as a second
    /// level. Replaces any interceptor previously registered for the kind.
    pub fn register_interceptor(
        &self,
        kind: impl Into<Cow<'static, str>>,
        interceptor: Arc<dyn CacheInterceptor>,
    ) {
        lock(&self.inner.table)
            .interceptors
            .insert(kind.into(), interceptor);
    }

    /// The configured capacity.
    pub fn size(&self) -> usize {
        self.inner.capacity
    }

    /// The current number of entries.
    pub fn usage(&self) -> usize {
        lock(&self.inner.table).entries.len()
    }

    /// Get the promise cached for `key`, if there is one.
    pub fn get<V, E>(&self, key: &PromiseCacheKey) -> Option<Promise<V, E>>
    where
        V: Send + 'static,
        E: Send + 'static,
    {
        let table = lock(&self.inner.table);
        table
            .entries
            .get(key)
            .and_then(|entry| downcast(key, &entry.promise).ok())
    }

    /// Return the promise cached for `key`, or create one with `create`,
    /// insert it and return it. The lookup and the insertion are atomic:
    /// `create` is invoked at most once per missing key no matter how many
    /// callers race for it, and they all get the same promise instance.
    ///
    /// If an interceptor is registered for the key's kind, it is consulted
    /// on a miss. Whatever promise it settles on becomes the entry in this
    /// cache too.
    ///
    /// `create` runs while the cache is locked, so it must not call back
    /// into this cache.
    pub fn get_or_add_task<V, E>(
        &self,
        key: PromiseCacheKey,
        create: impl FnOnce(&PromiseCacheKey) -> Promise<V, E>,
    ) -> Result<Promise<V, E>, CacheError>
    where
        V: Send + 'static,
        E: Send + 'static,
    {
        let mut table = lock(&self.inner.table);

        if let Some(entry) = table.entries.get(&key) {
            return downcast(&key, &entry.promise);
        }

        let erased: ErasedPromise = match table.interceptor(&key) {
            Some(interceptor) => interceptor.get_or_add(
                &key,
                Box::new(|| Arc::new(create(&key)) as ErasedPromise),
            ),
            None => Arc::new(create(&key)),
        };

        let promise = downcast(&key, &erased)?;
        table.insert::<V, E>(self.inner.capacity, key, erased);

        Ok(promise)
    }

    /// Insert `promise` for `key` unless an entry already exists. Returns
    /// whether the insertion happened. Existing entries, in-flight or
    /// settled, are never overwritten.
    pub fn try_add<V, E>(&self, key: PromiseCacheKey, promise: Promise<V, E>) -> bool
    where
        V: Send + 'static,
        E: Send + 'static,
    {
        self.try_add_with(key, move |_| promise)
    }

    /// Same as [`try_add`](Self::try_add), but the promise is only created
    /// if the key is missing.
    ///
    /// If an interceptor is registered for the key's kind and already holds
    /// a promise for it, that promise becomes the entry in this cache
    /// instead, and this returns false.
    pub fn try_add_with<V, E>(
        &self,
        key: PromiseCacheKey,
        create: impl FnOnce(&PromiseCacheKey) -> Promise<V, E>,
    ) -> bool
    where
        V: Send + 'static,
        E: Send + 'static,
    {
        let mut table = lock(&self.inner.table);

        if table.entries.contains_key(&key) {
            return false;
        }

        let (erased, added) = match table.interceptor(&key) {
            Some(interceptor) => {
                let mut created: Option<ErasedPromise> = None;
                let canonical = interceptor.get_or_add(
                    &key,
                    Box::new(|| {
                        let erased: ErasedPromise = Arc::new(create(&key));
                        created = Some(Arc::clone(&erased));
                        erased
                    }),
                );

                let added = created.map_or(false, |created| Arc::ptr_eq(&created, &canonical));
                (canonical, added)
            }
            None => (Arc::new(create(&key)) as ErasedPromise, true),
        };

        table.insert::<V, E>(self.inner.capacity, key, erased);
        added
    }

    /// Remove the entry for `key`, for instance after a write made it stale.
    /// Returns whether there was an entry.
    pub fn try_remove(&self, key: &PromiseCacheKey) -> bool {
        let mut table = lock(&self.inner.table);

        if let Some(interceptor) = table.interceptor(key) {
            interceptor.remove(key);
        }

        table.entries.remove(key).is_some()
    }

    /// Remove every entry. Interceptors are left untouched; they outlive the
    /// scope this cache belongs to.
    pub fn clear(&self) {
        let mut table = lock(&self.inner.table);
        table.entries.clear();
        table.order.clear();
    }

    /// Remove every entry of one kind. Returns how many were removed.
    pub fn clear_kind(&self, kind: &str) -> usize {
        let mut table = lock(&self.inner.table);
        let before = table.entries.len();
        table.entries.retain(|key, _entry| key.kind() != kind);
        before - table.entries.len()
    }

    /// Notify observers of `V` about an already-resolved value. This never
    /// writes to this cache.
    pub fn publish<V: Any>(&self, value: &V) {
        self.notify(None, value);
    }

    pub fn publish_many<'a, V: Any>(&self, values: impl IntoIterator<Item = &'a V>) {
        for value in values {
            self.notify(None, value);
        }
    }

    /// Like [`publish`](Self::publish), for a value resolved through an
    /// entry of kind `origin`. Observers that asked to skip that kind are
    /// not notified.
    pub fn publish_from<V: Any>(&self, origin: &str, value: &V) {
        self.notify(Some(origin), value);
    }

    fn notify(&self, origin: Option<&str>, value: &dyn Any) {
        let value_type = value.type_id();

        // Snapshot the subscribers, so that observers can subscribe,
        // unsubscribe or use the cache without deadlocking.
        let subscribers: Vec<Arc<Subscriber>> = lock(&self.inner.subscribers)
            .list
            .iter()
            .filter(|subscriber| subscriber.value_type == value_type)
            .filter(|subscriber| match (origin, subscriber.skip_kind.as_deref()) {
                (Some(origin), Some(skip)) => origin != skip,
                _ => true,
            })
            .cloned()
            .collect();

        for subscriber in subscribers {
            if subscriber.active.load(Ordering::Acquire) {
                (subscriber.observer)(self, value);
            }
        }
    }

    /// Register `next` to be called with every published value of type `V`.
    /// Publications that originate from `skip_kind` are not delivered; a
    /// loader passes its own kind here so that it doesn't observe its own
    /// values.
    ///
    /// The observer runs on the publishing thread, with no cache lock held.
    /// It stays registered until the returned [`Subscription`] is dropped or
    /// unsubscribed.
    #[must_use = "dropping the Subscription unsubscribes immediately"]
    pub fn subscribe<V, F>(
        &self,
        next: F,
        skip_kind: Option<&str>,
    ) -> Subscription
    where
        V: Any,
        F: Fn(&PromiseCache, &V) + Send + Sync + 'static,
    {
        let observer: Observer = Box::new(move |cache, value| {
            if let Some(value) = value.downcast_ref::<V>() {
                next(cache, value);
            }
        });

        let mut subscribers = lock(&self.inner.subscribers);
        let id = subscribers.next_id;
        subscribers.next_id += 1;

        let subscriber = Arc::new(Subscriber {
            id,
            value_type: TypeId::of::<V>(),
            skip_kind: skip_kind.map(str::to_owned),
            active: AtomicBool::new(true),
            observer,
        });
        subscribers.list.push(Arc::clone(&subscriber));

        Subscription {
            cache: Arc::downgrade(&self.inner),
            subscriber,
        }
    }
}

/// Handle to a registered cache observer. The observer is removed when this
/// is dropped or [`unsubscribe`](Self::unsubscribe)d.
pub struct Subscription {
    cache: Weak<Inner>,
    subscriber: Arc<Subscriber>,
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.subscriber.id)
            .field("skip_kind", &self.subscriber.skip_kind)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.subscriber.active.load(Ordering::Acquire)
    }

    /// Stop receiving publications. Safe to call more than once, and safe to
    /// call while a publication is being delivered on another thread: the
    /// observer is not invoked by any publication that checks it afterwards.
    pub fn unsubscribe(&self) {
        if !self.subscriber.active.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(inner) = self.cache.upgrade() {
            let id = self.subscriber.id;
            lock(&inner.subscribers)
                .list
                .retain(|subscriber| subscriber.id != id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

//! Second-level caches.
//!
//! An interceptor is consulted by a [`PromiseCache`](crate::PromiseCache)
//! for every entry of the kind it is registered for. It sees promises in
//! their type-erased form, so one interceptor can serve loaders of any shape.

use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    sync::Mutex,
};

use crate::{
    cache::{ErasedPromise, PromiseCacheKey},
    lock,
};

/// A store consulted alongside a [`PromiseCache`](crate::PromiseCache).
///
/// Interceptors are called while the primary cache is locked, so they must
/// not call back into it.
pub trait CacheInterceptor: Send + Sync {
    /// Return the promise stored for `key`, or store and return the one
    /// produced by `create`. Whatever this returns becomes the canonical
    /// promise for `key` in the primary cache as well.
    fn get_or_add(
        &self,
        key: &PromiseCacheKey,
        create: Box<dyn FnOnce() -> ErasedPromise + '_>,
    ) -> ErasedPromise;

    /// Store `promise` unless an entry already exists; returns whether it
    /// was stored.
    fn try_add(&self, key: &PromiseCacheKey, promise: ErasedPromise) -> bool;

    /// Remove the entry for `key`; returns whether there was one.
    fn remove(&self, key: &PromiseCacheKey) -> bool;
}

/// An unbounded in-process interceptor. Sharing one `MemoryInterceptor`
/// between the caches of several scopes lets a later scope reuse values (or
/// in-flight fetches) of an earlier one.
#[derive(Default)]
pub struct MemoryInterceptor {
    entries: Mutex<HashMap<PromiseCacheKey, ErasedPromise>>,
}

impl Debug for MemoryInterceptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryInterceptor")
            .field("entries", &self.len())
            .finish()
    }
}

impl MemoryInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

impl CacheInterceptor for MemoryInterceptor {
    fn get_or_add(
        &self,
        key: &PromiseCacheKey,
        create: Box<dyn FnOnce() -> ErasedPromise + '_>,
    ) -> ErasedPromise {
        lock(&self.entries)
            .entry(key.clone())
            .or_insert_with(create)
            .clone()
    }

    fn try_add(&self, key: &PromiseCacheKey, promise: ErasedPromise) -> bool {
        let mut entries = lock(&self.entries);
        if entries.contains_key(key) {
            return false;
        }

        entries.insert(key.clone(), promise);
        true
    }

    fn remove(&self, key: &PromiseCacheKey) -> bool {
        lock(&self.entries).remove(key).is_some()
    }
}

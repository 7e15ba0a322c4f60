//! Batchscope is a batching and caching layer for data loaders, in the
//! spirit of the [dataloader pattern](https://github.com/graphql/dataloader).
//! Independent call sites ask for single entities by key; the keys are
//! collected into batches, each batch is fetched with one backend
//! round-trip, and every caller gets back its own value. Within one unit of
//! work (a [`DataScope`]) every key is fetched at most once.
//!
//! ## Overview
//!
//! A loader is built around a *fetch delegate*: an async function that takes
//! a [`KeySet`] of unique keys and returns a [`ValueSet`] pairing every key
//! with its value. The only way to build a [`ValueSet`] is through the
//! methods of the [`KeySet`] it answers, so a delegate can't forget a key or
//! make one up.
//!
//! ```
//! use batchscope::KeySet;
//! # use batchscope::ValueSet;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug, Clone)]
//! struct ApiError;
//!
//! async fn fetch_names(
//!     ids: KeySet<u32>,
//!     _cancel: CancellationToken,
//! ) -> Result<ValueSet<String>, ApiError> {
//!     // A real delegate would send `ids.keys()` to a backend here.
//!     Ok(ids.into_values(|id| format!("user {}", id)))
//! }
//! ```
//!
//! Loaders live in a [`DataScope`], which bundles the [`BatchScheduler`]
//! that decides when batches are dispatched with the [`PromiseCache`] that
//! memoizes results. [`TurnScheduler`] dispatches a batch once it has gone
//! a whole turn without receiving new keys; turns are either run manually
//! with [`TurnScheduler::run_turn`] or by a background task running
//! [`TurnScheduler::run`].
//!
//! ```
//! # use batchscope::{KeySet, ValueSet};
//! # use tokio_util::sync::CancellationToken;
//! # #[derive(Debug, Clone)] struct ApiError;
//! # async fn fetch_names(ids: KeySet<u32>, _cancel: CancellationToken)
//! #     -> Result<ValueSet<String>, ApiError> {
//! #     Ok(ids.into_values(|id| format!("user {}", id)))
//! # }
//! use std::sync::Arc;
//!
//! use batchscope::{DataLoader, DataScope, LoaderOptions, PromiseCache, TurnScheduler};
//! use futures::executor;
//!
//! let scheduler = Arc::new(TurnScheduler::new());
//! let scope = DataScope::new(scheduler.clone(), PromiseCache::default());
//! let users = DataLoader::new(&scope, "user", LoaderOptions::default(), fetch_names);
//!
//! let (alice, bob) = executor::block_on(async {
//!     let alice = users.load(1);
//!     let bob = users.load(2);
//!
//!     // The first turn finds the batch still collecting keys, the second
//!     // one dispatches it.
//!     scheduler.run_turn().await;
//!     scheduler.run_turn().await;
//!
//!     (alice.await, bob.await)
//! });
//!
//! assert_eq!(alice.unwrap(), "user 1");
//! assert_eq!(bob.unwrap(), "user 2");
//! ```
//!
//! ## Design notes
//!
//! ### Promises
//!
//! Everything a caller waits on is a [`Promise`]: a single-assignment slot
//! that settles exactly once, with a value or a [`LoadError`]. The cache
//! stores promises rather than values, so a second caller asking for a key
//! whose fetch is still in flight joins the same fetch instead of starting
//! another one.
//!
//! ### Type-erased cache
//!
//! Loaders of every shape share one [`PromiseCache`] per scope. Entries are
//! keyed by a [`PromiseCacheKey`] (a loader *kind* plus a type-erased key)
//! and hold type-erased promises; loaders downcast them back on the way
//! out. A value resolved by one loader can be published to observers, so
//! that other loaders holding the same entity under a different key can
//! prime their own entries.
//!
//! ### Explicit scopes
//!
//! There is no ambient or thread-local state. A [`DataScope`] is passed to
//! every loader it serves, and cloning it is cheap.

use std::sync::{Mutex, MutexGuard, PoisonError};

mod batch;
mod cache;
mod data;
mod error;
mod interceptor;
mod loader;
mod promise;
mod scheduler;
mod scope;
mod test;
mod wakerset;

pub use batch::{Batch, BatchFn, BatchId, BatchStatus, KeyBatch};
pub use cache::{
    CacheKeyValue, CacheOptions, ErasedPromise, PromiseCache, PromiseCacheKey, Subscription,
};
pub use data::{IntoValuesError, KeySet, KeyedEntry, OnDuplicate, ValueSet};
pub use error::{AddItemError, BatchError, CacheError, LoadError};
pub use interceptor::{CacheInterceptor, MemoryInterceptor};
pub use loader::{DataLoader, LoaderOptions};
pub use promise::{Promise, PromiseFuture};
pub use scheduler::{BatchScheduler, TurnScheduler};
pub use scope::DataScope;

/// Lock a mutex, recovering the guard if a panicking thread poisoned it.
/// Every critical section in this crate leaves its data consistent between
/// statements, so a poisoned lock is still safe to use.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

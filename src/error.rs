//! Error types shared by batches, promises and caches.

use thiserror::Error;

/// The failure a single [`Promise`](crate::Promise) settles with.
///
/// Every waiter on a key observes a clone of the same settlement, so this
/// type (and the fetch error it wraps) must be `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<E> {
    /// The batch function returned an error. Every key of that batch fails
    /// with a clone of it.
    #[error("batch fetch failed: {0}")]
    Fetch(E),
    /// The batch was cancelled before its fetch completed.
    #[error("batch dispatch was cancelled")]
    Cancelled,
    /// The batch function panicked. The attached string is the panic
    /// message, if it had one.
    #[error("batch function panicked: {0}")]
    Panicked(String),
    /// The batch function completed, but no value was paired with this key.
    #[error("no value was produced for this key")]
    MissingValue,
    /// The batch owning this key was dropped without ever being dispatched.
    #[error("batch was dropped before it was dispatched")]
    Abandoned,
    /// The cache refused the lookup.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl<E> LoadError<E> {
    /// True if this is the cancellation condition rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Programmer errors in driving a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BatchError {
    /// `dispatch` was called on a batch that has already been dispatched.
    #[error("batch has already been dispatched")]
    AlreadyDispatched,
}

/// A key was refused by a batch. The key is handed back so that the caller
/// can place it in a fresh batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddItemError<K> {
    /// The batch has begun (or finished) dispatching and is frozen.
    #[error("cannot add a key to a batch that has already been dispatched")]
    Dispatched(K),
    /// The batch already holds its maximum number of unique keys.
    #[error("batch is full")]
    Full(K),
}

impl<K> AddItemError<K> {
    pub fn into_key(self) -> K {
        match self {
            Self::Dispatched(key) | Self::Full(key) => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// An entry exists for this key, but it holds a promise of a different
    /// value or error type. This happens when two loaders of different
    /// shapes are registered under the same kind.
    #[error("cache entry of kind `{kind}` holds a different promise type")]
    TypeMismatch { kind: String },
}

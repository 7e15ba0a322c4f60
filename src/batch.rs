use std::{
    any::Any,
    fmt::{self, Debug, Display, Formatter},
    future::Future,
    hash::Hash,
    mem,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    pin::pin,
    sync::atomic::{AtomicU64, Ordering},
    sync::{Arc, Mutex},
    time::Instant,
};

use futures::{
    future::{self, BoxFuture, Either},
    FutureExt,
};
use tokio_util::sync::CancellationToken;

use crate::{
    data::{KeySet, Token as KeyToken, ValueSet},
    error::{AddItemError, BatchError, LoadError},
    lock,
    promise::Promise,
};

/// Process-unique identity of a batch. The scheduler uses it to keep
/// `schedule` idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(u64);

impl BatchId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        BatchId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a batch.
///
/// A batch is `Enqueued` whenever it has received a key since the scheduler
/// last looked at it, and `Touched` once the scheduler has observed it
/// without anything new arriving. `Dispatched` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Enqueued,
    Touched,
    Dispatched,
}

/// The scheduler's view of a batch of any key and value type.
pub trait Batch: Send + Sync {
    fn id(&self) -> BatchId;

    /// Number of unique keys accumulated so far.
    fn size(&self) -> usize;

    fn status(&self) -> BatchStatus;

    /// When the most recent key was added.
    fn modified(&self) -> Instant;

    /// Stability probe, called once per scheduler turn. Returns false if
    /// keys arrived since the previous touch (the batch should wait one more
    /// turn) and true if the batch is stable and may be dispatched. A
    /// dispatched batch is never stable.
    fn touch(&self) -> bool;

    /// Freeze the batch and run its fetch over every accumulated key. The
    /// batch is frozen as soon as this is called, before the returned
    /// future is first polled. Every promise fed by the batch is settled
    /// when the future completes, or abandoned if it is dropped early.
    ///
    /// Returns [`BatchError::AlreadyDispatched`] on a second call.
    fn dispatch(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<(), BatchError>>;
}

/// The fetch delegate of a loader: given the unique keys of one batch, load
/// all of their values at once.
///
/// This is implemented for any `Fn(KeySet<K>, CancellationToken) -> Fut`
/// closure, so most loaders never implement it by hand.
pub trait BatchFn<K, V, E>: Send + Sync {
    fn load(
        &self,
        keys: KeySet<K>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<ValueSet<V>, E>>;
}

impl<K, V, E, F, Fut> BatchFn<K, V, E> for F
where
    F: Fn(KeySet<K>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ValueSet<V>, E>> + Send + 'static,
{
    fn load(
        &self,
        keys: KeySet<K>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<ValueSet<V>, E>> {
        self(keys, cancel).boxed()
    }
}

/// Called with every value a batch resolves, after its promise is settled.
pub(crate) type Publisher<V> = Arc<dyn Fn(&V) + Send + Sync>;

/// The promises fed by a batch. Any promise still unsettled when this is
/// dropped is rejected with [`LoadError::Abandoned`], so that a batch that is
/// dropped (or whose dispatch future is dropped) never leaves callers waiting
/// forever.
struct PendingPromises<V, E>(Vec<(KeyToken, Promise<V, E>)>);

impl<V, E> Drop for PendingPromises<V, E> {
    fn drop(&mut self) {
        for (_token, promise) in self.0.drain(..) {
            promise.reject(LoadError::Abandoned);
        }
    }
}

struct AccumulatingState<K, V, E> {
    keys: KeySet<K>,
    promises: PendingPromises<V, E>,
    status: BatchStatus,
    modified: Instant,
}

enum State<K, V, E> {
    Accum(AccumulatingState<K, V, E>),
    Dispatched { size: usize, modified: Instant },
}

impl<K, V, E> State<K, V, E> {
    /// Transition to Dispatched, returning the accumulated keys and promises.
    /// Returns None if the batch was already dispatched.
    fn freeze(&mut self) -> Option<AccumulatingState<K, V, E>> {
        let (size, modified) = match self {
            State::Accum(state) => (state.promises.0.len(), state.modified),
            State::Dispatched { .. } => return None,
        };

        match mem::replace(self, State::Dispatched { size, modified }) {
            State::Accum(state) => Some(state),
            State::Dispatched { .. } => None,
        }
    }
}

/// A batch of keys of type `K`, resolving to `V` or failing with `E`.
///
/// Loaders add keys with [`add_item`](Self::add_item), which returns the
/// promise the key will be settled through, and hand the batch to a
/// scheduler which decides when to dispatch it.
pub struct KeyBatch<K, V, E> {
    id: BatchId,
    max_size: Option<NonZeroUsize>,
    fetch: Arc<dyn BatchFn<K, V, E>>,
    publisher: Option<Publisher<V>>,
    state: Mutex<State<K, V, E>>,
}

impl<K, V, E> Debug for KeyBatch<K, V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let (status, size) = match *lock(&self.state) {
            State::Accum(ref state) => (state.status, state.promises.0.len()),
            State::Dispatched { size, .. } => (BatchStatus::Dispatched, size),
        };

        f.debug_struct("KeyBatch")
            .field("id", &self.id)
            .field("status", &status)
            .field("size", &size)
            .field("max_size", &self.max_size)
            .field("fetch", &"<closure>")
            .finish()
    }
}

impl<K, V, E> KeyBatch<K, V, E>
where
    K: Eq + Hash + Clone,
{
    pub fn new(fetch: Arc<dyn BatchFn<K, V, E>>, max_size: Option<NonZeroUsize>) -> Self {
        Self {
            id: BatchId::next(),
            max_size,
            fetch,
            publisher: None,
            state: Mutex::new(State::Accum(AccumulatingState {
                keys: KeySet::new(),
                promises: PendingPromises(Vec::new()),
                status: BatchStatus::Enqueued,
                modified: Instant::now(),
            })),
        }
    }

    /// Set a callback that receives every value this batch resolves.
    pub(crate) fn with_publisher(mut self, publisher: Option<Publisher<V>>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Add a key to this batch and get the promise it will be settled
    /// through. A key already in the batch yields the same promise instance
    /// as before. Either way the batch is marked `Enqueued` again, granting
    /// it another scheduler turn.
    ///
    /// Fails, handing the key back, if the batch was already dispatched or
    /// if the key is new and the batch is full.
    pub fn add_item(&self, key: K) -> Result<Promise<V, E>, AddItemError<K>> {
        let mut guard = lock(&self.state);

        let state = match *guard {
            State::Accum(ref mut state) => state,
            State::Dispatched { .. } => return Err(AddItemError::Dispatched(key)),
        };

        let full = match self.max_size {
            Some(max_size) => state.keys.len() >= max_size.get(),
            None => false,
        };

        if full && !state.keys.contains(&key) {
            return Err(AddItemError::Full(key));
        }

        let (token, added) = state.keys.add_key(key);
        if added {
            state.promises.0.push((token, Promise::new()));
        }

        state.status = BatchStatus::Enqueued;
        state.modified = Instant::now();

        // Promises are pushed in token order, one per unique key.
        let (_, promise) = &state.promises.0[token.index()];
        Ok(promise.clone())
    }
}

impl<K, V, E> Batch for KeyBatch<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn id(&self) -> BatchId {
        self.id
    }

    fn size(&self) -> usize {
        match *lock(&self.state) {
            State::Accum(ref state) => state.promises.0.len(),
            State::Dispatched { size, .. } => size,
        }
    }

    fn status(&self) -> BatchStatus {
        match *lock(&self.state) {
            State::Accum(ref state) => state.status,
            State::Dispatched { .. } => BatchStatus::Dispatched,
        }
    }

    fn modified(&self) -> Instant {
        match *lock(&self.state) {
            State::Accum(ref state) => state.modified,
            State::Dispatched { modified, .. } => modified,
        }
    }

    fn touch(&self) -> bool {
        match *lock(&self.state) {
            State::Accum(ref mut state) => match state.status {
                BatchStatus::Touched => true,
                _ => {
                    state.status = BatchStatus::Touched;
                    false
                }
            },
            State::Dispatched { .. } => false,
        }
    }

    fn dispatch(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<(), BatchError>> {
        let frozen = lock(&self.state).freeze();

        async move {
            let AccumulatingState { keys, promises, .. } = match frozen {
                Some(state) => state,
                None => {
                    tracing::error!(batch = %self.id, "batch dispatched more than once");
                    return Err(BatchError::AlreadyDispatched);
                }
            };

            if keys.is_empty() {
                tracing::trace!(batch = %self.id, "skipping empty batch");
                return Ok(());
            }

            let size = keys.len();
            tracing::debug!(batch = %self.id, keys = size, "dispatching batch");

            let outcome = self.run_fetch(keys, cancel).await;
            self.settle(promises, outcome);

            Ok(())
        }
        .boxed()
    }
}

/// How the fetch of a batch ended.
enum Outcome<V, E> {
    Values(ValueSet<V>),
    Failed(E),
    Cancelled,
    Panicked(String),
}

impl<K, V, E> KeyBatch<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    async fn run_fetch(&self, keys: KeySet<K>, cancel: CancellationToken) -> Outcome<V, E> {
        if cancel.is_cancelled() {
            tracing::debug!(batch = %self.id, "batch cancelled before its fetch started");
            return Outcome::Cancelled;
        }

        let started = panic::catch_unwind(AssertUnwindSafe(|| {
            self.fetch.load(keys, cancel.clone())
        }));

        let fetch = match started {
            Ok(fetch) => AssertUnwindSafe(fetch).catch_unwind(),
            Err(payload) => return Outcome::Panicked(panic_message(payload.as_ref())),
        };

        let cancelled = pin!(cancel.cancelled());
        match future::select(cancelled, fetch).await {
            Either::Left(..) => {
                tracing::debug!(batch = %self.id, "batch cancelled during fetch");
                Outcome::Cancelled
            }
            Either::Right((Ok(Ok(values)), _)) => Outcome::Values(values),
            Either::Right((Ok(Err(error)), _)) => {
                tracing::warn!(batch = %self.id, "batch fetch failed");
                Outcome::Failed(error)
            }
            Either::Right((Err(payload), _)) => {
                Outcome::Panicked(panic_message(payload.as_ref()))
            }
        }
    }

    fn settle(&self, mut promises: PendingPromises<V, E>, outcome: Outcome<V, E>) {
        // Promises are popped one at a time so that, should a publisher
        // panic, the ones not yet settled are still abandoned on drop.
        promises.0.reverse();

        match outcome {
            Outcome::Values(mut values) => {
                let mut resolved = 0usize;
                while let Some((token, promise)) = promises.0.pop() {
                    let value = match values.take(token) {
                        Some(value) => value,
                        None => {
                            promise.reject(LoadError::MissingValue);
                            continue;
                        }
                    };

                    resolved += 1;
                    match self.publisher {
                        Some(ref publish) => {
                            promise.resolve(value.clone());
                            publish(&value);
                        }
                        None => {
                            promise.resolve(value);
                        }
                    }
                }
                tracing::debug!(batch = %self.id, resolved, "batch resolved");
            }
            Outcome::Failed(error) => {
                while let Some((_token, promise)) = promises.0.pop() {
                    promise.reject(LoadError::Fetch(error.clone()));
                }
            }
            Outcome::Cancelled => {
                while let Some((_token, promise)) = promises.0.pop() {
                    promise.reject(LoadError::Cancelled);
                }
            }
            Outcome::Panicked(message) => {
                tracing::error!(batch = %self.id, panic = %message, "batch function panicked");
                while let Some((_token, promise)) = promises.0.pop() {
                    promise.reject(LoadError::Panicked(message.clone()));
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("<non-string panic payload>")
    }
}

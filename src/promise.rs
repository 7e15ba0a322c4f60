//! Single-assignment futures shared by every caller of a key.

use std::{
    fmt::{self, Debug, Formatter},
    future::{Future, IntoFuture},
    mem,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use crate::{
    error::LoadError,
    lock,
    wakerset::{Token as WakerToken, WakerSet},
};

enum State<V, E> {
    Pending(WakerSet),
    Settled(Result<V, LoadError<E>>),
}

/// A handle to the eventual result of resolving one key.
///
/// A `Promise` is created once per key and scope, is shared (by cloning the
/// handle) between the cache, the batch that will settle it, and every caller
/// waiting on it. It is settled at most once; all waiters observe a clone of
/// the same result.
pub struct Promise<V, E> {
    state: Arc<Mutex<State<V, E>>>,
}

impl<V, E> Clone for Promise<V, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<V, E> Debug for Promise<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let status = match *lock(&self.state) {
            State::Pending(ref wakers) => format!("pending ({} waiters)", wakers.len()),
            State::Settled(Ok(..)) => "resolved".to_owned(),
            State::Settled(Err(..)) => "rejected".to_owned(),
        };
        f.debug_struct("Promise").field("status", &status).finish()
    }
}

impl<V, E> Default for Promise<V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> Promise<V, E> {
    /// Create a new, unsettled promise.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending(WakerSet::default()))),
        }
    }

    /// Create a promise that is already resolved with `value`. Used to prime
    /// caches with values obtained elsewhere.
    pub fn resolved(value: V) -> Self {
        Self::settled(Ok(value))
    }

    pub fn rejected(error: LoadError<E>) -> Self {
        Self::settled(Err(error))
    }

    fn settled(result: Result<V, LoadError<E>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Settled(result))),
        }
    }

    /// Settle this promise and wake every waiter. Only the first settlement
    /// has any effect; returns false if the promise was already settled.
    pub fn settle(&self, result: Result<V, LoadError<E>>) -> bool {
        let mut guard = lock(&self.state);
        match *guard {
            State::Settled(..) => false,
            State::Pending(ref mut wakers) => {
                let wakers = mem::take(wakers);
                *guard = State::Settled(result);

                // Wake outside the lock; a woken task on another thread will
                // immediately try to lock the state to read its result.
                drop(guard);
                wakers.wake_all();
                true
            }
        }
    }

    pub fn resolve(&self, value: V) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: LoadError<E>) -> bool {
        self.settle(Err(error))
    }

    pub fn is_settled(&self) -> bool {
        matches!(*lock(&self.state), State::Settled(..))
    }

    /// True if both handles refer to the same promise instance.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.state, &other.state)
    }

    /// Get a future that completes with a clone of the settled result.
    pub fn wait(&self) -> PromiseFuture<V, E> {
        PromiseFuture {
            promise: self.clone(),
            waker_token: None,
        }
    }
}

impl<V: Clone, E: Clone> Promise<V, E> {
    /// Get a clone of the result if this promise has been settled.
    pub fn peek(&self) -> Option<Result<V, LoadError<E>>> {
        match *lock(&self.state) {
            State::Pending(..) => None,
            State::Settled(ref result) => Some(result.clone()),
        }
    }
}

impl<V: Clone, E: Clone> IntoFuture for Promise<V, E> {
    type Output = Result<V, LoadError<E>>;
    type IntoFuture = PromiseFuture<V, E>;

    fn into_future(self) -> Self::IntoFuture {
        PromiseFuture {
            promise: self,
            waker_token: None,
        }
    }
}

/// Future returned by [`Promise::wait`]. Completes once the promise is
/// settled.
pub struct PromiseFuture<V, E> {
    promise: Promise<V, E>,
    waker_token: Option<WakerToken>,
}

impl<V, E> Debug for PromiseFuture<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseFuture")
            .field("promise", &self.promise)
            .field("registered", &self.waker_token.is_some())
            .finish()
    }
}

impl<V, E> PromiseFuture<V, E> {
    /// The promise this future is waiting on.
    pub fn promise(&self) -> &Promise<V, E> {
        &self.promise
    }
}

impl<V: Clone, E: Clone> Future for PromiseFuture<V, E> {
    type Output = Result<V, LoadError<E>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);
        let mut guard = lock(&unpinned.promise.state);

        match *guard {
            State::Pending(ref mut wakers) => {
                match unpinned.waker_token.as_ref() {
                    Some(token) => wakers.replace_waker(token, ctx.waker()),
                    None => {
                        let token = wakers.add_waker(ctx.waker().clone());
                        unpinned.waker_token = Some(token);
                    }
                }
                Poll::Pending
            }
            State::Settled(ref result) => {
                // The waker set was drained when the promise settled, so the
                // token no longer refers to anything.
                unpinned.waker_token = None;
                Poll::Ready(result.clone())
            }
        }
    }
}

impl<V, E> Drop for PromiseFuture<V, E> {
    fn drop(&mut self) {
        if let Some(token) = self.waker_token.take() {
            if let State::Pending(ref mut wakers) = *lock(&self.promise.state) {
                wakers.discard_waker(token);
            }
        }
    }
}

//! Deciding when a batch stops accepting keys.
//!
//! A batch is never closed explicitly by its callers. Instead, the scheduler
//! probes every tracked batch once per *turn*: a batch that received keys
//! since the previous probe is given another turn, and a batch that was
//! left alone for a whole turn is dispatched. Every batch therefore gets at
//! least one full turn to collect keys from other call sites before it
//! commits to a backend round-trip.

use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    panic::AssertUnwindSafe,
    pin::pin,
    sync::{Arc, Mutex},
    task::Poll,
};

use futures::{
    future::{self, poll_fn, BoxFuture},
    stream::{FuturesUnordered, StreamExt},
    task::AtomicWaker,
    FutureExt,
};
use tokio_util::sync::CancellationToken;

use crate::{
    batch::{Batch, BatchStatus},
    lock,
};

/// Accepts batches from loaders. Loaders call `schedule` whenever they create
/// or extend a batch; scheduling a batch that is already tracked is a no-op.
pub trait BatchScheduler: Send + Sync {
    fn schedule(&self, batch: Arc<dyn Batch>);
}

/// A scheduler driven in discrete turns.
///
/// `TurnScheduler` doesn't spawn anything. Either call
/// [`run_turn`](Self::run_turn) yourself at whatever points you consider
/// turn boundaries, or run [`run`](Self::run) as a background task on the
/// executor of your choice.
pub struct TurnScheduler {
    tracked: Mutex<Vec<Arc<dyn Batch>>>,
    wakeup: AtomicWaker,
    cancel: Mutex<CancellationToken>,
}

impl Debug for TurnScheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnScheduler")
            .field("tracked", &self.tracked())
            .finish()
    }
}

impl Default for TurnScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchScheduler for TurnScheduler {
    fn schedule(&self, batch: Arc<dyn Batch>) {
        let mut tracked = lock(&self.tracked);
        let id = batch.id();

        if tracked.iter().any(|existing| existing.id() == id) {
            return;
        }

        tracing::trace!(batch = %id, "batch scheduled");
        tracked.push(batch);
        drop(tracked);

        self.wakeup.wake();
    }
}

impl TurnScheduler {
    pub fn new() -> Self {
        Self {
            tracked: Mutex::new(Vec::new()),
            wakeup: AtomicWaker::new(),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Number of batches waiting to be dispatched.
    pub fn tracked(&self) -> usize {
        lock(&self.tracked).len()
    }

    /// Touch every tracked batch once, and return the batches that were
    /// found stable. Those are no longer tracked; the caller is responsible
    /// for dispatching them. Batches that were dispatched by someone else in
    /// the meantime are dropped from tracking.
    pub fn touch_all(&self) -> Vec<Arc<dyn Batch>> {
        let mut tracked = lock(&self.tracked);
        let mut stable = Vec::new();

        tracked.retain(|batch| {
            if batch.status() == BatchStatus::Dispatched {
                return false;
            }

            if batch.touch() {
                stable.push(Arc::clone(batch));
                false
            } else {
                tracing::trace!(batch = %batch.id(), size = batch.size(), "batch changed since last turn");
                true
            }
        });

        stable
    }

    /// Run a single turn: touch every tracked batch, then dispatch the
    /// stable ones concurrently and wait for all of them to complete.
    pub async fn run_turn(&self) {
        let dispatches: Vec<_> = self
            .touch_all()
            .into_iter()
            .map(|batch| self.dispatch(batch))
            .collect();

        future::join_all(dispatches).await;
    }

    /// Drive every scheduled batch until `shutdown` is cancelled.
    ///
    /// A turn boundary is reached when at least one batch is tracked and the
    /// future returned by `window` has completed. For a tight loop on an
    /// async runtime, `window` can simply yield to the executor (for
    /// instance `tokio::task::yield_now`); to give callers more time to
    /// pile up keys, use a short timer instead. Dispatches run concurrently
    /// with subsequent turns.
    ///
    /// On shutdown, every batch still tracked is dispatched immediately, and
    /// this future completes once all dispatches have finished.
    pub async fn run<Window, Delay>(&self, window: Window, shutdown: CancellationToken)
    where
        Window: Fn() -> Delay,
        Delay: Future<Output = ()>,
    {
        let mut in_flight: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();

        loop {
            let shutting_down = {
                let mut turn = pin!(self.next_turn(&window));
                let mut cancelled = pin!(shutdown.cancelled());

                poll_fn(|ctx| {
                    // Completed dispatches yield (), there's nothing to
                    // collect from them.
                    while let Poll::Ready(Some(())) = in_flight.poll_next_unpin(ctx) {}

                    if cancelled.as_mut().poll(ctx).is_ready() {
                        return Poll::Ready(true);
                    }

                    turn.as_mut().poll(ctx).map(|()| false)
                })
                .await
            };

            if shutting_down {
                break;
            }

            for batch in self.touch_all() {
                in_flight.push(self.dispatch(batch));
            }
        }

        let remaining = mem::take(&mut *lock(&self.tracked));
        tracing::debug!(
            remaining = remaining.len(),
            in_flight = in_flight.len(),
            "scheduler shutting down"
        );

        for batch in remaining {
            in_flight.push(self.dispatch(batch));
        }

        while in_flight.next().await.is_some() {}
    }

    /// Cancel every dispatch currently in flight. Batches dispatched after
    /// this call are unaffected.
    pub fn cancel_in_flight(&self) {
        let previous = mem::take(&mut *lock(&self.cancel));
        tracing::debug!("cancelling in-flight dispatches");
        previous.cancel();
    }

    /// Wait until there is at least one tracked batch, then for the window
    /// to elapse.
    async fn next_turn<Window, Delay>(&self, window: &Window)
    where
        Window: Fn() -> Delay,
        Delay: Future<Output = ()>,
    {
        poll_fn(|ctx| {
            self.wakeup.register(ctx.waker());
            if lock(&self.tracked).is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        })
        .await;

        window().await;
    }

    /// Wrap a batch dispatch so that it can never take the scheduler down:
    /// programmer errors are logged, and a panic in a dispatch is contained
    /// to that batch.
    fn dispatch(&self, batch: Arc<dyn Batch>) -> BoxFuture<'static, ()> {
        let id = batch.id();
        let cancel = lock(&self.cancel).child_token();
        let dispatch = batch.dispatch(cancel);

        async move {
            match AssertUnwindSafe(dispatch).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::error!(batch = %id, error = %error, "batch dispatch rejected");
                }
                Err(..) => {
                    tracing::error!(batch = %id, "batch dispatch panicked");
                }
            }
        }
        .boxed()
    }
}

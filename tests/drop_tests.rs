//! These tests ensure that dropped loaders, batches and futures correctly
//! update the shared state, and that nobody is left waiting forever.
use batchscope::{
    Batch, DataLoader, DataScope, KeyBatch, KeySet, LoadError, LoaderOptions, PromiseCache,
    TurnScheduler, ValueSet,
};
use cooked_waker::{IntoWaker, Wake, WakeRef};
use futures::{executor, future, FutureExt};
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use tokio_util::sync::CancellationToken;

/// A Waker that does nothing. Used for when we're manually calling poll.
#[derive(Debug, Default, Copy, Clone, IntoWaker)]
struct NoOpWaker;

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {
    fn wake(self) {}
}

fn new_scope() -> (Arc<TurnScheduler>, DataScope) {
    let scheduler = Arc::new(TurnScheduler::new());
    let scope = DataScope::new(scheduler.clone(), PromiseCache::default());
    (scheduler, scope)
}

/// Testing loader: put a copy of each key in an Arc in the result. This lets
/// us count how many handles to a value are alive.
fn arc_loader(scope: &DataScope) -> DataLoader<i32, Arc<i32>, ()> {
    DataLoader::new(
        scope,
        "arc",
        LoaderOptions::default(),
        |keys: KeySet<i32>, _cancel: CancellationToken| {
            future::ready(Ok::<_, ()>(keys.into_values(|key| Arc::new(*key))))
        },
    )
}

/// This test establishes a baseline behavior for our clone counters
#[test]
fn test_simple_drop_after_resolution() {
    let (scheduler, scope) = new_scope();
    let loader = arc_loader(&scope);

    let fut1 = loader.load(1);
    let fut2 = loader.load(1);
    let fut3 = loader.load(1);
    let fut4 = loader.load(1);

    executor::block_on(scheduler.run_turn());
    executor::block_on(scheduler.run_turn());

    let res1 = executor::block_on(fut1).unwrap();

    // At this point, the settled promise and our local fut1 result should
    // both have an Arc
    assert_eq!(Arc::strong_count(&res1), 2);

    // Resolving fut2 simply clones the underlying Arc
    let res2 = executor::block_on(fut2).unwrap();
    assert_eq!(Arc::strong_count(&res2), 3);

    // Dropping these futures shouldn't change anything; the cache still
    // holds the promise
    drop(fut3);
    drop(fut4);
    assert_eq!(Arc::strong_count(&res1), 3);

    // However, once the cache forgets the promise, its result is dropped
    loader.clear();
    assert_eq!(Arc::strong_count(&res1), 2);
}

#[test]
fn test_drop_before_dispatch() {
    let (scheduler, scope) = new_scope();
    let loader: DataLoader<i32, i32, ()> = DataLoader::new(
        &scope,
        "exact",
        LoaderOptions::default(),
        |keys: KeySet<i32>, _cancel: CancellationToken| {
            // Both keys are in the batch even though one caller went away.
            assert_eq!(keys.keys().copied().collect::<Vec<_>>(), [1, 2]);
            future::ready(Ok::<_, ()>(keys.into_values(|key| *key)))
        },
    );

    let waker = NoOpWaker;
    let waker = waker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = loader.load(1);
    let fut2 = loader.load(2);

    assert_eq!(fut1.poll_unpin(&mut ctx), Poll::Pending);
    drop(fut2);

    executor::block_on(scheduler.run_turn());
    executor::block_on(scheduler.run_turn());

    assert_eq!(executor::block_on(fut1), Ok(1));
    // The value of the dropped caller is still cached.
    assert_eq!(executor::block_on(loader.load(2)), Ok(2));
}

#[test]
fn test_drop_scope_abandons_pending_keys() {
    let pending = {
        let (_scheduler, scope) = new_scope();
        let loader = arc_loader(&scope);
        loader.load(1)
    };

    // The batch was owned by the loader and the scheduler, and died with them.
    assert_eq!(executor::block_on(pending), Err(LoadError::Abandoned));
}

#[test]
fn test_drop_while_fetch_is_running() {
    let batch: Arc<KeyBatch<i32, i32, ()>> = Arc::new(KeyBatch::new(
        Arc::new(|_keys: KeySet<i32>, _cancel: CancellationToken| {
            future::pending::<Result<ValueSet<i32>, ()>>()
        }),
        None,
    ));
    let promise = batch.add_item(1).unwrap();

    let waker = NoOpWaker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut dispatch = batch.clone().dispatch(CancellationToken::new());
    assert_eq!(dispatch.poll_unpin(&mut ctx), Poll::Pending);
    assert!(!promise.is_settled());

    drop(dispatch);
    assert_eq!(promise.peek(), Some(Err(LoadError::Abandoned)));
}

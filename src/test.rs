#![cfg(test)]

use std::{
    collections::HashMap,
    future::IntoFuture,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use cooked_waker::{IntoWaker, Wake, WakeRef};
use futures::{executor, future, FutureExt};
use tokio_util::sync::CancellationToken;

use crate::{
    batch::{Batch, BatchStatus, KeyBatch},
    cache::{CacheOptions, PromiseCache, PromiseCacheKey},
    data::{IntoValuesError, KeySet, KeyedEntry, OnDuplicate, ValueSet},
    error::{AddItemError, BatchError, CacheError, LoadError},
    promise::Promise,
    scheduler::TurnScheduler,
    scope::DataScope,
    wakerset::WakerSet,
};

fn key_set<K: Eq + std::hash::Hash + Clone>(keys: impl IntoIterator<Item = K>) -> KeySet<K> {
    let mut set = KeySet::new();
    for key in keys {
        let _ = set.add_key(key);
    }
    set
}

/// A waker that counts how many times it was woken.
#[derive(Debug, Clone, Default, IntoWaker)]
struct CountingWaker {
    count: Arc<AtomicUsize>,
}

impl WakeRef for CountingWaker {
    fn wake_by_ref(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

impl Wake for CountingWaker {}

#[test]
fn key_set_deduplicates_in_first_seen_order() {
    let mut set = KeySet::new();

    let (a, added_a) = set.add_key("a");
    let (b, added_b) = set.add_key("b");
    let (a2, added_a2) = set.add_key("a");

    assert!(added_a && added_b);
    assert!(!added_a2);
    assert_eq!(a, a2);
    assert_ne!(a, b);
    assert_eq!(set.len(), 2);
    assert_eq!(set.keys().copied().collect::<Vec<_>>(), ["a", "b"]);
    assert!(set.contains("b"));
    assert!(!set.contains("c"));
}

#[test]
fn value_set_hands_out_each_value_once() {
    let mut set = KeySet::new();
    let (ten, _) = set.add_key(10);
    let (twenty, _) = set.add_key(20);

    let mut values = set.into_values(|key| key.to_string());
    assert_eq!(values.len(), 2);

    assert_eq!(values.take(twenty).as_deref(), Some("20"));
    assert_eq!(values.take(twenty), None);
    assert_eq!(values.take(ten).as_deref(), Some("10"));
    assert!(values.is_empty());
}

#[derive(Debug, Clone, PartialEq)]
struct User {
    name: String,
    age: u16,
}

impl KeyedEntry<str> for User {
    fn get_key(&self) -> &str {
        &self.name
    }
}

fn user(name: &str, age: u16) -> User {
    User {
        name: name.to_owned(),
        age,
    }
}

#[test]
fn values_from_iter_matches_entries_to_keys() {
    let mut set = KeySet::new();
    let (bob, _) = set.add_key(String::from("bob"));
    let (alice, _) = set.add_key(String::from("alice"));

    let mut values = set
        .values_from_iter(OnDuplicate::Error, vec![user("alice", 30), user("bob", 40)])
        .unwrap();

    assert_eq!(values.take(bob).unwrap().age, 40);
    assert_eq!(values.take(alice).unwrap().age, 30);
}

#[test]
fn values_from_iter_rejects_unknown_and_missing_keys() {
    let set = key_set([String::from("bob")]);
    let error = set
        .values_from_iter(OnDuplicate::Error, vec![user("bob", 1), user("eve", 2)])
        .unwrap_err();
    assert_eq!(error, IntoValuesError::UnrecognizedKey);

    let set = key_set([String::from("bob"), String::from("alice")]);
    let error = set
        .values_from_iter(OnDuplicate::Error, vec![user("bob", 1)])
        .unwrap_err();
    assert_eq!(error, IntoValuesError::MissingKeys(vec![String::from("alice")]));
}

#[test]
fn duplicate_values_follow_policy() {
    let pairs = || vec![(1, "first"), (1, "second")];

    let error = key_set([1]).values_from_pairs(OnDuplicate::Error, pairs());
    assert_eq!(error.unwrap_err(), IntoValuesError::DuplicateKey);

    let mut set = KeySet::new();
    let (one, _) = set.add_key(1);
    let mut values = set.values_from_pairs(OnDuplicate::Ignore, pairs()).unwrap();
    assert_eq!(values.take(one), Some("first"));

    let mut set = KeySet::new();
    let (one, _) = set.add_key(1);
    let mut values = set.values_from_pairs(OnDuplicate::Replace, pairs()).unwrap();
    assert_eq!(values.take(one), Some("second"));
}

#[test]
fn fill_values_resolves_missing_keys_to_fallback() {
    let mut set = KeySet::new();
    let (one, _) = set.add_key(1);
    let (two, _) = set.add_key(2);

    let found: HashMap<i32, Option<&str>> = [(2, Some("two"))].into_iter().collect();
    let mut values = set
        .fill_values(OnDuplicate::Error, found, |_key| None)
        .unwrap();

    assert_eq!(values.take(one), Some(None));
    assert_eq!(values.take(two), Some(Some("two")));
}

#[test]
fn try_into_values_stops_at_first_error() {
    let result: Result<ValueSet<i32>, String> =
        key_set([1, 2, 3]).try_into_values(|key| match key {
            2 => Err(format!("bad key {}", key)),
            key => Ok(key * 10),
        });

    assert_eq!(result.unwrap_err(), "bad key 2");
}

#[test]
fn waker_set_wakes_registered_wakers_once() {
    let first = CountingWaker::default();
    let second = CountingWaker::default();

    let mut wakers = WakerSet::default();
    let token1 = wakers.add_waker(first.clone().into_waker());
    let token2 = wakers.add_waker(second.clone().into_waker());
    assert_eq!(wakers.len(), 2);

    wakers.replace_waker(&token1, &first.clone().into_waker());
    wakers.discard_waker(token2);
    assert_eq!(wakers.len(), 1);

    wakers.wake_all();
    assert_eq!(first.count.load(Ordering::SeqCst), 1);
    assert_eq!(second.count.load(Ordering::SeqCst), 0);
}

#[test]
fn promise_first_settlement_wins() {
    let promise: Promise<i32, ()> = Promise::new();
    assert!(!promise.is_settled());
    assert_eq!(promise.peek(), None);

    assert!(promise.resolve(1));
    assert!(!promise.reject(LoadError::Cancelled));
    assert!(!promise.resolve(2));

    assert_eq!(promise.peek(), Some(Ok(1)));
    assert_eq!(executor::block_on(promise.wait()), Ok(1));
}

#[test]
fn promise_wakes_waiters_on_settlement() {
    let promise: Promise<&str, ()> = Promise::new();
    let waker = CountingWaker::default();
    let std_waker = waker.clone().into_waker();
    let mut ctx = Context::from_waker(&std_waker);

    let mut first = promise.wait();
    let mut second = promise.clone().into_future();
    let mut dropped = promise.wait();

    assert_eq!(first.poll_unpin(&mut ctx), Poll::Pending);
    assert_eq!(second.poll_unpin(&mut ctx), Poll::Pending);
    assert_eq!(dropped.poll_unpin(&mut ctx), Poll::Pending);

    // A dropped future takes its waker out of the set.
    drop(dropped);

    promise.resolve("done");
    assert_eq!(waker.count.load(Ordering::SeqCst), 2);

    assert_eq!(first.poll_unpin(&mut ctx), Poll::Ready(Ok("done")));
    assert_eq!(second.poll_unpin(&mut ctx), Poll::Ready(Ok("done")));
}

async fn stringify(keys: KeySet<usize>, _cancel: CancellationToken) -> Result<ValueSet<String>, ()> {
    Ok(keys.into_values(|value| value.to_string()))
}

fn string_batch(max_size: Option<usize>) -> Arc<KeyBatch<usize, String, ()>> {
    Arc::new(KeyBatch::new(
        Arc::new(stringify),
        max_size.and_then(NonZeroUsize::new),
    ))
}

#[test]
fn touch_protocol() {
    let batch = string_batch(None);
    let _promise = batch.add_item(1).unwrap();
    assert_eq!(batch.status(), BatchStatus::Enqueued);

    // Enqueued -> Touched, not yet stable
    assert!(!batch.touch());
    assert_eq!(batch.status(), BatchStatus::Touched);

    // Touched and untouched since: stable
    assert!(batch.touch());

    // Any add, even of a known key, grants another turn
    let _again = batch.add_item(1).unwrap();
    assert_eq!(batch.status(), BatchStatus::Enqueued);
    assert!(!batch.touch());
    assert!(batch.touch());
}

#[test]
fn duplicate_keys_share_one_promise() {
    let batch = string_batch(None);

    let a = batch.add_item(1).unwrap();
    let b = batch.add_item(2).unwrap();
    let a2 = batch.add_item(1).unwrap();
    let c = batch.add_item(3).unwrap();

    assert!(Promise::ptr_eq(&a, &a2));
    assert!(!Promise::ptr_eq(&a, &b));
    assert_eq!(batch.size(), 3);

    executor::block_on(Arc::clone(&batch).dispatch(CancellationToken::new())).unwrap();

    assert_eq!(a.peek(), Some(Ok(String::from("1"))));
    assert_eq!(b.peek(), Some(Ok(String::from("2"))));
    assert_eq!(c.peek(), Some(Ok(String::from("3"))));
}

#[test]
fn each_key_keeps_its_own_promise() {
    let batch = string_batch(None);

    let first: Vec<_> = (0..64).map(|key| batch.add_item(key).unwrap()).collect();

    // Re-adding in a different order hands back the promise of each key.
    for key in (0..64).rev() {
        let again = batch.add_item(key).unwrap();
        assert!(Promise::ptr_eq(&again, &first[key]));
    }
    assert_eq!(batch.size(), 64);

    executor::block_on(Arc::clone(&batch).dispatch(CancellationToken::new())).unwrap();

    for (key, promise) in first.iter().enumerate() {
        assert_eq!(promise.peek(), Some(Ok(key.to_string())));
    }
}

#[test]
fn dispatched_batch_is_frozen() {
    let batch = string_batch(None);
    let _promise = batch.add_item(1).unwrap();

    let dispatch = Arc::clone(&batch).dispatch(CancellationToken::new());

    // Frozen before the dispatch future is ever polled.
    assert_eq!(batch.status(), BatchStatus::Dispatched);
    assert!(!batch.touch());
    assert_eq!(batch.add_item(2).unwrap_err(), AddItemError::Dispatched(2));

    let second = Arc::clone(&batch).dispatch(CancellationToken::new());
    assert_eq!(
        executor::block_on(second),
        Err(BatchError::AlreadyDispatched)
    );

    executor::block_on(dispatch).unwrap();
    assert_eq!(batch.size(), 1);
}

#[test]
fn full_batch_refuses_new_keys_only() {
    let batch = string_batch(Some(2));

    let _one = batch.add_item(1).unwrap();
    let _two = batch.add_item(2).unwrap();

    assert_eq!(batch.add_item(3).unwrap_err().into_key(), 3);
    assert!(batch.add_item(2).is_ok());
}

#[test]
fn dropped_batch_abandons_promises() {
    let batch = string_batch(None);
    let promise = batch.add_item(1).unwrap();

    drop(batch);
    assert_eq!(promise.peek(), Some(Err(LoadError::Abandoned)));
}

#[test]
fn empty_batch_dispatch_skips_fetch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let batch: Arc<KeyBatch<usize, usize, ()>> = Arc::new(KeyBatch::new(
        Arc::new(move |keys: KeySet<usize>, _cancel: CancellationToken| {
            counter.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok::<_, ()>(keys.into_values(|key| *key)))
        }),
        None,
    ));

    executor::block_on(batch.dispatch(CancellationToken::new())).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

fn cache_with_capacity(capacity: usize) -> PromiseCache {
    PromiseCache::new(CacheOptions { capacity })
}

#[test]
fn cache_evicts_least_recently_added() {
    let cache = cache_with_capacity(2);
    let key = |id: u32| PromiseCacheKey::new("user", id);

    assert!(cache.try_add(key(1), Promise::<u32, ()>::resolved(1)));
    assert!(cache.try_add(key(2), Promise::<u32, ()>::resolved(2)));

    // Reading an entry doesn't refresh it.
    assert!(cache.get::<u32, ()>(&key(1)).is_some());

    assert!(cache.try_add(key(3), Promise::<u32, ()>::resolved(3)));
    assert_eq!(cache.size(), 2);
    assert!(cache.get::<u32, ()>(&key(1)).is_none());
    assert!(cache.get::<u32, ()>(&key(2)).is_some());
    assert!(cache.get::<u32, ()>(&key(3)).is_some());
}

#[test]
fn cache_keys_differ_by_kind() {
    let cache = PromiseCache::default();

    assert!(cache.try_add(PromiseCacheKey::new("user", 1u32), Promise::<&str, ()>::resolved("user")));
    assert!(cache.try_add(PromiseCacheKey::new("team", 1u32), Promise::<&str, ()>::resolved("team")));
    // Same kind, same value, different key type: different entries.
    assert!(cache.try_add(PromiseCacheKey::new("user", 1u64), Promise::<&str, ()>::resolved("wide")));

    assert_eq!(cache.usage(), 3);
    assert_eq!(cache.clear_kind("user"), 2);
    assert_eq!(cache.usage(), 1);
}

#[test]
fn cache_reports_type_mismatch() {
    let cache = PromiseCache::default();
    let key = PromiseCacheKey::new("user", 7u32);

    assert!(cache.try_add(key.clone(), Promise::<u32, ()>::resolved(7)));

    let error = cache
        .get_or_add_task::<String, ()>(key, |_| Promise::new())
        .unwrap_err();
    assert_eq!(
        error,
        CacheError::TypeMismatch {
            kind: String::from("user")
        }
    );
}

#[test]
fn cache_key_downcasts_to_original() {
    let key = PromiseCacheKey::new("user", String::from("alice"));

    assert_eq!(key.kind(), "user");
    assert_eq!(key.downcast_key::<String>().map(String::as_str), Some("alice"));
    assert_eq!(key.downcast_key::<u32>(), None);
    assert_eq!(key, PromiseCacheKey::new("user", String::from("alice")));
}

#[test]
fn dead_branches_are_purged_on_insert() {
    let scope = DataScope::new(Arc::new(TurnScheduler::new()), PromiseCache::default());

    let kept = scope.branch("kept", |_scope| 0usize);
    for id in 1..=10usize {
        let once = scope.branch(&format!("once-{}", id), |_scope| id);
        assert_eq!(*once, id);
    }

    // Every insertion dropped the branches nobody held anymore; only the
    // last one-off branch is still registered next to the kept one.
    assert_eq!(scope.registered_branches(), 2);
    assert!(Arc::ptr_eq(&kept, &scope.branch("kept", |_scope| 99usize)));
}

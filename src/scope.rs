use std::{
    any::Any,
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    sync::{Arc, Mutex, Weak},
};

use crate::{cache::PromiseCache, lock, scheduler::BatchScheduler};

struct Inner {
    scheduler: Arc<dyn BatchScheduler>,
    cache: PromiseCache,
    branches: Mutex<HashMap<String, Weak<dyn Any + Send + Sync>>>,
}

/// The wiring shared by every loader of one unit of work (typically one
/// incoming request): the scheduler their batches are handed to, and the
/// cache their promises live in.
///
/// A scope is passed explicitly to every loader it should serve. Cloning it
/// is cheap, and clones share the same scheduler, cache and branches.
#[derive(Clone)]
pub struct DataScope {
    inner: Arc<Inner>,
}

impl Debug for DataScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataScope")
            .field("cache", &self.inner.cache)
            .field("branches", &lock(&self.inner.branches).len())
            .finish()
    }
}

impl DataScope {
    pub fn new(scheduler: Arc<dyn BatchScheduler>, cache: PromiseCache) -> Self {
        Self {
            inner: Arc::new(Inner {
                scheduler,
                cache,
                branches: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn scheduler(&self) -> &Arc<dyn BatchScheduler> {
        &self.inner.scheduler
    }

    pub fn cache(&self) -> &PromiseCache {
        &self.inner.cache
    }

    /// Get the branch registered under `key`, or create it with `create`.
    ///
    /// Branches are held weakly: once every handle to a branch is dropped,
    /// the next call creates it again. A branch registered under the same
    /// key with a different type is replaced.
    pub fn branch<L>(&self, key: &str, create: impl FnOnce(&DataScope) -> L) -> Arc<L>
    where
        L: Send + Sync + 'static,
    {
        if let Some(existing) = self.existing_branch(key) {
            return existing;
        }

        // Created without holding the lock, so that `create` may itself open
        // branches on this scope.
        let created = Arc::new(create(self));

        let mut branches = lock(&self.inner.branches);
        let raced = branches
            .get(key)
            .and_then(Weak::upgrade)
            .and_then(|branch| branch.downcast::<L>().ok());

        match raced {
            Some(existing) => existing,
            None => {
                branches.retain(|_key, branch| branch.strong_count() > 0);

                let erased: Arc<dyn Any + Send + Sync> = created.clone();
                branches.insert(key.to_owned(), Arc::downgrade(&erased));
                tracing::trace!(branch = key, "created scope branch");
                created
            }
        }
    }

    /// Number of entries in the branch registry, live or not.
    #[cfg(test)]
    pub(crate) fn registered_branches(&self) -> usize {
        lock(&self.inner.branches).len()
    }

    fn existing_branch<L>(&self, key: &str) -> Option<Arc<L>>
    where
        L: Send + Sync + 'static,
    {
        lock(&self.inner.branches)
            .get(key)
            .and_then(Weak::upgrade)
            .and_then(|branch| branch.downcast::<L>().ok())
    }
}

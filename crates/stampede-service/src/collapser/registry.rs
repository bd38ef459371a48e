use std::sync::Arc;

use moka::sync::Cache;

/// Maps each key to the execution currently in flight for it.
///
/// There is at most one entry per key. Entries are only ever replaced by evicting them first, and
/// executions are told apart by identity, never by content. All mutations are expected to happen
/// while holding the key's lock.
///
/// The underlying cache is unbounded and has no expiry, so entries never disappear on their own.
pub(super) struct Registry<P> {
    executions: Cache<String, Arc<P>>,
    #[cfg(test)]
    removals: std::sync::atomic::AtomicUsize,
}

impl<P> Registry<P>
where
    P: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            executions: Cache::builder().name("collapser-registry").build(),
            #[cfg(test)]
            removals: Default::default(),
        }
    }

    /// Returns the execution for `key`, creating it with `create` if there is none.
    ///
    /// The returned flag is `true` if the execution was just created.
    pub fn get_or_create(&self, key: &str, create: impl FnOnce() -> P) -> (Arc<P>, bool) {
        let entry = self
            .executions
            .entry_by_ref(key)
            .or_insert_with(|| Arc::new(create()));
        let created = entry.is_fresh();
        (entry.into_value(), created)
    }

    /// Whether `execution` is the current execution for `key`.
    pub fn is_current(&self, key: &str, execution: &Arc<P>) -> bool {
        self.executions
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(&current, execution))
    }

    /// Removes the entry for `key` if it is still `execution`.
    ///
    /// Returns `true` if the entry was removed.
    pub fn remove_if_current(&self, key: &str, execution: &Arc<P>) -> bool {
        if !self.is_current(key, execution) {
            return false;
        }
        self.executions.invalidate(key);
        #[cfg(test)]
        self.removals
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        true
    }

    #[cfg(test)]
    pub fn contains(&self, key: &str) -> bool {
        self.executions.contains_key(key)
    }

    /// How many entries [`remove_if_current`](Self::remove_if_current) removed so far.
    #[cfg(test)]
    pub fn removals(&self) -> usize {
        self.removals.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl<P> std::fmt::Debug for Registry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

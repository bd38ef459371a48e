use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use rustc_hash::FxHasher;
use tokio_util::sync::CancellationToken;

use super::{AsyncLockGuard, AsyncLockProvider, LockError, LockGuard, LockProvider};
use crate::config::ConfigError;
use crate::key::Context;

/// The default number of stripes, about 1KiB worth of flags.
pub const DEFAULT_STRIPES: usize = 1024;

/// Spreads keys over a fixed number of spin locks.
///
/// A key always maps to the same stripe. Unrelated keys that happen to share a stripe serialize
/// their registry updates, which costs a little latency but never correctness.
///
/// Acquiring spins on an atomic compare-and-set and yields between attempts instead of parking.
/// The locks are only held for a handful of instructions, so this beats a blocking mutex and,
/// unlike one, can be released from any thread or task.
///
/// Clones share the same stripes.
#[derive(Debug, Clone)]
pub struct StripedLockProvider {
    stripes: Arc<[AtomicBool]>,
}

impl StripedLockProvider {
    /// Creates a provider with `stripes` independent locks.
    pub fn new(stripes: usize) -> Result<Self, ConfigError> {
        if stripes == 0 {
            return Err(ConfigError::InvalidStripes);
        }
        Ok(Self {
            stripes: (0..stripes).map(|_| AtomicBool::new(false)).collect(),
        })
    }

    /// The number of stripes.
    pub fn stripes(&self) -> usize {
        self.stripes.len()
    }

    fn stripe_of(&self, key: &str) -> usize {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    fn try_lock(&self, stripe: usize) -> bool {
        self.stripes[stripe]
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn guard(&self, stripe: usize) -> impl FnOnce() + Send + '_ {
        move || self.stripes[stripe].store(false, Ordering::Release)
    }

    /// Whether the stripe `key` maps to is currently held.
    pub fn is_locked(&self, key: &str) -> bool {
        self.stripes[self.stripe_of(key)].load(Ordering::Acquire)
    }
}

impl Default for StripedLockProvider {
    fn default() -> Self {
        Self {
            stripes: (0..DEFAULT_STRIPES)
                .map(|_| AtomicBool::new(false))
                .collect(),
        }
    }
}

impl LockProvider for StripedLockProvider {
    fn acquire_lock(
        &self,
        key: &str,
        _context: &Context,
        cancel: &CancellationToken,
    ) -> Result<LockGuard<'_>, LockError> {
        let start = Instant::now();
        let stripe = self.stripe_of(key);

        loop {
            if cancel.is_cancelled() {
                super::record_acquire("striped", start, false);
                return Err(LockError::cancelled(key));
            }
            if self.try_lock(stripe) {
                break;
            }
            std::thread::yield_now();
        }

        super::record_acquire("striped", start, true);
        Ok(LockGuard::new(self.guard(stripe)))
    }
}

#[async_trait]
impl AsyncLockProvider for StripedLockProvider {
    async fn acquire_lock<'a>(
        &'a self,
        key: &'a str,
        _context: &'a Context,
        cancel: &'a CancellationToken,
    ) -> Result<AsyncLockGuard<'a>, LockError> {
        let start = Instant::now();
        let stripe = self.stripe_of(key);

        loop {
            if cancel.is_cancelled() {
                super::record_acquire("striped", start, false);
                return Err(LockError::cancelled(key));
            }
            if self.try_lock(stripe) {
                break;
            }
            tokio::task::yield_now().await;
        }

        super::record_acquire("striped", start, true);
        Ok(AsyncLockGuard::from_sync(self.guard(stripe)))
    }
}

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{AsyncLockGuard, AsyncLockProvider, LockError, LockGuard, LockProvider};
use crate::key::Context;

/// How often a blocked waiter wakes up to check its cancellation token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A single lock shared by every key, blocking the calling thread.
///
/// This is the simplest provider and serializes all registry mutations of one collapser. Unlike a
/// [`std::sync::Mutex`], the lock is not tied to the thread that acquired it.
#[derive(Debug, Default)]
pub struct InstanceLockProvider {
    held: Mutex<bool>,
    released: Condvar,
}

impl InstanceLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        // the flag is always consistent, so a poisoned mutex can be recovered
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) {
        *self.state() = false;
        self.released.notify_one();
    }
}

impl LockProvider for InstanceLockProvider {
    fn acquire_lock(
        &self,
        key: &str,
        _context: &Context,
        cancel: &CancellationToken,
    ) -> Result<LockGuard<'_>, LockError> {
        let start = Instant::now();
        let mut held = self.state();

        while *held {
            if cancel.is_cancelled() {
                drop(held);
                super::record_acquire("instance", start, false);
                return Err(LockError::cancelled(key));
            }
            held = self
                .released
                .wait_timeout(held, CANCEL_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        if cancel.is_cancelled() {
            drop(held);
            super::record_acquire("instance", start, false);
            return Err(LockError::cancelled(key));
        }

        *held = true;
        drop(held);

        super::record_acquire("instance", start, true);
        Ok(LockGuard::new(move || self.release()))
    }
}

/// A single lock shared by every key, suspending the calling task.
#[derive(Debug, Default)]
pub struct AsyncInstanceLockProvider {
    lock: tokio::sync::Mutex<()>,
}

impl AsyncInstanceLockProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AsyncLockProvider for AsyncInstanceLockProvider {
    async fn acquire_lock<'a>(
        &'a self,
        key: &'a str,
        _context: &'a Context,
        cancel: &'a CancellationToken,
    ) -> Result<AsyncLockGuard<'a>, LockError> {
        let start = Instant::now();
        if cancel.is_cancelled() {
            super::record_acquire("instance", start, false);
            return Err(LockError::cancelled(key));
        }

        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = self.lock.lock() => Some(guard),
        };

        super::record_acquire("instance", start, guard.is_some());
        match guard {
            Some(guard) => Ok(AsyncLockGuard::from_sync(move || drop(guard))),
            None => Err(LockError::cancelled(key)),
        }
    }
}

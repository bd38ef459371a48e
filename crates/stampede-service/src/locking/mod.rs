//! Key-scoped locks guarding the registry of in-flight executions.
//!
//! A lock is only ever held for the few instructions it takes to get-or-create or to evict a
//! registry entry. It is never held while the collapsed work itself runs.
//!
//! There are three families of providers:
//!
//! - [`InstanceLockProvider`] / [`AsyncInstanceLockProvider`]: a single lock shared by all keys.
//! - [`StripedLockProvider`]: a fixed array of spin locks, selected by hashing the key.
//! - [`DistributedLockProvider`]: a lock record in a [`LockStore`] shared between processes.
//!
//! Every sync [`LockProvider`] can also be used where an [`AsyncLockProvider`] is expected by
//! wrapping it in a [`BlockingLockAdapter`].

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::key::Context;

mod distributed;
mod instance;
pub mod store;
mod striped;

pub use distributed::DistributedLockProvider;
pub use instance::{AsyncInstanceLockProvider, InstanceLockProvider};
pub use store::{FilesystemLockStore, LockStore, MemoryLockStore};
pub use striped::{DEFAULT_STRIPES, StripedLockProvider};

/// An error acquiring a key-scoped lock.
///
/// Both variants only affect the caller that tried to acquire the lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The caller's cancellation token was signaled before the lock was acquired.
    #[error("cancelled while waiting for the lock on {key:?}")]
    Cancelled { key: String },
    /// A distributed lock could not be acquired within its configured timeout.
    #[error("failed to acquire distributed lock for {key:?} within {timeout:?}")]
    Timeout { key: String, timeout: Duration },
}

impl LockError {
    pub(crate) fn cancelled(key: &str) -> Self {
        Self::Cancelled {
            key: key.to_owned(),
        }
    }
}

/// A held lock, released on [`release`](Self::release) or when dropped.
///
/// Releasing is idempotent, and the guard may be released from any thread.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    release: Option<Box<dyn FnOnce() + Send + 'a>>,
}

impl<'a> LockGuard<'a> {
    /// Creates a guard that runs `release` exactly once.
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'a,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Releases the lock. Calling this more than once does nothing.
    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

type AsyncRelease<'a> = Box<dyn FnOnce() -> BoxFuture<'a, ()> + Send + 'a>;

/// A held lock of an [`AsyncLockProvider`].
///
/// Prefer [`release`](Self::release), which waits for the release to finish. A guard that is
/// dropped instead starts the release and only waits for it if it completes right away.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct AsyncLockGuard<'a> {
    release: Option<AsyncRelease<'a>>,
}

impl<'a> AsyncLockGuard<'a> {
    /// Creates a guard whose release may suspend.
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'a, ()> + Send + 'a,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Creates a guard around a release that completes synchronously.
    pub fn from_sync<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'a,
    {
        Self::new(move || {
            release();
            futures::future::ready(()).boxed()
        })
    }

    /// Releases the lock. Calling this more than once does nothing.
    pub async fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release().await;
        }
    }
}

impl Drop for AsyncLockGuard<'_> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            if release().now_or_never().is_none() {
                tracing::debug!("Lock release did not complete while dropping its guard");
            }
        }
    }
}

impl fmt::Debug for AsyncLockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLockGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Provides locks scoped to a key, blocking the calling thread while waiting.
pub trait LockProvider: Send + Sync {
    /// Waits to acquire the lock for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Cancelled`] if `cancel` is signaled before the lock is acquired.
    fn acquire_lock(
        &self,
        key: &str,
        context: &Context,
        cancel: &CancellationToken,
    ) -> Result<LockGuard<'_>, LockError>;
}

/// Provides locks scoped to a key, suspending the calling task while waiting.
#[async_trait]
pub trait AsyncLockProvider: Send + Sync {
    /// Waits to acquire the lock for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Cancelled`] if `cancel` is signaled before the lock is acquired.
    async fn acquire_lock<'a>(
        &'a self,
        key: &'a str,
        context: &'a Context,
        cancel: &'a CancellationToken,
    ) -> Result<AsyncLockGuard<'a>, LockError>;
}

impl fmt::Debug for dyn LockProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<LockProvider>")
    }
}

impl fmt::Debug for dyn AsyncLockProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<AsyncLockProvider>")
    }
}

/// Exposes a sync [`LockProvider`] through the [`AsyncLockProvider`] interface.
///
/// Acquiring blocks the executor thread while waiting, so this is only a good fit for providers
/// that are held very briefly, like the [`StripedLockProvider`].
#[derive(Debug, Clone, Default)]
pub struct BlockingLockAdapter<P> {
    inner: P,
}

impl<P> BlockingLockAdapter<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn into_inner(self) -> P {
        self.inner
    }
}

#[async_trait]
impl<P: LockProvider> AsyncLockProvider for BlockingLockAdapter<P> {
    async fn acquire_lock<'a>(
        &'a self,
        key: &'a str,
        context: &'a Context,
        cancel: &'a CancellationToken,
    ) -> Result<AsyncLockGuard<'a>, LockError> {
        let mut guard = self.inner.acquire_lock(key, context, cancel)?;
        Ok(AsyncLockGuard::from_sync(move || guard.release()))
    }
}

/// Records how long it took to acquire a lock.
pub(crate) fn record_acquire(provider: &'static str, start: Instant, acquired: bool) {
    let status = if acquired { "acquired" } else { "failed" };
    metric!(
        timer("locks.acquire") = start.elapsed(),
        "provider" => provider,
        "status" => status,
    );
}

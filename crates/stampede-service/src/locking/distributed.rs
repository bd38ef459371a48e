use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::{AsyncLockGuard, AsyncLockProvider, LockError, LockGuard, LockProvider, LockStore};
use crate::config::ConfigError;
use crate::key::Context;

/// A lock shared between processes through a [`LockStore`].
///
/// Acquiring creates a record for the key in the store, retrying every `retry_interval` until it
/// succeeds or `timeout` has passed. Records carry a lease, so a crashed holder blocks others at
/// most until the lease runs out. Releasing removes the record only while it is still owned by
/// this provider.
///
/// Errors talking to the store are logged and count as a failed attempt.
#[derive(Debug, Clone)]
pub struct DistributedLockProvider {
    store: Arc<dyn LockStore>,
    owner: String,
    timeout: Duration,
    retry_interval: Duration,
    lease: Duration,
}

impl DistributedLockProvider {
    /// Creates a provider on top of `store`.
    ///
    /// The lease defaults to `timeout`; see [`with_lease`](Self::with_lease).
    pub fn new(
        store: Arc<dyn LockStore>,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::InvalidDistributedLock(
                "timeout must not be zero".into(),
            ));
        }
        if retry_interval.is_zero() {
            return Err(ConfigError::InvalidDistributedLock(
                "retry interval must not be zero".into(),
            ));
        }

        Ok(Self {
            store,
            owner: owner_identity(),
            timeout,
            retry_interval,
            lease: timeout,
        })
    }

    /// Sets how long a lock record stays valid if it is never released.
    pub fn with_lease(mut self, lease: Duration) -> Result<Self, ConfigError> {
        if lease.is_zero() {
            return Err(ConfigError::InvalidDistributedLock(
                "lease must not be zero".into(),
            ));
        }
        self.lease = lease;
        Ok(self)
    }

    /// The identity this provider writes into its lock records.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    fn timed_out(&self, key: &str, start: Instant) -> LockError {
        metric!(counter("locks.distributed.timeout") += 1);
        super::record_acquire("distributed", start, false);
        tracing::debug!(key, timeout = ?self.timeout, "Timed out acquiring distributed lock");
        LockError::Timeout {
            key: key.to_owned(),
            timeout: self.timeout,
        }
    }

    /// Waits before the next attempt, never beyond the deadline.
    fn backoff(&self, deadline: Instant) -> Option<Duration> {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        if remaining.is_zero() {
            return None;
        }
        metric!(counter("locks.distributed.retry") += 1);
        Some(remaining.min(self.retry_interval))
    }
}

impl LockProvider for DistributedLockProvider {
    fn acquire_lock(
        &self,
        key: &str,
        _context: &Context,
        cancel: &CancellationToken,
    ) -> Result<LockGuard<'_>, LockError> {
        let start = Instant::now();
        let deadline = start + self.timeout;

        loop {
            if cancel.is_cancelled() {
                super::record_acquire("distributed", start, false);
                return Err(LockError::cancelled(key));
            }

            match self.store.try_acquire(key, &self.owner, self.lease) {
                Ok(true) => break,
                Ok(false) => {}
                Err(error) => log_store_error(key, &error),
            }

            match self.backoff(deadline) {
                Some(wait) => std::thread::sleep(wait),
                None => return Err(self.timed_out(key, start)),
            }
        }

        super::record_acquire("distributed", start, true);
        let key = key.to_owned();
        Ok(LockGuard::new(move || {
            if let Err(error) = self.store.release(&key, &self.owner) {
                log_release_error(&key, &error);
            }
        }))
    }
}

#[async_trait]
impl AsyncLockProvider for DistributedLockProvider {
    async fn acquire_lock<'a>(
        &'a self,
        key: &'a str,
        _context: &'a Context,
        cancel: &'a CancellationToken,
    ) -> Result<AsyncLockGuard<'a>, LockError> {
        let start = Instant::now();
        let deadline = start + self.timeout;

        loop {
            if cancel.is_cancelled() {
                super::record_acquire("distributed", start, false);
                return Err(LockError::cancelled(key));
            }

            let store = Arc::clone(&self.store);
            let (owned_key, owner, lease) = (key.to_owned(), self.owner.clone(), self.lease);
            let attempt =
                tokio::task::spawn_blocking(move || store.try_acquire(&owned_key, &owner, lease))
                    .await
                    .map_err(anyhow::Error::from)
                    .and_then(|result| result);

            match attempt {
                Ok(true) => break,
                Ok(false) => {}
                Err(error) => log_store_error(key, &error),
            }

            let Some(wait) = self.backoff(deadline) else {
                return Err(self.timed_out(key, start));
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    super::record_acquire("distributed", start, false);
                    return Err(LockError::cancelled(key));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        super::record_acquire("distributed", start, true);
        let store = Arc::clone(&self.store);
        let (key, owner) = (key.to_owned(), self.owner.clone());
        Ok(AsyncLockGuard::new(move || {
            async move {
                let release = {
                    let key = key.clone();
                    move || store.release(&key, &owner)
                };
                // dropped guards may be released outside of a runtime
                let result = match tokio::runtime::Handle::try_current() {
                    Ok(handle) => handle
                        .spawn_blocking(release)
                        .await
                        .map_err(anyhow::Error::from)
                        .and_then(|result| result),
                    Err(_) => release(),
                };
                if let Err(error) = result {
                    log_release_error(&key, &error);
                }
            }
            .boxed()
        }))
    }
}

fn log_store_error(key: &str, error: &anyhow::Error) {
    tracing::warn!(key, error = ?error, "Failed to acquire distributed lock");
}

fn log_release_error(key: &str, error: &anyhow::Error) {
    tracing::warn!(key, error = ?error, "Failed to release distributed lock");
}

/// `<hostname>-<uuid>`, unique for every provider instance.
fn owner_identity() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned());
    format!("{hostname}-{}", uuid::Uuid::new_v4())
}

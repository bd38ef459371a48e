use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio_util::sync::CancellationToken;

use super::registry::Registry;
use super::{AsyncCollapserOptions, CollapseError, CollapserEvent, Components, Outcome};
use crate::config::ConfigError;
use crate::key::Context;
use crate::locking::AsyncLockProvider;

type SharedOutcome<T, E> = Shared<BoxFuture<'static, Outcome<T, E>>>;

/// An execution running on the runtime, shared by every caller that joined it.
struct PendingFuture<T, E>
where
    T: Clone,
    E: Clone,
{
    outcome: SharedOutcome<T, E>,
}

impl<T, E> PendingFuture<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Spawns `execution`, so it runs to completion even if every caller goes away.
    fn spawn<Fut>(execution: Fut) -> Self
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let handle = tokio::spawn(execution);
        let outcome = async move {
            match handle.await {
                Ok(result) => result.map_err(CollapseError::Failed),
                Err(error) if error.is_panic() => Err(CollapseError::Panicked(
                    super::panic_message(error.into_panic()),
                )),
                // the runtime is shutting down
                Err(_) => Err(CollapseError::Cancelled),
            }
        };

        Self {
            outcome: outcome.boxed().shared(),
        }
    }

    #[cfg(test)]
    fn completed(outcome: Outcome<T, E>) -> Self {
        let outcome = futures::future::ready(outcome).boxed().shared();
        // a shared future only records its output once polled
        let _ = outcome.clone().now_or_never();
        Self { outcome }
    }

    fn is_completed(&self) -> bool {
        self.outcome.peek().is_some()
    }
}

/// Collapses concurrent calls with the same key into one execution, suspending the calling task.
///
/// See the [module docs](super) for the protocol. The first caller for a key spawns its callback
/// on the tokio runtime, and everybody joining awaits that task. The callback of a call that
/// joins an execution in flight is dropped without running.
///
/// Waiting on the execution cannot be cancelled through the caller's token. Dropping the future
/// returned from [`execute`](Self::execute) stops waiting but never stops the execution.
pub struct AsyncRequestCollapser<T, E>
where
    T: Clone,
    E: Clone,
{
    components: Components<dyn AsyncLockProvider>,
    registry: Registry<PendingFuture<T, E>>,
}

impl<T, E> AsyncRequestCollapser<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a collapser, failing if any of the options is missing.
    pub fn new(options: AsyncCollapserOptions) -> Result<Self, ConfigError> {
        let AsyncCollapserOptions {
            key_strategy,
            lock_provider,
            listener,
        } = options;

        Ok(Self {
            components: Components::new(key_strategy, lock_provider, listener)?,
            registry: Registry::new(),
        })
    }

    /// Runs `callback`, unless an execution for the same key is already in flight.
    ///
    /// The callback receives clones of the context and token of the call that started the
    /// execution. It is called while the key's lock is held, and only the future it returns runs
    /// without the lock, so the callback should do nothing but build that future.
    ///
    /// # Errors
    ///
    /// Returns the error of the shared execution, or a cancellation if `cancel` was signaled
    /// before the call could join an execution.
    pub async fn execute<F, Fut>(
        &self,
        callback: F,
        context: &Context,
        cancel: &CancellationToken,
    ) -> Outcome<T, E>
    where
        F: FnOnce(Context, CancellationToken) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(CollapseError::Cancelled);
        }

        let Some(key) = self.components.key_strategy.key(context) else {
            let execution = AssertUnwindSafe(callback(context.clone(), cancel.clone()));
            let outcome = match execution.catch_unwind().await {
                Ok(result) => result.map_err(CollapseError::Failed),
                Err(payload) => Err(CollapseError::Panicked(super::panic_message(payload))),
            };
            self.components
                .listener
                .on_event(CollapserEvent::NoKey, context);
            return outcome;
        };

        let (pending, created) = {
            let mut guard = self
                .components
                .lock_provider
                .acquire_lock(&key, context, cancel)
                .await?;
            let entry = self.registry.get_or_create(&key, || {
                PendingFuture::spawn(callback(context.clone(), cancel.clone()))
            });
            guard.release().await;
            entry
        };

        if created {
            metric!(counter("collapser.execution") += 1);
            tracing::trace!(key = %key, "Started collapsed execution");
        } else {
            metric!(counter("collapser.joined") += 1);
        }

        let already_completed = pending.is_completed();
        let outcome = pending.outcome.clone().await;

        self.evict(&key, &pending, context).await;

        if already_completed {
            self.components
                .listener
                .on_event(CollapserEvent::AlreadyCompleted, context);
        }
        if outcome.is_err() {
            self.components
                .listener
                .on_event(CollapserEvent::ExecutionFailed, context);
        }

        outcome
    }

    async fn evict(&self, key: &str, pending: &Arc<PendingFuture<T, E>>, context: &Context) {
        if !self.registry.is_current(key, pending) {
            return;
        }

        // the caller's token may be cancelled by now, but the entry must go regardless
        let cancel = CancellationToken::new();
        match self
            .components
            .lock_provider
            .acquire_lock(key, context, &cancel)
            .await
        {
            Ok(mut guard) => {
                if self.registry.remove_if_current(key, pending) {
                    metric!(counter("collapser.eviction") += 1);
                    tracing::trace!(key, "Evicted collapsed execution");
                }
                guard.release().await;
            }
            Err(error) => {
                tracing::warn!(key, error = %error, "Failed to evict collapsed execution");
            }
        }
    }

    #[cfg(test)]
    fn is_in_flight(&self, key: &str) -> bool {
        self.registry.contains(key)
    }
}

impl<T, E> fmt::Debug for AsyncRequestCollapser<T, E>
where
    T: Clone,
    E: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncRequestCollapser")
            .field("components", &self.components)
            .finish_non_exhaustive()
    }
}

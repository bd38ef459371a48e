use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use super::registry::Registry;
use super::{CollapseError, CollapserEvent, CollapserOptions, Components, Outcome};
use crate::config::ConfigError;
use crate::key::Context;
use crate::locking::LockProvider;

/// An execution shared by every caller that joined it.
///
/// The outcome slot is written exactly once, by whichever caller reaches it first. Everybody else
/// blocks until it is written.
struct PendingExecution<T, E> {
    outcome: OnceLock<Outcome<T, E>>,
}

impl<T, E> PendingExecution<T, E> {
    fn new() -> Self {
        Self {
            outcome: OnceLock::new(),
        }
    }

    fn is_completed(&self) -> bool {
        self.outcome.get().is_some()
    }
}

/// Collapses concurrent calls with the same key into one execution, blocking the calling thread.
///
/// See the [module docs](super) for the protocol. The callback of a call that joins an
/// execution in flight is dropped without running.
///
/// # Example
///
/// ```
/// use stampede_service::{CancellationToken, CollapserOptions, Context, RequestCollapser};
///
/// let collapser = RequestCollapser::<u32, String>::new(CollapserOptions::default()).unwrap();
/// let answer = collapser.execute(
///     |_, _| Ok(42),
///     &Context::new("answer"),
///     &CancellationToken::new(),
/// );
/// assert_eq!(answer, Ok(42));
/// ```
pub struct RequestCollapser<T, E> {
    components: Components<dyn LockProvider>,
    registry: Registry<PendingExecution<T, E>>,
}

impl<T, E> RequestCollapser<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a collapser, failing if any of the options is missing.
    pub fn new(options: CollapserOptions) -> Result<Self, ConfigError> {
        let CollapserOptions {
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
    /// # Errors
    ///
    /// Returns the error of the shared execution, or a cancellation if `cancel` was signaled
    /// before the call could join an execution.
    pub fn execute<F>(
        &self,
        callback: F,
        context: &Context,
        cancel: &CancellationToken,
    ) -> Outcome<T, E>
    where
        F: FnOnce(&Context, &CancellationToken) -> Result<T, E>,
    {
        if cancel.is_cancelled() {
            return Err(CollapseError::Cancelled);
        }

        let Some(key) = self.components.key_strategy.key(context) else {
            let outcome = run(|| callback(context, cancel));
            self.components
                .listener
                .on_event(CollapserEvent::NoKey, context);
            return outcome;
        };

        let pending = {
            let _guard = self
                .components
                .lock_provider
                .acquire_lock(&key, context, cancel)?;
            let (pending, created) = self.registry.get_or_create(&key, PendingExecution::new);
            if created {
                tracing::trace!(key = %key, "Started collapsed execution");
            }
            pending
        };

        let already_completed = pending.is_completed();
        let mut executed = false;
        let outcome = pending
            .outcome
            .get_or_init(|| {
                executed = true;
                run(|| callback(context, cancel))
            })
            .clone();

        if executed {
            metric!(counter("collapser.execution") += 1);
        } else {
            metric!(counter("collapser.joined") += 1);
        }

        self.evict(&key, &pending, context);

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

    fn evict(&self, key: &str, pending: &Arc<PendingExecution<T, E>>, context: &Context) {
        if !self.registry.is_current(key, pending) {
            return;
        }

        // the caller's token may be cancelled by now, but the entry must go regardless
        let cancel = CancellationToken::new();
        match self
            .components
            .lock_provider
            .acquire_lock(key, context, &cancel)
        {
            Ok(_guard) => {
                if self.registry.remove_if_current(key, pending) {
                    metric!(counter("collapser.eviction") += 1);
                    tracing::trace!(key, "Evicted collapsed execution");
                }
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

impl<T, E> fmt::Debug for RequestCollapser<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCollapser")
            .field("components", &self.components)
            .finish_non_exhaustive()
    }
}

/// Runs the callback, capturing a panic as an outcome.
fn run<T, E>(callback: impl FnOnce() -> Result<T, E>) -> Outcome<T, E> {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(result) => result.map_err(CollapseError::Failed),
        Err(payload) => Err(CollapseError::Panicked(super::panic_message(payload))),
    }
}

//! The engines collapsing concurrent duplicate calls into a single execution.
//!
//! Both engines follow the same protocol for every call:
//!
//! 1. Derive the key from the call's [`Context`]. Calls without a key run on their own.
//! 2. Under the key's lock, join the in-flight execution for the key or start a new one. The lock
//!    is released right away and never held while the work runs.
//! 3. Wait for the execution's outcome.
//! 4. Evict the execution from the registry, but only if it is still the one this call joined.
//! 5. Return a clone of the outcome.
//!
//! [`RequestCollapser`] blocks the calling thread, [`AsyncRequestCollapser`] suspends the calling
//! task.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::config::ConfigError;
use crate::key::{Context, DefaultKeyStrategy, KeyStrategy};
use crate::locking::{AsyncLockProvider, LockError, LockProvider, StripedLockProvider};

mod blocking;
mod events;
mod future;
mod registry;

pub use blocking::RequestCollapser;
pub use events::{CollapserEvent, EventListener, MetricsListener};
pub use future::AsyncRequestCollapser;

/// The outcome of a collapsed call.
pub type Outcome<T, E> = Result<T, CollapseError<E>>;

/// An error returned from a collapser.
///
/// [`Failed`](Self::Failed) and [`Panicked`](Self::Panicked) are outcomes of the shared execution
/// and are handed to every caller that joined it. The other variants only ever affect the caller
/// that ran into them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollapseError<E> {
    /// The caller's cancellation token was signaled before the call started.
    #[error("the call was cancelled")]
    Cancelled,
    /// The key's lock could not be acquired.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// The execution returned an error.
    #[error("the execution failed: {0}")]
    Failed(E),
    /// The execution panicked.
    #[error("the execution panicked: {0}")]
    Panicked(String),
}

impl<E> CollapseError<E> {
    /// Whether the call was abandoned rather than failing on its own.
    ///
    /// Lock timeouts count as cancellations, as the call never got to join an execution.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Lock(_))
    }

    /// The error returned from the execution, if that is what this is.
    pub fn failure(&self) -> Option<&E> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Options of a [`RequestCollapser`].
///
/// Every option must be set. The [`Default`] uses the [`DefaultKeyStrategy`], a
/// [`StripedLockProvider`] and the [`MetricsListener`].
#[derive(Debug, Clone)]
pub struct CollapserOptions {
    pub key_strategy: Option<Arc<dyn KeyStrategy>>,
    pub lock_provider: Option<Arc<dyn LockProvider>>,
    pub listener: Option<Arc<dyn EventListener>>,
}

impl Default for CollapserOptions {
    fn default() -> Self {
        Self {
            key_strategy: Some(Arc::new(DefaultKeyStrategy)),
            lock_provider: Some(Arc::new(StripedLockProvider::default())),
            listener: Some(Arc::new(MetricsListener)),
        }
    }
}

impl CollapserOptions {
    pub fn with_key_strategy(mut self, key_strategy: impl KeyStrategy + 'static) -> Self {
        self.key_strategy = Some(Arc::new(key_strategy));
        self
    }

    pub fn with_lock_provider(mut self, lock_provider: Arc<dyn LockProvider>) -> Self {
        self.lock_provider = Some(lock_provider);
        self
    }

    pub fn with_listener(mut self, listener: impl EventListener + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }
}

/// Options of an [`AsyncRequestCollapser`].
///
/// Like [`CollapserOptions`], but with an [`AsyncLockProvider`].
#[derive(Debug, Clone)]
pub struct AsyncCollapserOptions {
    pub key_strategy: Option<Arc<dyn KeyStrategy>>,
    pub lock_provider: Option<Arc<dyn AsyncLockProvider>>,
    pub listener: Option<Arc<dyn EventListener>>,
}

impl Default for AsyncCollapserOptions {
    fn default() -> Self {
        Self {
            key_strategy: Some(Arc::new(DefaultKeyStrategy)),
            lock_provider: Some(Arc::new(StripedLockProvider::default())),
            listener: Some(Arc::new(MetricsListener)),
        }
    }
}

impl AsyncCollapserOptions {
    pub fn with_key_strategy(mut self, key_strategy: impl KeyStrategy + 'static) -> Self {
        self.key_strategy = Some(Arc::new(key_strategy));
        self
    }

    pub fn with_lock_provider(mut self, lock_provider: Arc<dyn AsyncLockProvider>) -> Self {
        self.lock_provider = Some(lock_provider);
        self
    }

    pub fn with_listener(mut self, listener: impl EventListener + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }
}

/// The validated parts shared by both engines.
struct Components<L: ?Sized> {
    key_strategy: Arc<dyn KeyStrategy>,
    lock_provider: Arc<L>,
    listener: Arc<dyn EventListener>,
}

impl<L: ?Sized> Components<L> {
    fn new(
        key_strategy: Option<Arc<dyn KeyStrategy>>,
        lock_provider: Option<Arc<L>>,
        listener: Option<Arc<dyn EventListener>>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            key_strategy: key_strategy.ok_or(ConfigError::MissingKeyStrategy)?,
            lock_provider: lock_provider.ok_or(ConfigError::MissingLockProvider)?,
            listener: listener.ok_or(ConfigError::MissingListener)?,
        })
    }
}

impl<L: ?Sized> Clone for Components<L> {
    fn clone(&self) -> Self {
        Self {
            key_strategy: Arc::clone(&self.key_strategy),
            lock_provider: Arc::clone(&self.lock_provider),
            listener: Arc::clone(&self.listener),
        }
    }
}

impl<L: ?Sized + fmt::Debug> fmt::Debug for Components<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Components")
            .field("key_strategy", &self.key_strategy)
            .field("lock_provider", &self.lock_provider)
            .field("listener", &self.listener)
            .finish()
    }
}

/// Turns the payload of a caught panic into a message.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast_ref::<&'static str>() {
            Some(message) => (*message).to_owned(),
            None => "unknown panic payload".to_owned(),
        },
    }
}

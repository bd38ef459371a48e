//! Request collapsing for concurrent duplicate work.
//!
//! When many callers ask for the same piece of work at the same time, only one of them should
//! actually run it. Everybody else waits for that single execution and receives a clone of its
//! outcome. The first caller that observes the completed execution evicts it again, so a later
//! call starts a fresh execution while the remaining waiters still receive the old outcome.
//!
//! The building blocks are:
//!
//! - [`key`]: derives the deduplication key from a call's [`Context`](key::Context).
//! - [`locking`]: short-lived mutual exclusion scoped to a key, guarding only the registry
//!   mutation and never the work itself.
//! - [`collapser`]: the synchronous and asynchronous engines tying everything together.

#[macro_use]
pub mod metrics;

pub mod collapser;
pub mod config;
pub mod key;
pub mod locking;
pub mod logging;

pub use collapser::{
    AsyncCollapserOptions, AsyncRequestCollapser, CollapseError, CollapserEvent, CollapserOptions,
    EventListener, MetricsListener, RequestCollapser,
};
pub use config::ConfigError;
pub use key::{Context, DefaultKeyStrategy, KeyStrategy};
pub use tokio_util::sync::CancellationToken;

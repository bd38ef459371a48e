//! Helpers for testing the collapsers.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the directory is deleted while lock
//!    records are still being written to it. To avoid this, assign it to a variable in the test
//!    function (e.g. `let dir = test::tempdir()`).
//!
//!  - Use a [`Gate`] to hold callbacks inside their execution until every caller of interest has
//!    arrived, instead of sleeping for an arbitrary amount of time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `stampede` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("stampede_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Holds callers until it is opened.
///
/// Callers wait with [`wait`](Self::wait) from threads or [`wait_async`](Self::wait_async) from
/// tasks. The test observes how many callers have arrived with
/// [`wait_for_waiters`](Self::wait_for_waiters) and lets all of them through at once with
/// [`open`](Self::open). Once open, the gate stays open.
#[derive(Debug)]
pub struct Gate {
    arrived: Mutex<usize>,
    arrivals: Condvar,
    opened: watch::Sender<bool>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            arrived: Mutex::new(0),
            arrivals: Condvar::new(),
            opened: watch::Sender::new(false),
        }
    }

    fn arrive(&self) {
        *self.arrived.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        self.arrivals.notify_all();
    }

    /// Blocks the current thread until the gate is opened.
    pub fn wait(&self) {
        self.arrive();
        let mut opened = self.opened.subscribe();
        while !*opened.borrow_and_update() {
            // `watch` has no blocking receive, so poll
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Suspends the current task until the gate is opened.
    pub async fn wait_async(&self) {
        self.arrive();
        let mut opened = self.opened.subscribe();
        // the sender lives as long as `self`
        let _ = opened.wait_for(|open| *open).await;
    }

    /// The number of callers that arrived at the gate so far.
    pub fn arrived(&self) -> usize {
        *self.arrived.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until at least `count` callers arrived at the gate.
    pub fn wait_for_waiters(&self, count: usize) {
        let arrived = self.arrived.lock().unwrap_or_else(PoisonError::into_inner);
        let _arrived = self
            .arrivals
            .wait_while(arrived, |arrived| *arrived < count)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Suspends the current task until at least `count` callers arrived at the gate.
    pub async fn wait_for_waiters_async(&self, count: usize) {
        while self.arrived() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Lets every current and future caller through.
    pub fn open(&self) {
        self.opened.send_replace(true);
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts how often the work behind a collapser actually ran.
#[derive(Debug, Default)]
pub struct ExecutionCounter {
    executions: AtomicUsize,
}

impl ExecutionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one execution and returns its 1-based sequence number.
    pub fn hit(&self) -> usize {
        self.executions.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The number of executions so far.
    pub fn count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

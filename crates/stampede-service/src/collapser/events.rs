use std::fmt;

use crate::key::Context;

/// Something noteworthy that happened while collapsing a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollapserEvent {
    /// No key could be derived, so the call ran on its own.
    NoKey,
    /// The call joined an execution that had already completed but was not evicted yet.
    AlreadyCompleted,
    /// The execution the call joined failed or panicked.
    ExecutionFailed,
}

impl CollapserEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollapserEvent::NoKey => "no_key",
            CollapserEvent::AlreadyCompleted => "already_completed",
            CollapserEvent::ExecutionFailed => "failed",
        }
    }
}

impl fmt::Display for CollapserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observes the [`CollapserEvent`]s of a collapser.
///
/// Listeners run inline on the calling thread or task and should return quickly.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: CollapserEvent, context: &Context);
}

impl<F> EventListener for F
where
    F: Fn(CollapserEvent, &Context) + Send + Sync,
{
    fn on_event(&self, event: CollapserEvent, context: &Context) {
        self(event, context)
    }
}

impl fmt::Debug for dyn EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<EventListener>")
    }
}

/// Reports every event as a statsd counter and a debug log.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsListener;

impl EventListener for MetricsListener {
    fn on_event(&self, event: CollapserEvent, context: &Context) {
        match event {
            CollapserEvent::NoKey => metric!(counter("collapser.no_key") += 1),
            CollapserEvent::AlreadyCompleted => {
                metric!(counter("collapser.already_completed") += 1)
            }
            CollapserEvent::ExecutionFailed => metric!(counter("collapser.failed") += 1),
        }
        tracing::debug!(
            event = event.as_str(),
            operation_key = context.operation_key(),
            "Collapser event"
        );
    }
}

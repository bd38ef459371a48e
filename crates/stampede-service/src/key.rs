//! Execution contexts and the strategies deriving deduplication keys from them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The context of a single call going through a collapser.
///
/// The context carries the *operation key*, which is what the [`DefaultKeyStrategy`] uses to
/// decide which calls are duplicates of each other, and a map of free-form properties that
/// custom [`KeyStrategy`] implementations can use instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    operation_key: Option<Arc<str>>,
    properties: BTreeMap<String, String>,
}

impl Context {
    /// Creates a context for the operation identified by `operation_key`.
    pub fn new(operation_key: impl Into<Arc<str>>) -> Self {
        Self {
            operation_key: Some(operation_key.into()),
            properties: BTreeMap::new(),
        }
    }

    /// Creates a context without an operation key.
    ///
    /// Calls with such a context are never collapsed by the [`DefaultKeyStrategy`].
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Adds a property to this context.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// The operation key, if any.
    pub fn operation_key(&self) -> Option<&str> {
        self.operation_key.as_deref()
    }

    /// Looks up a property by name.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

/// Decides which calls are considered duplicates of each other.
///
/// Calls that map to the same key while an execution for that key is in flight are collapsed
/// into that execution. Returning `None` opts the call out of collapsing altogether.
///
/// Implementations must be free of side effects: the key is computed once per call and then
/// used both to join and to evict the in-flight execution.
pub trait KeyStrategy: Send + Sync {
    /// Gets the key for the call running with `context`.
    fn key(&self, context: &Context) -> Option<String>;
}

impl<F> KeyStrategy for F
where
    F: Fn(&Context) -> Option<String> + Send + Sync,
{
    fn key(&self, context: &Context) -> Option<String> {
        self(context)
    }
}

/// Uses the [`Context::operation_key`] as the key.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyStrategy;

impl KeyStrategy for DefaultKeyStrategy {
    fn key(&self, context: &Context) -> Option<String> {
        context.operation_key().map(str::to_owned)
    }
}

impl fmt::Debug for dyn KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<KeyStrategy>")
    }
}

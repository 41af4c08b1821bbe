//! Job handlers keyed by job name.

use crate::context::JobContext;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Future returned by a handler.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Type-erased job handler. Receives the job params and its context.
pub type Handler = Arc<dyn Fn(Value, JobContext) -> HandlerFuture + Send + Sync>;

/// Set of handlers a worker dispatches to.
///
/// ```rust,ignore
/// let handlers = Handlers::new().on("world", |params, _ctx| async move {
///     Ok(json!(format!("hello {params}")))
/// });
/// ```
#[derive(Clone, Default)]
pub struct Handlers {
    map: HashMap<String, Handler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler for `name`, replacing any previous one.
    #[must_use]
    pub fn on<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.insert(name, Arc::new(move |params, ctx| handler(params, ctx).boxed()));
        self
    }

    /// Adds an already type-erased handler.
    pub fn insert(&mut self, name: impl Into<String>, handler: Handler) {
        self.map.insert(name.into(), handler);
    }

    /// Merges `other` into this set; handlers in `other` win.
    pub fn extend(&mut self, other: Handlers) {
        self.map.extend(other.map);
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.map.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.map.keys()).finish()
    }
}

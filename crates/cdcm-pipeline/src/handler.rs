use std::sync::Arc;

use parking_lot::RwLock;

use crate::event::RowEvent;

/// A hook the sink stage runs around every batch it hands downstream.
///
/// `name` identifies the handler kind inside a chain; two handlers with the
/// same name are considered the same observer.
pub trait DownstreamHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn before(&self, _events: &[RowEvent]) {}
}

/// Ordered handler chain owned by a sink stage. Index 0 is the outermost
/// handler and sees every batch first.
#[derive(Default)]
pub struct HandlerChain {
    handlers: RwLock<Vec<Arc<dyn DownstreamHandler>>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at `position` (clamped to the chain length) unless a handler
    /// with the same name is already present. Returns `false` and leaves the
    /// chain untouched in that case.
    pub fn insert_if_absent(&self, position: usize, handler: Arc<dyn DownstreamHandler>) -> bool {
        let mut handlers = self.handlers.write();
        if handlers.iter().any(|h| h.name() == handler.name()) {
            return false;
        }
        let at = position.min(handlers.len());
        tracing::debug!(handler = handler.name(), position = at, "handler inserted");
        handlers.insert(at, handler);
        true
    }

    pub fn push(&self, handler: Arc<dyn DownstreamHandler>) {
        self.handlers.write().push(handler);
    }

    /// Remove every handler named `name`; returns how many were dropped.
    pub fn remove(&self, name: &str) -> usize {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| h.name() != name);
        before - handlers.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().iter().any(|h| h.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.read().iter().map(|h| h.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn DownstreamHandler>> {
        self.handlers.read().clone()
    }

    pub fn run_before(&self, events: &[RowEvent]) {
        for handler in self.snapshot() {
            handler.before(events);
        }
    }
}

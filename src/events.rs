//! Error channel and lifecycle signals
//!
//! Components report recoverable faults here instead of failing the
//! operation that ran into them. Consumers subscribe callbacks to observe
//! errors and context state changes without reaching into internals.

use crate::error::Error;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;
type LifecycleHandler = Arc<dyn Fn(Lifecycle) + Send + Sync>;

/// Lifecycle signals raised by a sync context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Shared fan-out for recoverable errors
#[derive(Clone, Default)]
pub struct ErrorChannel {
    handlers: Arc<RwLock<Vec<ErrorHandler>>>,
}

impl ErrorChannel {
    /// Create a channel without subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked for every reported error
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Report an error to all subscribers.
    ///
    /// Returns whether at least one subscriber received it.
    pub fn report(&self, error: &Error) -> bool {
        warn!("{}", error);

        // Handlers may subscribe further handlers, so call them on a snapshot
        let handlers: Vec<ErrorHandler> = self.handlers.read().clone();
        for handler in &handlers {
            handler(error);
        }
        !handlers.is_empty()
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl fmt::Debug for ErrorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorChannel")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Error channel plus lifecycle subscribers for one sync context
#[derive(Clone, Default)]
pub struct Events {
    errors: ErrorChannel,
    lifecycle: Arc<RwLock<Vec<LifecycleHandler>>>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events sharing an existing error channel
    pub fn with_errors(errors: ErrorChannel) -> Self {
        Events {
            errors,
            lifecycle: Arc::default(),
        }
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    /// Register a callback for lifecycle signals
    pub fn on_lifecycle<F>(&self, handler: F)
    where
        F: Fn(Lifecycle) + Send + Sync + 'static,
    {
        self.lifecycle.write().push(Arc::new(handler));
    }

    /// Register a callback for errors
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.errors.subscribe(handler);
    }

    pub(crate) fn raise(&self, signal: Lifecycle) {
        let handlers: Vec<LifecycleHandler> = self.lifecycle.read().clone();
        for handler in &handlers {
            handler(signal);
        }
    }

    pub(crate) fn raise_error(&self, error: &Error) -> bool {
        self.errors.report(error)
    }
}

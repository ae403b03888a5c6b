//! Typed listener set for connection lifecycle events.

use std::fmt;
use std::sync::Arc;

use crate::error::TransportError;

type ReceivedFn = Arc<dyn Fn(serde_json::Value) + Send + Sync>;
type LifecycleFn = Arc<dyn Fn() + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// The callback set a transport reports into.
///
/// Hooks are function-valued fields injected at construction; there is no
/// global event state. Every transport normalizes its wire traffic into this
/// one surface: messages arrive through `received`, lifecycle transitions
/// through `connected`/`reconnected`/`disconnected`, and genuine failures
/// through `error`. Unset hooks are no-ops.
#[derive(Clone, Default)]
pub struct TransportHooks {
    received: Option<ReceivedFn>,
    connected: Option<LifecycleFn>,
    reconnected: Option<LifecycleFn>,
    disconnected: Option<LifecycleFn>,
    slow_connection: Option<LifecycleFn>,
    error: Option<ErrorFn>,
}

impl TransportHooks {
    /// Creates an empty hook set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the callback invoked once per delivered message, in receipt
    /// order.
    #[must_use]
    pub fn on_received(mut self, f: impl Fn(serde_json::Value) + Send + Sync + 'static) -> Self {
        self.received = Some(Arc::new(f));
        self
    }

    /// Sets the callback invoked when the initial handshake completes.
    #[must_use]
    pub fn on_connected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.connected = Some(Arc::new(f));
        self
    }

    /// Sets the callback invoked when a dropped channel is re-established.
    #[must_use]
    pub fn on_reconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.reconnected = Some(Arc::new(f));
        self
    }

    /// Sets the callback invoked when the connection ends.
    #[must_use]
    pub fn on_disconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.disconnected = Some(Arc::new(f));
        self
    }

    /// Sets the callback invoked when keep-alives run late enough to warn.
    #[must_use]
    pub fn on_slow_connection(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.slow_connection = Some(Arc::new(f));
        self
    }

    /// Sets the callback invoked once per genuine failure.
    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&TransportError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    /// Delivers one message to the consumer.
    pub fn received(&self, message: serde_json::Value) {
        if let Some(f) = &self.received {
            f(message);
        }
    }

    /// Announces handshake completion.
    pub fn connected(&self) {
        if let Some(f) = &self.connected {
            f();
        }
    }

    /// Announces channel re-establishment.
    pub fn reconnected(&self) {
        if let Some(f) = &self.reconnected {
            f();
        }
    }

    /// Announces the end of the connection.
    pub fn disconnected(&self) {
        if let Some(f) = &self.disconnected {
            f();
        }
    }

    /// Announces a slow-connection warning.
    pub fn slow_connection(&self) {
        if let Some(f) = &self.slow_connection {
            f();
        }
    }

    /// Surfaces one genuine failure.
    pub fn error(&self, err: &TransportError) {
        if let Some(f) = &self.error {
            f(err);
        }
    }
}

impl fmt::Debug for TransportHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHooks")
            .field("received", &self.received.is_some())
            .field("connected", &self.connected.is_some())
            .field("reconnected", &self.reconnected.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .field("slow_connection", &self.slow_connection.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unset_hooks_are_noops() {
        let hooks = TransportHooks::new();
        hooks.received(serde_json::json!("x"));
        hooks.connected();
        hooks.error(&TransportError::Timeout);
    }

    #[test]
    fn test_hooks_invoke_callbacks() {
        let count = Arc::new(AtomicUsize::new(0));
        let hooks = {
            let count = Arc::clone(&count);
            TransportHooks::new().on_received(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        hooks.received(serde_json::json!(1));
        hooks.received(serde_json::json!(2));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}

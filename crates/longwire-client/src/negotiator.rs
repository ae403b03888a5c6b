//! Transport selection and fallback.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use longwire_core::{TransportError, TransportResult};

use crate::connection::Connection;
use crate::transport::ClientTransport;

/// Tries candidate transports in priority order and commits to the first
/// that completes its handshake.
///
/// The chain is a linear state machine: trying candidate `i` either commits,
/// advances to `i + 1`, or, after the last candidate, exhausts, surfacing
/// the last observed failure. Failed attempts leave no partial state behind;
/// once committed, every subsequent `send`/`abort` call is routed to the
/// winning transport for the connection's lifetime.
pub struct AutoTransport {
    candidates: Vec<Arc<dyn ClientTransport>>,
    committed: Mutex<Option<Arc<dyn ClientTransport>>>,
}

impl AutoTransport {
    /// Builds a negotiator over `candidates`, highest capability first.
    #[must_use]
    pub fn new(candidates: Vec<Arc<dyn ClientTransport>>) -> Arc<Self> {
        Arc::new(Self {
            candidates,
            committed: Mutex::new(None),
        })
    }

    /// The transport the negotiator locked in, if any.
    #[must_use]
    pub fn committed(&self) -> Option<Arc<dyn ClientTransport>> {
        self.committed.lock().clone()
    }
}

impl fmt::Debug for AutoTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoTransport")
            .field("candidates", &self.candidates.len())
            .field(
                "committed",
                &self.committed.lock().as_ref().map(|t| t.name()),
            )
            .finish()
    }
}

#[async_trait]
impl ClientTransport for AutoTransport {
    fn name(&self) -> &'static str {
        self.committed
            .lock()
            .as_ref()
            .map_or("auto", |t| t.name())
    }

    fn supports_keep_alive(&self) -> bool {
        self.committed
            .lock()
            .as_ref()
            .is_some_and(|t| t.supports_keep_alive())
    }

    async fn start(&self, connection: &Arc<Connection>) -> TransportResult<()> {
        let mut last_error = TransportError::StartFailed(
            "no candidate transports configured".to_string(),
        );

        for candidate in &self.candidates {
            debug!(transport = candidate.name(), "trying transport");
            match candidate.start(connection).await {
                Ok(()) => {
                    info!(transport = candidate.name(), "transport committed");
                    *self.committed.lock() = Some(Arc::clone(candidate));
                    return Ok(());
                }
                Err(err) => {
                    warn!(transport = candidate.name(), error = %err, "transport failed to start");
                    last_error = err;
                }
            }
        }

        Err(TransportError::StartFailed(format!(
            "every candidate transport failed; last error: {last_error}"
        )))
    }

    async fn send(
        &self,
        connection: &Arc<Connection>,
        payload: serde_json::Value,
    ) -> TransportResult<()> {
        let transport = self.committed().ok_or_else(|| {
            TransportError::SendFailed("no transport committed".to_string())
        })?;
        transport.send(connection, payload).await
    }

    async fn abort(&self, connection: &Arc<Connection>, timeout: Duration) -> bool {
        match self.committed() {
            Some(transport) => transport.abort(connection, timeout).await,
            None => true,
        }
    }

    async fn lost_connection(&self, connection: &Arc<Connection>) {
        if let Some(transport) = self.committed() {
            transport.lost_connection(connection).await;
        }
    }
}

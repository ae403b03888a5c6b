//! The contract every client transport implements.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use longwire_core::{TransportError, TransportResult};

use crate::connection::Connection;

/// One wire strategy on the consumer side.
///
/// Transports are stateless façades over per-connection loops: `start`
/// spawns the receive loop and resolves when the handshake completes or
/// fails, exactly once: a failed first handshake is a start failure, never
/// an ongoing error stream. All delivery flows through the connection's
/// hook set.
#[async_trait]
pub trait ClientTransport: Send + Sync + fmt::Debug {
    /// Wire name sent in the `transport` query parameter.
    fn name(&self) -> &'static str;

    /// Whether this transport carries keep-alive traffic worth monitoring.
    fn supports_keep_alive(&self) -> bool;

    /// Starts the transport's receive loop for `connection`.
    ///
    /// # Errors
    ///
    /// Returns the handshake failure; no retry is attempted for a failed
    /// first connect.
    async fn start(&self, connection: &Arc<Connection>) -> TransportResult<()>;

    /// Sends one payload to the server.
    ///
    /// # Errors
    ///
    /// Returns the send failure.
    async fn send(&self, connection: &Arc<Connection>, payload: serde_json::Value)
    -> TransportResult<()>;

    /// Issues the idempotent teardown request.
    async fn abort(&self, connection: &Arc<Connection>, timeout: Duration) -> bool {
        connection.abort_request(self.name(), timeout).await
    }

    /// Invoked by the keep-alive monitor when the server has gone silent.
    async fn lost_connection(&self, connection: &Arc<Connection>) {
        let _ = connection;
    }
}

/// Waits for a receive loop's handshake signal, bounding the wait.
///
/// Cancels `loop_cancel` on timeout so the spawned loop stops instead of
/// retrying a handshake nobody is waiting for.
pub(crate) async fn await_handshake(
    init_rx: oneshot::Receiver<TransportResult<()>>,
    connect_timeout: Duration,
    loop_cancel: &CancellationToken,
) -> TransportResult<()> {
    match tokio::time::timeout(connect_timeout, init_rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(TransportError::StartFailed(
            "receive loop ended before the handshake completed".to_string(),
        )),
        Err(_) => {
            loop_cancel.cancel();
            Err(TransportError::Timeout)
        }
    }
}

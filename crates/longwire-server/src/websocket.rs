//! Native socket encoding over an axum WebSocket upgrade.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use longwire_core::{Cursor, Envelope, TransportError, TransportResult};

use crate::connection::ConnectionEvents;
use crate::forever::{ForeverTransport, LoopEntry, WireWriter};
use crate::heartbeat::{TrackedConnection, TransportHeartbeat};

/// Emits envelopes through the strictly serialized outbound queue.
///
/// Concurrent writers would corrupt framing, so every outbound frame goes
/// through one mpsc channel drained by a single writer task.
#[derive(Debug)]
struct SocketWriter {
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl WireWriter for SocketWriter {
    async fn send_envelope(&self, envelope: &Envelope) -> TransportResult<()> {
        let payload = serde_json::to_string(envelope)?;
        self.tx
            .send(Message::Text(payload.into()))
            .await
            .map_err(|_| TransportError::SendFailed("socket writer gone".to_string()))
    }
}

/// The native-socket specialization of the shared skeleton.
///
/// Bypasses the envelope-per-HTTP-response model: envelopes are pushed
/// directly over the socket as they are pulled. Inbound text frames arrive
/// already reassembled up to the protocol's end-of-message marker and are
/// dispatched as one logical message each. Socket close or protocol error
/// fires the disconnect hook directly; the socket's own close event is
/// authoritative, not the liveness tracker's timeout path.
pub struct WebSocketTransport {
    forever: Arc<ForeverTransport>,
    heartbeat: Arc<TransportHeartbeat>,
    events: Arc<dyn ConnectionEvents>,
}

impl WebSocketTransport {
    /// Wraps the skeleton for a socket session.
    #[must_use]
    pub fn new(
        forever: Arc<ForeverTransport>,
        heartbeat: Arc<TransportHeartbeat>,
        events: Arc<dyn ConnectionEvents>,
    ) -> Self {
        Self {
            forever,
            heartbeat,
            events,
        }
    }

    /// Serves one upgraded socket until it closes or the loop terminates.
    pub async fn serve(
        self,
        socket: WebSocket,
        entry: LoopEntry,
        cursor: Option<Cursor>,
        cancel: CancellationToken,
    ) {
        let connection = Arc::clone(self.forever.connection());
        let connection_id = connection.connection_id().to_string();
        let (mut sink, mut stream) = socket.split();

        let (tx, mut rx) = mpsc::channel::<Message>(64);

        // Single consumer of the sink: outbound frames cannot interleave.
        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(err) = sink.send(message).await {
                    debug!(error = %err, "socket send failed, stopping writer");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // The socket's close event ends the receive loop through this
        // child token rather than through liveness timeouts.
        let socket_cancel = cancel.child_token();

        let reader_task = {
            let events = Arc::clone(&self.events);
            let socket_cancel = socket_cancel.clone();
            let connection_id = connection_id.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        frame = stream.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                let value = serde_json::from_str(&text)
                                    .unwrap_or_else(|_| serde_json::Value::String(text.to_string()));
                                events.received(&connection_id, value).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!(connection_id = %connection_id, "socket closed by peer");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(connection_id = %connection_id, error = %err, "socket protocol error");
                                break;
                            }
                        },
                        () = socket_cancel.cancelled() => break,
                    }
                }
                socket_cancel.cancel();
            })
        };

        let writer = SocketWriter { tx };
        let outcome = self
            .forever
            .run_until_terminal(&writer, entry, cursor, socket_cancel.clone())
            .await;
        socket_cancel.cancel();

        match outcome {
            Ok(outcome) => debug!(connection_id = %connection_id, ?outcome, "socket loop finished"),
            Err(err) if err.is_cancellation() => {
                // Host shutdown terminates the loop without a disconnect;
                // a peer-initiated close is authoritative and fires it
                // directly, bypassing the liveness timeout path.
                if !cancel.is_cancelled() && connection.try_fire_disconnect() {
                    self.events.disconnected(&connection_id).await;
                }
            }
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "socket loop failed");
                if connection.try_fire_disconnect() {
                    self.events.disconnected(&connection_id).await;
                }
            }
        }

        connection.mark_inactive();
        self.heartbeat.remove_connection(&connection_id);
        drop(writer);

        let _ = reader_task.await;
        let _ = writer_task.await;
    }
}

impl fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("forever", &self.forever)
            .finish()
    }
}

//! Native socket client transport.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use longwire_core::{Envelope, TransportError, TransportResult};

use crate::connection::{Connection, ConnectionState};
use crate::http::{self, ReceiveParams};
use crate::long_polling::announce_reconnected;
use crate::transport::{ClientTransport, await_handshake};

/// What processing one inbound envelope tells the socket loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketFlow {
    /// Keep reading frames.
    Continue,
    /// Drop the socket and reconnect fresh.
    Reconnect,
    /// Stop the transport entirely.
    Stop,
}

fn classify_ws(err: &WsError) -> TransportError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            TransportError::ConnectionLost("socket closed".to_string())
        }
        WsError::Io(io) => TransportError::Io(io.to_string()),
        WsError::Protocol(p) => TransportError::ProtocolError(p.to_string()),
        other => TransportError::ConnectionLost(other.to_string()),
    }
}

/// Rewrites an HTTP endpoint URL onto the socket scheme.
fn ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// Applies one envelope frame to the connection.
fn apply_envelope(connection: &Arc<Connection>, envelope: &Envelope) -> SocketFlow {
    for message in &envelope.messages {
        connection.mark_keep_alive();
        connection.hooks().received(message.clone());
    }
    connection.advance_cursor(envelope.cursor);
    if let Some(groups) = &envelope.groups_token {
        connection.set_groups_token(groups.clone());
    }

    if envelope.disconnect {
        connection.disconnect_locally();
        return SocketFlow::Stop;
    }
    if envelope.aborted {
        return SocketFlow::Stop;
    }
    if envelope.timed_out {
        return SocketFlow::Reconnect;
    }
    SocketFlow::Continue
}

/// State shared between the transport façade and its socket loop.
#[derive(Debug, Default)]
struct SocketShared {
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    socket_cancel: Mutex<Option<CancellationToken>>,
}

/// Full-duplex socket transport.
///
/// Outbound sends go through a strictly serialized queue drained by one
/// writer task; concurrent writers would corrupt framing. Inbound frames
/// arrive already reassembled to the protocol's end-of-message marker and
/// carry one envelope each. A close or protocol error drops the socket and
/// reconnects per the shared retry policy.
#[derive(Debug, Default)]
pub struct WebSocketsTransport {
    shared: Arc<SocketShared>,
}

impl WebSocketsTransport {
    /// Creates the transport.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ClientTransport for WebSocketsTransport {
    fn name(&self) -> &'static str {
        "webSockets"
    }

    fn supports_keep_alive(&self) -> bool {
        true
    }

    async fn start(&self, connection: &Arc<Connection>) -> TransportResult<()> {
        let (init_tx, init_rx) = oneshot::channel();
        let loop_cancel = connection.stop_token().child_token();

        tokio::spawn(socket_loop(
            Arc::clone(&self.shared),
            Arc::clone(connection),
            init_tx,
            loop_cancel.clone(),
        ));

        await_handshake(
            init_rx,
            connection.timings().transport_connect_timeout,
            &loop_cancel,
        )
        .await
    }

    async fn send(
        &self,
        _connection: &Arc<Connection>,
        payload: serde_json::Value,
    ) -> TransportResult<()> {
        let sender = self.shared.sender.lock().clone().ok_or_else(|| {
            TransportError::SendFailed("socket is not connected".to_string())
        })?;
        let json = serde_json::to_string(&payload)?;
        sender
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| TransportError::SendFailed("socket writer gone".to_string()))
    }

    async fn lost_connection(&self, _connection: &Arc<Connection>) {
        // Drop the current socket; the loop reconnects with a fresh one.
        if let Some(token) = self.shared.socket_cancel.lock().clone() {
            debug!("keep-alive lost; recycling socket");
            token.cancel();
        }
    }
}

/// The connect/read/reconnect loop for one connection.
async fn socket_loop(
    shared: Arc<SocketShared>,
    connection: Arc<Connection>,
    init_tx: oneshot::Sender<TransportResult<()>>,
    cancel: CancellationToken,
) {
    let mut init_tx = Some(init_tx);
    let mut announce_flag: Option<Arc<AtomicBool>> = None;
    let timings = connection.timings().clone();

    'outer: loop {
        if cancel.is_cancelled() {
            break;
        }

        let Some(token) = connection.connection_token() else {
            if let Some(tx) = init_tx.take() {
                let _ = tx.send(Err(TransportError::StartFailed(
                    "socket loop started before negotiation".to_string(),
                )));
            }
            break;
        };

        let endpoint = if init_tx.is_some() { "connect" } else { "reconnect" };
        let params = ReceiveParams {
            message_id: connection.cursor(),
            groups_token: connection.groups_token(),
            frame_id: None,
        };
        let url = match http::receive_url(
            connection.base_url(),
            endpoint,
            "webSockets",
            &token,
            connection.connection_data(),
            &params,
        ) {
            Ok(url) => ws_scheme(&url),
            Err(err) => {
                if let Some(tx) = init_tx.take() {
                    let _ = tx.send(Err(err));
                }
                break;
            }
        };

        let connected = tokio::select! {
            connected = connect_async(url.as_str()) => connected,
            () = cancel.cancelled() => break,
        };

        match connected {
            Ok((socket, _response)) => {
                let (mut sink, mut stream) = socket.split();
                let (tx, mut rx) = mpsc::channel::<Message>(64);
                let socket_cancel = cancel.child_token();
                *shared.sender.lock() = Some(tx);
                *shared.socket_cancel.lock() = Some(socket_cancel.clone());

                // Single consumer of the sink keeps outbound frames whole.
                let writer = tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.close().await;
                });

                if let Some(tx) = init_tx.take() {
                    let _ = tx.send(Ok(()));
                } else if let Some(flag) = announce_flag.take() {
                    announce_reconnected(&connection, &flag);
                }

                let mut flow = SocketFlow::Reconnect;
                loop {
                    let frame = tokio::select! {
                        frame = stream.next() => frame,
                        () = socket_cancel.cancelled() => {
                            flow = if cancel.is_cancelled() {
                                SocketFlow::Stop
                            } else {
                                SocketFlow::Reconnect
                            };
                            break;
                        }
                    };

                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<Envelope>(&text) {
                                Ok(envelope) => match apply_envelope(&connection, &envelope) {
                                    SocketFlow::Continue => {}
                                    other => {
                                        flow = other;
                                        break;
                                    }
                                },
                                Err(err) => {
                                    connection.hooks().error(&TransportError::from(err));
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("socket closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            let err = classify_ws(&err);
                            if !err.is_cancellation() && !err.is_benign_disconnect() {
                                connection.hooks().error(&err);
                            } else {
                                warn!(error = %err, "socket dropped");
                            }
                            break;
                        }
                    }
                }

                *shared.sender.lock() = None;
                *shared.socket_cancel.lock() = None;
                let _ = writer.await;

                if flow == SocketFlow::Stop {
                    break 'outer;
                }
            }
            Err(err) => {
                let err = classify_ws(&err);
                if let Some(tx) = init_tx.take() {
                    // A failed first connect is a start failure, reported
                    // once; no retry follows.
                    let _ = tx.send(Err(err));
                    break;
                }
                if !err.is_cancellation() && !err.is_benign_disconnect() {
                    connection.hooks().error(&err);
                }
            }
        }

        if cancel.is_cancelled() || !connection.is_active() {
            break;
        }
        connection.change_state(ConnectionState::Connected, ConnectionState::Reconnecting);
        if announce_flag.is_none() {
            announce_flag = Some(Arc::new(AtomicBool::new(false)));
        }
        tokio::select! {
            () = tokio::time::sleep(timings.retry_delay) => {}
            () = cancel.cancelled() => break,
        }
    }
    debug!("socket loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ByteStream, HttpRequester};
    use longwire_core::{ConnectionTimings, Cursor, TransportHooks};
    use serde_json::json;

    #[derive(Debug)]
    struct UnusedRequester;

    #[async_trait]
    impl HttpRequester for UnusedRequester {
        async fn post(&self, _url: &str, _body: Option<String>) -> TransportResult<String> {
            Err(TransportError::Internal("not expected".to_string()))
        }

        async fn get_stream(&self, _url: &str) -> TransportResult<ByteStream> {
            Err(TransportError::Internal("not expected".to_string()))
        }
    }

    fn connection() -> Arc<Connection> {
        Connection::new(
            "http://host/wire",
            Arc::new(UnusedRequester),
            TransportHooks::new(),
            ConnectionTimings::fast(),
        )
    }

    #[test]
    fn test_ws_scheme_rewrite() {
        assert_eq!(ws_scheme("http://h/connect"), "ws://h/connect");
        assert_eq!(ws_scheme("https://h/connect"), "wss://h/connect");
    }

    #[tokio::test]
    async fn test_apply_envelope_delivers_and_advances() {
        let connection = connection();
        let envelope = Envelope::at(Cursor::new(4)).with_messages(vec![json!("x")]);
        assert_eq!(apply_envelope(&connection, &envelope), SocketFlow::Continue);
        assert_eq!(connection.cursor(), Some(Cursor::new(4)));
    }

    #[tokio::test]
    async fn test_apply_envelope_timed_out_reconnects() {
        let connection = connection();
        let envelope = Envelope::at(Cursor::new(1)).timed_out();
        assert_eq!(apply_envelope(&connection, &envelope), SocketFlow::Reconnect);
    }

    #[tokio::test]
    async fn test_apply_envelope_disconnect_stops() {
        let connection = connection();
        connection.change_state(ConnectionState::Disconnected, ConnectionState::Connected);
        let envelope = Envelope::at(Cursor::new(1)).disconnecting();
        assert_eq!(apply_envelope(&connection, &envelope), SocketFlow::Stop);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_without_socket_fails() {
        let transport = WebSocketsTransport::new();
        let err = transport
            .send(&connection(), json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::SendFailed(_)));
    }
}

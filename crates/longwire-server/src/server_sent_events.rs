//! Server-push streaming encoding: `id:`/`data:` records over one response.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use longwire_core::{Cursor, Envelope, TransportError, TransportResult};

use crate::forever::{ForeverTransport, LoopEntry, WireWriter};
use crate::heartbeat::TrackedConnection;

/// Reserved payload meaning "handshake complete"; never a real message.
pub const INIT_PAYLOAD: &str = "initialized";

/// Renders the handshake record written once before any envelope.
#[must_use]
pub fn initialized_record() -> Bytes {
    Bytes::from(format!("data: {INIT_PAYLOAD}\n\n"))
}

/// Renders one `id:`/`data:` record.
#[must_use]
pub fn record(cursor: Cursor, data: &str) -> Bytes {
    Bytes::from(format!("id: {cursor}\ndata: {data}\n\n"))
}

/// Renders a keep-alive comment ignored by record parsers.
#[must_use]
pub fn keep_alive_record() -> Bytes {
    Bytes::from_static(b": keep-alive\n\n")
}

/// Renders every record an envelope produces: one per message, all sharing
/// the envelope's cursor.
#[must_use]
pub fn envelope_records(envelope: &Envelope) -> Bytes {
    let mut out = Vec::new();
    for message in &envelope.messages {
        let data = message
            .as_str()
            .map_or_else(|| message.to_string(), str::to_string);
        out.extend_from_slice(&record(envelope.cursor, &data));
    }
    Bytes::from(out)
}

/// Forwards envelopes from the receive loop into the response stream.
#[derive(Debug)]
struct StreamWriter {
    tx: mpsc::Sender<Envelope>,
}

#[async_trait]
impl WireWriter for StreamWriter {
    async fn send_envelope(&self, envelope: &Envelope) -> TransportResult<()> {
        self.tx
            .send(envelope.clone())
            .await
            .map_err(|_| TransportError::SendFailed("response stream closed".to_string()))
    }
}

/// The server-sent-events specialization of the shared skeleton.
///
/// One persistent response; the byte stream is never closed until the loop
/// reaches a terminal outcome or the client goes away.
pub struct ServerSentEventsTransport {
    forever: Arc<ForeverTransport>,
    keep_alive: Option<Duration>,
}

impl ServerSentEventsTransport {
    /// Wraps the skeleton for SSE streaming.
    #[must_use]
    pub fn new(forever: Arc<ForeverTransport>, keep_alive: Option<Duration>) -> Self {
        Self {
            forever,
            keep_alive,
        }
    }

    /// Builds the streaming HTTP response for a connect/reconnect request.
    pub fn into_response(
        self,
        entry: LoopEntry,
        cursor: Option<Cursor>,
        cancel: CancellationToken,
    ) -> Response {
        let (tx, mut rx) = mpsc::channel::<Envelope>(16);
        let forever = Arc::clone(&self.forever);
        let connection_id = forever.connection().connection_id().to_string();

        tokio::spawn(async move {
            let writer = StreamWriter { tx };
            match forever.run_until_terminal(&writer, entry, cursor, cancel).await {
                Ok(outcome) => {
                    debug!(connection_id = %connection_id, ?outcome, "sse loop finished")
                }
                Err(err) if err.is_cancellation() => {
                    debug!(connection_id = %connection_id, "sse loop cancelled");
                }
                Err(err) => {
                    warn!(connection_id = %connection_id, error = %err, "sse loop failed");
                }
            }
            forever.connection().mark_inactive();
        });

        let keep_alive = self.keep_alive;
        let stream = async_stream::stream! {
            yield Ok::<Bytes, std::convert::Infallible>(initialized_record());

            let mut ticker = keep_alive.map(tokio::time::interval);
            if let Some(t) = ticker.as_mut() {
                // The first tick fires immediately; swallow it.
                t.tick().await;
            }

            enum Tick {
                Envelope(Option<Envelope>),
                KeepAlive,
            }

            loop {
                let next = match ticker.as_mut() {
                    Some(t) => {
                        tokio::select! {
                            envelope = rx.recv() => Tick::Envelope(envelope),
                            _ = t.tick() => Tick::KeepAlive,
                        }
                    }
                    None => Tick::Envelope(rx.recv().await),
                };
                match next {
                    Tick::KeepAlive => yield Ok(keep_alive_record()),
                    Tick::Envelope(Some(envelope)) => {
                        let records = envelope_records(&envelope);
                        // A flags-only envelope has nothing to frame, and an
                        // empty chunk would terminate a chunked body.
                        if !records.is_empty() {
                            yield Ok(records);
                        }
                    }
                    Tick::Envelope(None) => break,
                }
            }
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .expect("static response parts are valid")
    }
}

impl fmt::Debug for ServerSentEventsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSentEventsTransport")
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initialized_record_is_reserved_sentinel() {
        assert_eq!(&initialized_record()[..], b"data: initialized\n\n");
    }

    #[test]
    fn test_record_framing() {
        let bytes = record(Cursor::new(3), "hello");
        assert_eq!(&bytes[..], b"id: 3\ndata: hello\n\n");
    }

    #[test]
    fn test_envelope_records_one_per_message() {
        let envelope = Envelope::at(Cursor::new(7))
            .with_messages(vec![json!("hello"), json!({"k": 1})]);
        let bytes = envelope_records(&envelope);
        let text = std::str::from_utf8(&bytes).unwrap();
        assert_eq!(
            text,
            "id: 7\ndata: hello\n\nid: 7\ndata: {\"k\":1}\n\n"
        );
    }

    #[test]
    fn test_keep_alive_is_a_comment() {
        assert!(keep_alive_record().starts_with(b":"));
    }
}

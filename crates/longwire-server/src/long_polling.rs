//! Long-polling server encoding: one HTTP request per loop iteration.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use longwire_core::{Envelope, TransportError, TransportResult};

use crate::forever::{ForeverTransport, LoopEntry, WireWriter};
use crate::heartbeat::TrackedConnection;
use crate::request::{RequestKind, TransportRequest};

/// Captures the single envelope a long-polling iteration produces.
///
/// The "loop" is reconstructed by the client reissuing requests, so each
/// request/response pair carries exactly one envelope as its JSON body.
#[derive(Debug, Default)]
struct CapturedResponse {
    slot: Mutex<Option<Envelope>>,
}

#[async_trait]
impl WireWriter for CapturedResponse {
    async fn send_envelope(&self, envelope: &Envelope) -> TransportResult<()> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(TransportError::Internal(
                "long polling emitted more than one envelope per request".to_string(),
            ));
        }
        *slot = Some(envelope.clone());
        Ok(())
    }
}

/// The long-polling specialization of the shared skeleton.
pub struct LongPollingTransport {
    forever: ForeverTransport,
    long_poll_delay_ms: Option<u64>,
}

impl LongPollingTransport {
    /// Wraps the skeleton for long-polling requests.
    ///
    /// A non-zero `long_poll_delay` is attached to every response as the
    /// client's pacing hint.
    #[must_use]
    pub fn new(forever: ForeverTransport, long_poll_delay: std::time::Duration) -> Self {
        let millis = long_poll_delay.as_millis() as u64;
        Self {
            forever,
            long_poll_delay_ms: (millis > 0).then_some(millis),
        }
    }

    /// Serves one long-polling request, returning the envelope to write as
    /// the response body.
    ///
    /// A `connect` request that carries a cursor while the transport is
    /// marked inactive is a reconnect in disguise: the client lost its
    /// channel and is re-establishing it without having hit the explicit
    /// reconnect endpoint.
    ///
    /// # Errors
    ///
    /// Propagates pull failures and cancellation to the HTTP caller.
    pub async fn process_request(
        &self,
        request: &TransportRequest,
        cancel: CancellationToken,
    ) -> TransportResult<Envelope> {
        let connection = self.forever.connection();

        let entry = match request.kind {
            RequestKind::Connect if request.message_id.is_some() && !connection.is_alive() => {
                debug!(
                    connection_id = %connection.connection_id(),
                    "connect with existing cursor on inactive transport, treating as reconnect"
                );
                LoopEntry::Reconnect
            }
            RequestKind::Connect => LoopEntry::Connect,
            RequestKind::Reconnect => LoopEntry::Reconnect,
            RequestKind::Poll => LoopEntry::Poll,
            RequestKind::Send | RequestKind::Abort => {
                return Err(TransportError::ProtocolError(
                    "send/abort requests never enter the receive loop".to_string(),
                ));
            }
        };

        // The channel is only writable while a request is outstanding,
        // including when the caller drops us mid-pull.
        struct InactiveOnDrop(Arc<crate::connection::ServerConnection>);
        impl Drop for InactiveOnDrop {
            fn drop(&mut self) {
                self.0.mark_inactive();
            }
        }
        let _guard = InactiveOnDrop(Arc::clone(connection));

        let writer = CapturedResponse::default();
        self.forever
            .run_once(&writer, entry, request.message_id, cancel)
            .await?;

        let mut envelope = writer.slot.lock().take().ok_or_else(|| {
            TransportError::Internal("long polling iteration produced no envelope".to_string())
        })?;

        if envelope.long_poll_delay_ms.is_none() {
            envelope.long_poll_delay_ms = self.long_poll_delay_ms;
        }
        Ok(envelope)
    }
}

impl fmt::Debug for LongPollingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongPollingTransport")
            .field("forever", &self.forever)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionEvents, ServerConnection};
    use crate::heartbeat::TransportHeartbeat;
    use longwire_core::source::ChannelMessageSource;
    use longwire_core::{ConnectionTimings, Cursor, MessageSource};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct CountingEvents {
        connected: AtomicUsize,
        reconnected: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionEvents for CountingEvents {
        async fn connected(&self, _connection_id: &str) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        async fn reconnected(&self, _connection_id: &str) {
            self.reconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn build() -> (
        LongPollingTransport,
        Arc<ChannelMessageSource>,
        Arc<CountingEvents>,
    ) {
        let events = Arc::new(CountingEvents::default());
        let source = ChannelMessageSource::new();
        let connection = ServerConnection::new(
            "c1",
            Duration::from_secs(5),
            CancellationToken::new(),
            Arc::clone(&source),
            events.clone() as Arc<dyn ConnectionEvents>,
        );
        let heartbeat = TransportHeartbeat::new(ConnectionTimings::fast());
        let forever = ForeverTransport::new(
            connection,
            source.clone() as Arc<dyn MessageSource>,
            heartbeat,
            events.clone() as Arc<dyn ConnectionEvents>,
        );
        (
            LongPollingTransport::new(forever, Duration::from_millis(150)),
            source,
            events,
        )
    }

    fn request(endpoint: &str, message_id: Option<&str>) -> TransportRequest {
        let mut params: HashMap<String, String> = [
            ("transport".to_string(), "longPolling".to_string()),
            ("connectionToken".to_string(), "tok".to_string()),
        ]
        .into();
        if let Some(id) = message_id {
            params.insert("messageId".to_string(), id.to_string());
        }
        TransportRequest::classify(endpoint, &params).unwrap()
    }

    #[tokio::test]
    async fn test_connect_returns_one_envelope_and_goes_inactive() {
        let (transport, source, events) = build();
        source.publish(json!("m1"));

        let envelope = transport
            .process_request(&request("connect", None), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(envelope.cursor, Cursor::new(1));
        assert_eq!(envelope.messages, vec![json!("m1")]);
        assert_eq!(envelope.long_poll_delay_ms, Some(150));
        assert_eq!(events.connected.load(Ordering::SeqCst), 1);
        assert!(!transport.forever.connection().is_alive());
    }

    #[tokio::test]
    async fn test_connect_with_cursor_on_inactive_transport_is_reconnect() {
        let (transport, source, events) = build();
        source.publish(json!("m1"));
        transport
            .process_request(&request("connect", None), CancellationToken::new())
            .await
            .unwrap();

        // The next request arrives on the connect endpoint but carries the
        // cursor of an interrupted session.
        source.publish(json!("m2"));
        let envelope = transport
            .process_request(&request("connect", Some("1")), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(envelope.messages, vec![json!("m2")]);
        assert_eq!(events.connected.load(Ordering::SeqCst), 1);
        assert_eq!(events.reconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_request_is_rejected_by_receive_loop() {
        let (transport, _source, _events) = build();
        let result = transport
            .process_request(&request("send", None), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransportError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn test_poll_resumes_from_cursor() {
        let (transport, source, _events) = build();
        source.publish(json!("a"));
        source.publish(json!("b"));

        transport
            .process_request(&request("connect", None), CancellationToken::new())
            .await
            .unwrap();

        source.publish(json!("c"));
        let envelope = transport
            .process_request(&request("poll", Some("2")), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(envelope.messages, vec![json!("c")]);
        assert_eq!(envelope.cursor, Cursor::new(3));
    }
}

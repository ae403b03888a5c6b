//! Server-sent-events client transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use longwire_core::{Cursor, TransportError, TransportResult};

use crate::connection::{Connection, ConnectionState};
use crate::http::{self, ReceiveParams};
use crate::long_polling::announce_reconnected;
use crate::transport::{ClientTransport, await_handshake};

/// Reserved payload meaning "handshake complete"; never delivered as a
/// message.
const INIT_PAYLOAD: &str = "initialized";

/// One parsed record field from the stream.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RecordEvent {
    /// An `id:` line updating the cursor.
    Cursor(Cursor),
    /// The reserved handshake-completion payload.
    Initialized,
    /// A real message payload.
    Message(serde_json::Value),
}

/// Incremental `id:`/`data:` line parser over a growing text buffer.
///
/// Line processing is re-entrancy-guarded: a push that lands while another
/// pass is running is coalesced into a pending counter and drained after
/// the current pass finishes, bounding stack depth under bursty input.
#[derive(Debug, Default)]
pub(crate) struct StreamingParser {
    buffer: Mutex<String>,
    processing: AtomicBool,
    pending: AtomicUsize,
}

impl StreamingParser {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and drives the processing loop.
    pub(crate) fn push(&self, chunk: &str, on_event: &mut dyn FnMut(RecordEvent)) {
        self.buffer.lock().push_str(chunk);
        self.pending.fetch_add(1, Ordering::SeqCst);

        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Another pass is running; it drains the pending counter.
            return;
        }

        loop {
            while self.pending.swap(0, Ordering::SeqCst) > 0 {
                self.drain_lines(on_event);
            }
            self.processing.store(false, Ordering::SeqCst);

            // A push may have landed between the drain and the release.
            if self.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            if self
                .processing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                break;
            }
        }
    }

    fn drain_lines(&self, on_event: &mut dyn FnMut(RecordEvent)) {
        loop {
            let line = {
                let mut buffer = self.buffer.lock();
                match buffer.find('\n') {
                    Some(index) => {
                        let line = buffer[..index].trim_end_matches('\r').to_string();
                        buffer.drain(..=index);
                        line
                    }
                    None => break,
                }
            };
            Self::parse_line(&line, on_event);
        }
    }

    fn parse_line(line: &str, on_event: &mut dyn FnMut(RecordEvent)) {
        if line.is_empty() {
            return;
        }
        if let Some(rest) = line.strip_prefix("id:") {
            match rest.trim().parse::<Cursor>() {
                Ok(cursor) => on_event(RecordEvent::Cursor(cursor)),
                Err(_) => trace!(line, "ignoring unparsable id line"),
            }
        } else if let Some(rest) = line.strip_prefix("data:") {
            let payload = rest.strip_prefix(' ').unwrap_or(rest);
            if payload == INIT_PAYLOAD {
                on_event(RecordEvent::Initialized);
            } else {
                let value = serde_json::from_str(payload)
                    .unwrap_or_else(|_| serde_json::Value::String(payload.to_string()));
                on_event(RecordEvent::Message(value));
            }
        }
        // Comment and unknown lines (keep-alives) are ignored.
    }
}

/// Server-push streaming from the consumer side.
///
/// Opens one streaming response and pulls fixed-size chunks into the
/// [`StreamingParser`]; end-of-stream schedules a reconnect after the fixed
/// retry delay for as long as the connection stays active.
#[derive(Debug, Default)]
pub struct ServerSentEventsTransport;

impl ServerSentEventsTransport {
    /// Creates the transport.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl ClientTransport for ServerSentEventsTransport {
    fn name(&self) -> &'static str {
        "serverSentEvents"
    }

    fn supports_keep_alive(&self) -> bool {
        true
    }

    async fn start(&self, connection: &Arc<Connection>) -> TransportResult<()> {
        let (init_tx, init_rx) = oneshot::channel();
        let loop_cancel = connection.stop_token().child_token();

        tokio::spawn(read_loop(
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
        connection: &Arc<Connection>,
        payload: serde_json::Value,
    ) -> TransportResult<()> {
        let token = connection.connection_token().ok_or_else(|| {
            TransportError::SendFailed("connection has not negotiated".to_string())
        })?;
        let url = http::control_url(
            connection.base_url(),
            "send",
            self.name(),
            &token,
            connection.connection_data(),
        )?;

        let json = serde_json::to_string(&payload)?;
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("data", &json)
            .finish();

        connection
            .requester()
            .post(&url, Some(body))
            .await
            .map(|_| ())
    }
}

/// The streaming read loop, including reconnect-on-end-of-stream.
async fn read_loop(
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
                    "read loop started before negotiation".to_string(),
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
            "serverSentEvents",
            &token,
            connection.connection_data(),
            &params,
        ) {
            Ok(url) => url,
            Err(err) => {
                if let Some(tx) = init_tx.take() {
                    let _ = tx.send(Err(err));
                }
                break;
            }
        };

        let opened = tokio::select! {
            opened = connection.requester().get_stream(&url) => opened,
            () = cancel.cancelled() => break,
        };

        match opened {
            Ok(mut stream) => {
                let parser = StreamingParser::new();
                loop {
                    let chunk = tokio::select! {
                        chunk = stream.next() => chunk,
                        () = cancel.cancelled() => break 'outer,
                    };

                    match chunk {
                        Some(Ok(bytes)) if bytes.is_empty() => {
                            // Zero-length read: the stream is over.
                            debug!("stream ended with empty read");
                            break;
                        }
                        Some(Ok(bytes)) => {
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            parser.push(&text, &mut |event| {
                                apply_event(&connection, event, &mut init_tx, &mut announce_flag);
                            });
                        }
                        Some(Err(err)) => {
                            if !err.is_cancellation() && !err.is_benign_disconnect() {
                                connection.hooks().error(&err);
                            }
                            break;
                        }
                        None => {
                            debug!("stream ended");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
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

        if init_tx.is_some() {
            // The stream ended before the handshake record arrived.
            if let Some(tx) = init_tx.take() {
                let _ = tx.send(Err(TransportError::StartFailed(
                    "stream ended before the handshake completed".to_string(),
                )));
            }
            break;
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
    debug!("sse read loop ended");
}

fn apply_event(
    connection: &Arc<Connection>,
    event: RecordEvent,
    init_tx: &mut Option<oneshot::Sender<TransportResult<()>>>,
    announce_flag: &mut Option<Arc<AtomicBool>>,
) {
    match event {
        RecordEvent::Cursor(cursor) => connection.advance_cursor(cursor),
        RecordEvent::Initialized => {
            if let Some(tx) = init_tx.take() {
                let _ = tx.send(Ok(()));
            } else if let Some(flag) = announce_flag.take() {
                announce_reconnected(connection, &flag);
            }
        }
        RecordEvent::Message(value) => {
            connection.mark_keep_alive();
            connection.hooks().received(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ByteStream, HttpRequester};
    use bytes::Bytes;
    use longwire_core::{ConnectionTimings, TransportHooks};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;

    fn collect(parser: &StreamingParser, chunks: &[&str]) -> Vec<RecordEvent> {
        let mut events = Vec::new();
        for chunk in chunks {
            parser.push(chunk, &mut |event| events.push(event));
        }
        events
    }

    #[test]
    fn test_records_split_arbitrarily_across_chunks() {
        let parser = StreamingParser::new();
        let events = collect(
            &parser,
            &["data: initia", "lized\n\nid: 3\n", "data: hello\n\n"],
        );

        assert_eq!(
            events,
            vec![
                RecordEvent::Initialized,
                RecordEvent::Cursor(Cursor::new(3)),
                RecordEvent::Message(json!("hello")),
            ]
        );
    }

    #[test]
    fn test_initialized_is_not_a_message() {
        let parser = StreamingParser::new();
        let events = collect(&parser, &["data: initialized\n\n"]);
        assert_eq!(events, vec![RecordEvent::Initialized]);
    }

    #[test]
    fn test_json_payloads_are_parsed() {
        let parser = StreamingParser::new();
        let events = collect(&parser, &["data: {\"k\":1}\n\n"]);
        assert_eq!(events, vec![RecordEvent::Message(json!({"k": 1}))]);
    }

    #[test]
    fn test_comment_lines_are_ignored() {
        let parser = StreamingParser::new();
        let events = collect(&parser, &[": keep-alive\n\nid: 5\n"]);
        assert_eq!(events, vec![RecordEvent::Cursor(Cursor::new(5))]);
    }

    #[test]
    fn test_busy_pass_coalesces_into_pending_counter() {
        let parser = StreamingParser::new();
        let mut events = Vec::new();

        // Simulate a pass already running: the push must buffer and count
        // instead of recursing into processing.
        parser.processing.store(true, Ordering::SeqCst);
        parser.push("id: 9\n", &mut |event| events.push(event));
        assert!(events.is_empty());
        assert_eq!(parser.pending.load(Ordering::SeqCst), 1);

        // The active pass releases; the next push drains everything.
        parser.processing.store(false, Ordering::SeqCst);
        parser.push("", &mut |event| events.push(event));
        assert_eq!(events, vec![RecordEvent::Cursor(Cursor::new(9))]);
    }

    /// Requester handing out one scripted byte stream per call.
    #[derive(Debug)]
    struct StreamScript {
        streams: parking_lot::Mutex<VecDeque<Vec<TransportResult<Bytes>>>>,
    }

    #[async_trait]
    impl HttpRequester for StreamScript {
        async fn post(&self, _url: &str, _body: Option<String>) -> TransportResult<String> {
            Ok(json!({
                "connectionId": "cid",
                "connectionToken": "tok",
                "protocolVersion": "1.5",
                "tryWebSockets": false,
                "disconnectTimeout": 30.0,
                "transportConnectTimeout": 5.0,
                "longPollDelay": 0.0
            })
            .to_string())
        }

        async fn get_stream(&self, _url: &str) -> TransportResult<ByteStream> {
            let next = self.streams.lock().pop_front();
            match next {
                Some(chunks) => Ok(Box::pin(futures::stream::iter(chunks))),
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    #[tokio::test]
    async fn test_start_completes_on_initialized_and_delivers_messages() {
        let requester = Arc::new(StreamScript {
            streams: parking_lot::Mutex::new(VecDeque::from([vec![
                Ok(Bytes::from("data: initia")),
                Ok(Bytes::from("lized\n\nid: 3\n")),
                Ok(Bytes::from("data: hello\n\n")),
            ]])),
        });

        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let hooks = {
            let received = Arc::clone(&received);
            TransportHooks::new().on_received(move |m| received.lock().push(m))
        };
        let connection = Connection::new(
            "http://host/wire",
            requester,
            hooks,
            ConnectionTimings {
                retry_delay: Duration::from_millis(20),
                ..ConnectionTimings::fast()
            },
        );

        connection
            .start(ServerSentEventsTransport::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*received.lock(), vec![json!("hello")]);
        assert_eq!(connection.cursor(), Some(Cursor::new(3)));
        connection.stop(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_failed_stream_open_is_a_start_failure() {
        #[derive(Debug)]
        struct RefusingRequester;

        #[async_trait]
        impl HttpRequester for RefusingRequester {
            async fn post(&self, _url: &str, _body: Option<String>) -> TransportResult<String> {
                Ok(json!({
                    "connectionId": "cid",
                    "connectionToken": "tok",
                    "protocolVersion": "1.5",
                    "tryWebSockets": false,
                    "disconnectTimeout": 30.0,
                    "transportConnectTimeout": 5.0,
                    "longPollDelay": 0.0
                })
                .to_string())
            }

            async fn get_stream(&self, _url: &str) -> TransportResult<ByteStream> {
                Err(TransportError::ConnectionFailed("refused".to_string()))
            }
        }

        let connection = Connection::new(
            "http://host/wire",
            Arc::new(RefusingRequester),
            TransportHooks::new(),
            ConnectionTimings::fast(),
        );

        let err = connection
            .start(ServerSentEventsTransport::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}

//! Long-polling client transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use longwire_core::{Envelope, TransportError, TransportResult};

use crate::connection::{Connection, ConnectionState};
use crate::http::{self, ReceiveParams};
use crate::transport::{ClientTransport, await_handshake};

/// Fires the reconnected hook for exactly one winner per interruption.
///
/// Both the timer-based announcement and the first successful response race
/// for the same flag; first writer wins.
pub(crate) fn announce_reconnected(connection: &Arc<Connection>, flag: &AtomicBool) {
    if flag
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        connection.change_state(ConnectionState::Reconnecting, ConnectionState::Connected);
        connection.hooks().reconnected();
    }
}

/// Long polling: one HTTP request per receive-loop iteration.
///
/// The server holds each poll open until something is deliverable; the
/// client reissues the next request as soon as a response lands. Failures
/// are classified per the shared taxonomy: cancellation is silent, benign
/// disconnects retry quietly, anything else raises the error hook once
/// before the delayed retry.
#[derive(Debug, Default)]
pub struct LongPollingTransport;

impl LongPollingTransport {
    /// Creates the transport.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl ClientTransport for LongPollingTransport {
    fn name(&self) -> &'static str {
        "longPolling"
    }

    fn supports_keep_alive(&self) -> bool {
        false
    }

    async fn start(&self, connection: &Arc<Connection>) -> TransportResult<()> {
        let (init_tx, init_rx) = oneshot::channel();
        let loop_cancel = connection.stop_token().child_token();

        tokio::spawn(poll_loop(
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

/// The retry loop reconstructing the server-side receive loop one request
/// at a time.
async fn poll_loop(
    connection: Arc<Connection>,
    init_tx: oneshot::Sender<TransportResult<()>>,
    cancel: CancellationToken,
) {
    let mut init_tx = Some(init_tx);
    let mut raise_reconnect = false;
    let mut announce_flag: Option<Arc<AtomicBool>> = None;
    let timings = connection.timings().clone();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let Some(token) = connection.connection_token() else {
            if let Some(tx) = init_tx.take() {
                let _ = tx.send(Err(TransportError::StartFailed(
                    "poll loop started before negotiation".to_string(),
                )));
            }
            break;
        };

        let endpoint = if init_tx.is_some() {
            "connect"
        } else if raise_reconnect {
            "reconnect"
        } else {
            "poll"
        };
        let params = ReceiveParams {
            message_id: connection.cursor(),
            groups_token: connection.groups_token(),
            frame_id: None,
        };
        let url = match http::receive_url(
            connection.base_url(),
            endpoint,
            "longPolling",
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

        trace!(endpoint, "issuing poll request");
        let result = tokio::select! {
            result = connection.requester().post(&url, None) => result,
            () = cancel.cancelled() => Err(TransportError::Cancelled),
        };
        let parsed = result.and_then(|body| {
            serde_json::from_str::<Envelope>(&body).map_err(TransportError::from)
        });

        match parsed {
            Ok(envelope) => {
                if raise_reconnect {
                    raise_reconnect = false;
                    if let Some(flag) = announce_flag.take() {
                        announce_reconnected(&connection, &flag);
                    }
                }
                if let Some(tx) = init_tx.take() {
                    let _ = tx.send(Ok(()));
                }

                for message in &envelope.messages {
                    connection.mark_keep_alive();
                    connection.hooks().received(message.clone());
                }
                connection.advance_cursor(envelope.cursor);
                if let Some(groups) = &envelope.groups_token {
                    connection.set_groups_token(groups.clone());
                }

                if envelope.disconnect {
                    debug!("server requested disconnect");
                    connection.disconnect_locally();
                    break;
                }
                if envelope.aborted {
                    break;
                }
                if envelope.timed_out {
                    // Reconnect fresh; the server expired the reconnection
                    // window, not the network.
                    raise_reconnect = true;
                    announce_flag = Some(Arc::new(AtomicBool::new(false)));
                    connection
                        .change_state(ConnectionState::Connected, ConnectionState::Reconnecting);
                    continue;
                }

                let delay = envelope
                    .long_poll_delay()
                    .unwrap_or(timings.long_poll_delay);
                if !delay.is_zero() {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => break,
                    }
                }
            }
            Err(err) if err.is_cancellation() => break,
            Err(err) => {
                if let Some(tx) = init_tx.take() {
                    // A failed first connect is a start failure, reported
                    // once; no retry follows.
                    let _ = tx.send(Err(err));
                    break;
                }

                if !err.is_benign_disconnect() {
                    connection.hooks().error(&err);
                }
                if !connection.is_active() {
                    break;
                }

                raise_reconnect = true;
                if announce_flag.is_none() {
                    let flag = Arc::new(AtomicBool::new(false));
                    announce_flag = Some(Arc::clone(&flag));
                    connection
                        .change_state(ConnectionState::Connected, ConnectionState::Reconnecting);

                    // Timer-based announcement racing the next successful
                    // response; announce_reconnected lets the first writer
                    // win.
                    let timer_connection = Arc::clone(&connection);
                    let timer_cancel = cancel.clone();
                    let announce_delay = timings.retry_delay * 2;
                    tokio::spawn(async move {
                        tokio::select! {
                            () = tokio::time::sleep(announce_delay) => {
                                announce_reconnected(&timer_connection, &flag);
                            }
                            () = timer_cancel.cancelled() => {}
                        }
                    });
                }

                tokio::select! {
                    () = tokio::time::sleep(timings.retry_delay) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }
    }
    debug!("poll loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ByteStream, HttpRequester};
    use longwire_core::{ConnectionTimings, Cursor, TransportHooks};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Scripted requester: pops one response per request and records URLs.
    #[derive(Debug, Default)]
    struct ScriptedRequester {
        responses: Mutex<VecDeque<TransportResult<String>>>,
        requests: Mutex<Vec<String>>,
        hang_when_empty: bool,
    }

    impl ScriptedRequester {
        fn new(responses: Vec<TransportResult<String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
                hang_when_empty: true,
            })
        }

        fn requested_endpoints(&self) -> Vec<String> {
            self.requests
                .lock()
                .iter()
                .map(|url| {
                    let path = url.split('?').next().unwrap_or(url);
                    path.rsplit('/').next().unwrap_or(path).to_string()
                })
                .collect()
        }
    }

    #[async_trait]
    impl HttpRequester for ScriptedRequester {
        async fn post(&self, url: &str, _body: Option<String>) -> TransportResult<String> {
            self.requests.lock().push(url.to_string());
            let next = self.responses.lock().pop_front();
            match next {
                Some(result) => result,
                None if self.hang_when_empty => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                None => Err(TransportError::Internal("script exhausted".to_string())),
            }
        }

        async fn get_stream(&self, _url: &str) -> TransportResult<ByteStream> {
            Err(TransportError::Internal("not a streaming test".to_string()))
        }
    }

    fn negotiation_body() -> String {
        json!({
            "connectionId": "cid",
            "connectionToken": "tok",
            "protocolVersion": "1.5",
            "tryWebSockets": false,
            "disconnectTimeout": 30.0,
            "transportConnectTimeout": 5.0,
            "longPollDelay": 0.0
        })
        .to_string()
    }

    fn envelope_body(cursor: u64, messages: Vec<serde_json::Value>) -> String {
        serde_json::to_string(&Envelope::at(Cursor::new(cursor)).with_messages(messages)).unwrap()
    }

    fn timings() -> ConnectionTimings {
        ConnectionTimings {
            retry_delay: Duration::from_millis(20),
            transport_connect_timeout: Duration::from_millis(200),
            ..ConnectionTimings::fast()
        }
    }

    #[tokio::test]
    async fn test_connect_then_poll_delivers_in_order() {
        let requester = ScriptedRequester::new(vec![
            Ok(negotiation_body()),
            Ok(envelope_body(2, vec![json!("a"), json!("b")])),
            Ok(envelope_body(3, vec![json!("c")])),
        ]);

        let received = Arc::new(Mutex::new(Vec::new()));
        let hooks = {
            let received = Arc::clone(&received);
            TransportHooks::new().on_received(move |m| received.lock().push(m))
        };
        let connection = Connection::new("http://host/wire", requester.clone(), hooks, timings());

        connection
            .start(LongPollingTransport::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*received.lock(), vec![json!("a"), json!("b"), json!("c")]);
        assert_eq!(connection.cursor(), Some(Cursor::new(3)));
        assert_eq!(
            requester.requested_endpoints()[..3],
            ["negotiate", "connect", "poll"]
        );
        connection.stop(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_first_connect_timeout_reports_start_failure_without_retry() {
        // Negotiation succeeds; the connect request never responds.
        let requester = ScriptedRequester::new(vec![Ok(negotiation_body())]);
        let connection = Connection::new(
            "http://host/wire",
            requester.clone(),
            TransportHooks::new(),
            timings(),
        );

        let err = connection
            .start(LongPollingTransport::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        // No retry is attempted after the failed first connect.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(requester.requested_endpoints(), ["negotiate", "connect"]);
    }

    #[tokio::test]
    async fn test_first_connect_fault_reports_start_failure_without_retry() {
        let requester = ScriptedRequester::new(vec![
            Ok(negotiation_body()),
            Err(TransportError::ProtocolError("boom".to_string())),
        ]);
        let errors = Arc::new(AtomicUsize::new(0));
        let hooks = {
            let errors = Arc::clone(&errors);
            TransportHooks::new().on_error(move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            })
        };
        let connection = Connection::new("http://host/wire", requester.clone(), hooks, timings());

        let err = connection
            .start(LongPollingTransport::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ProtocolError(_)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(requester.requested_endpoints(), ["negotiate", "connect"]);
        assert_eq!(
            errors.load(Ordering::SeqCst),
            0,
            "init failures bypass the generic error hook"
        );
    }

    #[tokio::test]
    async fn test_generic_poll_fault_raises_error_once_then_reconnects() {
        let requester = ScriptedRequester::new(vec![
            Ok(negotiation_body()),
            Ok(envelope_body(1, vec![])),
            Err(TransportError::ProtocolError("fault".to_string())),
            Ok(envelope_body(1, vec![])),
        ]);
        let errors = Arc::new(AtomicUsize::new(0));
        let reconnects = Arc::new(AtomicUsize::new(0));
        let hooks = {
            let errors = Arc::clone(&errors);
            let reconnects = Arc::clone(&reconnects);
            TransportHooks::new()
                .on_error(move |_| {
                    errors.fetch_add(1, Ordering::SeqCst);
                })
                .on_reconnected(move || {
                    reconnects.fetch_add(1, Ordering::SeqCst);
                })
        };
        let connection = Connection::new("http://host/wire", requester.clone(), hooks, timings());

        connection
            .start(LongPollingTransport::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(errors.load(Ordering::SeqCst), 1, "error hook fires exactly once");
        assert_eq!(
            requester.requested_endpoints(),
            ["negotiate", "connect", "poll", "reconnect", "poll"],
            "retry after the fixed delay goes to the reconnect endpoint"
        );
        assert_eq!(
            reconnects.load(Ordering::SeqCst),
            1,
            "exactly one reconnected event despite the racing timer"
        );
        connection.stop(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_benign_disconnect_retries_without_error_hook() {
        let requester = ScriptedRequester::new(vec![
            Ok(negotiation_body()),
            Ok(envelope_body(1, vec![])),
            Err(TransportError::ConnectionLost("proxy closed".to_string())),
            Ok(envelope_body(1, vec![])),
        ]);
        let errors = Arc::new(AtomicUsize::new(0));
        let hooks = {
            let errors = Arc::clone(&errors);
            TransportHooks::new().on_error(move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            })
        };
        let connection = Connection::new("http://host/wire", requester.clone(), hooks, timings());

        connection
            .start(LongPollingTransport::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert!(
            requester
                .requested_endpoints()
                .contains(&"reconnect".to_string())
        );
        connection.stop(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_reconnect_race_announces_once() {
        let connection = Connection::new(
            "http://host/wire",
            ScriptedRequester::new(vec![]),
            {
                let count = Arc::new(AtomicUsize::new(0));
                let counter = Arc::clone(&count);
                TransportHooks::new().on_reconnected(move || {
                    assert_eq!(counter.fetch_add(1, Ordering::SeqCst), 0);
                })
            },
            timings(),
        );
        connection.change_state(ConnectionState::Disconnected, ConnectionState::Reconnecting);

        let flag = AtomicBool::new(false);
        announce_reconnected(&connection, &flag);
        announce_reconnected(&connection, &flag);
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_deliberate_stop_is_silent() {
        let requester = ScriptedRequester::new(vec![
            Ok(negotiation_body()),
            Ok(envelope_body(1, vec![])),
        ]);
        let errors = Arc::new(AtomicUsize::new(0));
        let hooks = {
            let errors = Arc::clone(&errors);
            TransportHooks::new().on_error(move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            })
        };
        let connection = Connection::new("http://host/wire", requester, hooks, timings());

        connection
            .start(LongPollingTransport::new())
            .await
            .unwrap();
        connection.stop(Duration::from_millis(50)).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}

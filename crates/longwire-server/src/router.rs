//! The transport host: per-connection endpoints and the axum router.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Form, FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use dashmap::DashMap;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use longwire_core::source::ChannelMessageSource;
use longwire_core::{
    ConnectionTimings, MessageSource, NegotiationResponse, TransportError, TransportResult,
};

use crate::connection::{ConnectionEvents, ServerConnection};
use crate::forever::{ForeverTransport, LoopEntry};
use crate::forever_frame::ForeverFrameTransport;
use crate::heartbeat::{TrackedConnection, TransportHeartbeat};
use crate::long_polling::LongPollingTransport;
use crate::request::{RequestKind, TransportRequest};
use crate::server_sent_events::ServerSentEventsTransport;
use crate::websocket::WebSocketTransport;

/// Everything the host keeps per logical connection.
#[derive(Debug)]
pub struct ConnectionEndpoint {
    /// Stable identifier for the logical connection.
    pub connection_id: String,
    /// Token presented on every request for this connection.
    pub token: String,
    /// The message source feeding this connection's receive loops.
    pub source: Arc<ChannelMessageSource>,
    /// The connection handle shared with the liveness tracker.
    pub connection: Arc<ServerConnection>,
}

/// Removes host bookkeeping when a connection ends, then delegates to the
/// consumer's event sink.
struct HostEvents {
    inner: Arc<dyn ConnectionEvents>,
    endpoints: Arc<DashMap<String, Arc<ConnectionEndpoint>>>,
    tokens_by_id: Arc<DashMap<String, String>>,
}

impl fmt::Debug for HostEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostEvents")
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

#[async_trait]
impl ConnectionEvents for HostEvents {
    async fn connected(&self, connection_id: &str) {
        self.inner.connected(connection_id).await;
    }

    async fn reconnected(&self, connection_id: &str) {
        self.inner.reconnected(connection_id).await;
    }

    async fn disconnected(&self, connection_id: &str) {
        if let Some((_, token)) = self.tokens_by_id.remove(connection_id) {
            self.endpoints.remove(&token);
        }
        self.inner.disconnected(connection_id).await;
    }

    async fn received(&self, connection_id: &str, data: serde_json::Value) {
        self.inner.received(connection_id, data).await;
    }
}

/// Owns the connection registry, the liveness tracker, and the HTTP wiring.
pub struct TransportHost {
    timings: ConnectionTimings,
    heartbeat: Arc<TransportHeartbeat>,
    endpoints: Arc<DashMap<String, Arc<ConnectionEndpoint>>>,
    tokens_by_id: Arc<DashMap<String, String>>,
    events: Arc<HostEvents>,
    shutdown: CancellationToken,
    try_web_sockets: bool,
    debug_frames: bool,
}

impl TransportHost {
    /// Creates a host delivering connection events to `events`.
    #[must_use]
    pub fn new(timings: ConnectionTimings, events: Arc<dyn ConnectionEvents>) -> Arc<Self> {
        let endpoints = Arc::new(DashMap::new());
        let tokens_by_id = Arc::new(DashMap::new());
        let events = Arc::new(HostEvents {
            inner: events,
            endpoints: Arc::clone(&endpoints),
            tokens_by_id: Arc::clone(&tokens_by_id),
        });

        Arc::new(Self {
            heartbeat: TransportHeartbeat::new(timings.clone()),
            timings,
            endpoints,
            tokens_by_id,
            events,
            shutdown: CancellationToken::new(),
            try_web_sockets: true,
            debug_frames: false,
        })
    }

    /// The liveness tracker owned by this host.
    #[must_use]
    pub fn heartbeat(&self) -> &Arc<TransportHeartbeat> {
        &self.heartbeat
    }

    /// The token that stops every receive loop on host shutdown.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts the recurring liveness sweep.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.heartbeat.start(self.shutdown.child_token())
    }

    /// Signals every receive loop and the sweep to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Creates a fresh connection and returns its negotiation payload.
    #[must_use]
    pub fn negotiate(&self) -> NegotiationResponse {
        let response = NegotiationResponse::new(&self.timings, self.try_web_sockets);

        let source = ChannelMessageSource::new();
        let connection = ServerConnection::new(
            response.connection_id.clone(),
            self.timings.disconnect_threshold,
            self.shutdown.child_token(),
            Arc::clone(&source),
            Arc::clone(&self.events) as Arc<dyn ConnectionEvents>,
        );

        let endpoint = Arc::new(ConnectionEndpoint {
            connection_id: response.connection_id.clone(),
            token: response.connection_token.clone(),
            source,
            connection,
        });

        self.tokens_by_id
            .insert(endpoint.connection_id.clone(), endpoint.token.clone());
        self.endpoints
            .insert(endpoint.token.clone(), endpoint);
        debug!(connection_id = %response.connection_id, "connection negotiated");
        response
    }

    /// Looks up the endpoint for a connection token.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ProtocolError`] for an unknown token.
    pub fn endpoint(&self, token: &str) -> TransportResult<Arc<ConnectionEndpoint>> {
        self.endpoints
            .get(token)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| TransportError::ProtocolError("unknown connection token".to_string()))
    }

    /// Queues a message for the connection identified by `token`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ProtocolError`] for an unknown token.
    pub fn publish(&self, token: &str, message: serde_json::Value) -> TransportResult<()> {
        self.endpoint(token)?.source.publish(message);
        Ok(())
    }

    /// Queues a message for the connection identified by its id.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ProtocolError`] for an unknown id.
    pub fn publish_to_connection(
        &self,
        connection_id: &str,
        message: serde_json::Value,
    ) -> TransportResult<()> {
        let token = self
            .tokens_by_id
            .get(connection_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| {
                TransportError::ProtocolError("unknown connection id".to_string())
            })?;
        self.publish(&token, message)
    }

    /// Tears down the connection identified by `token`.
    ///
    /// The abort flag flows through the envelope stream when a receive loop
    /// is active; otherwise the disconnect fires here. Either way the hook
    /// runs at most once.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ProtocolError`] for an unknown token.
    pub async fn abort(&self, token: &str) -> TransportResult<()> {
        let endpoint = self.endpoint(token)?;
        endpoint.source.abort();
        if !endpoint.connection.is_alive() {
            endpoint.connection.disconnect().await?;
        }
        self.heartbeat.remove_connection(&endpoint.connection_id);
        Ok(())
    }

    /// Assembles the shared receive-loop skeleton for one endpoint.
    fn forever_for(&self, endpoint: &Arc<ConnectionEndpoint>) -> ForeverTransport {
        ForeverTransport::new(
            Arc::clone(&endpoint.connection),
            Arc::clone(&endpoint.source) as Arc<dyn MessageSource>,
            Arc::clone(&self.heartbeat),
            Arc::clone(&self.events) as Arc<dyn ConnectionEvents>,
        )
    }

    /// Builds the axum router exposing the transport endpoints.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/negotiate", get(negotiate_handler).post(negotiate_handler))
            .route(
                "/connect",
                get(connect_handler).post(connect_handler),
            )
            .route(
                "/reconnect",
                get(reconnect_handler).post(reconnect_handler),
            )
            .route("/poll", post(poll_handler))
            .route("/send", post(send_handler))
            .route("/abort", post(abort_handler))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(Arc::clone(self))
    }

    /// Binds and serves until the shutdown token fires.
    ///
    /// # Errors
    ///
    /// Returns the bind or serve failure.
    pub async fn serve(self: Arc<Self>, bind_addr: &str) -> TransportResult<()> {
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| TransportError::ConfigurationError(format!("bind failed: {e}")))?;

        self.start();
        let app = self.router();
        let shutdown = self.shutdown.clone();

        info!("Longwire transport host ready");
        info!("   Listening: {bind_addr}");
        info!("   Endpoints: /negotiate /connect /reconnect /poll /send /abort");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| TransportError::Io(e.to_string()))
    }
}

impl fmt::Debug for TransportHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHost")
            .field("connections", &self.endpoints.len())
            .field("timings", &self.timings)
            .finish()
    }
}

/// Form body of a `send` request.
#[derive(Debug, Deserialize)]
struct SendForm {
    data: String,
}

fn error_response(err: &TransportError) -> Response {
    let status = match err {
        TransportError::ProtocolError(_) | TransportError::SerializationFailed(_) => {
            StatusCode::BAD_REQUEST
        }
        TransportError::Cancelled | TransportError::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

async fn negotiate_handler(State(host): State<Arc<TransportHost>>) -> Json<NegotiationResponse> {
    Json(host.negotiate())
}

/// Optional WebSocket-upgrade extractor.
///
/// Replicates the `Option<WebSocketUpgrade>` extractor behaviour from earlier
/// axum releases: `Some` when the request is a WebSocket upgrade, `None`
/// otherwise (axum 0.8 dropped the blanket `Option<FromRequestParts>` impl).
struct OptionalUpgrade(Option<WebSocketUpgrade>);

impl<S> FromRequestParts<S> for OptionalUpgrade
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            WebSocketUpgrade::from_request_parts(parts, state)
                .await
                .ok(),
        ))
    }
}

async fn connect_handler(
    state: State<Arc<TransportHost>>,
    ws: OptionalUpgrade,
    query: Query<HashMap<String, String>>,
) -> Response {
    receive_handler(state, ws.0, query, "connect").await
}

async fn reconnect_handler(
    state: State<Arc<TransportHost>>,
    ws: OptionalUpgrade,
    query: Query<HashMap<String, String>>,
) -> Response {
    receive_handler(state, ws.0, query, "reconnect").await
}

async fn poll_handler(
    state: State<Arc<TransportHost>>,
    ws: OptionalUpgrade,
    query: Query<HashMap<String, String>>,
) -> Response {
    receive_handler(state, ws.0, query, "poll").await
}

async fn receive_handler(
    State(host): State<Arc<TransportHost>>,
    ws: Option<WebSocketUpgrade>,
    Query(params): Query<HashMap<String, String>>,
    endpoint_name: &'static str,
) -> Response {
    let request = match TransportRequest::classify(endpoint_name, &params) {
        Ok(request) => request,
        Err(err) => return error_response(&err),
    };
    let endpoint = match host.endpoint(&request.connection_token) {
        Ok(endpoint) => endpoint,
        Err(err) => return error_response(&err),
    };

    let entry = if request.kind == RequestKind::Reconnect || request.message_id.is_some() {
        LoopEntry::Reconnect
    } else {
        LoopEntry::Connect
    };
    let cancel = host.shutdown.child_token();
    let forever = host.forever_for(&endpoint);

    match request.transport.as_str() {
        "longPolling" => {
            let transport = LongPollingTransport::new(forever, host.timings.long_poll_delay);
            match transport.process_request(&request, cancel).await {
                Ok(envelope) => Json(envelope).into_response(),
                Err(err) => error_response(&err),
            }
        }
        "serverSentEvents" => ServerSentEventsTransport::new(
            Arc::new(forever),
            host.timings.keep_alive_interval,
        )
        .into_response(entry, request.message_id, cancel),
        "foreverFrame" => {
            let Some(frame_id) = request.frame_id.clone() else {
                return error_response(&TransportError::ProtocolError(
                    "forever frame requires a frameId parameter".to_string(),
                ));
            };
            ForeverFrameTransport::new(Arc::new(forever), host.debug_frames).into_response(
                &frame_id,
                entry,
                request.message_id,
                cancel,
            )
        }
        "webSockets" => match ws {
            Some(upgrade) => {
                let transport = WebSocketTransport::new(
                    Arc::new(forever),
                    Arc::clone(&host.heartbeat),
                    Arc::clone(&host.events) as Arc<dyn ConnectionEvents>,
                );
                let cursor = request.message_id;
                upgrade.on_upgrade(move |socket| async move {
                    transport.serve(socket, entry, cursor, cancel).await;
                })
            }
            None => error_response(&TransportError::ProtocolError(
                "webSockets transport requires an upgrade request".to_string(),
            )),
        },
        other => error_response(&TransportError::ProtocolError(format!(
            "unknown transport {other:?}"
        ))),
    }
}

async fn send_handler(
    State(host): State<Arc<TransportHost>>,
    Query(params): Query<HashMap<String, String>>,
    Form(form): Form<SendForm>,
) -> Response {
    let request = match TransportRequest::classify("send", &params) {
        Ok(request) => request,
        Err(err) => return error_response(&err),
    };
    let endpoint = match host.endpoint(&request.connection_token) {
        Ok(endpoint) => endpoint,
        Err(err) => return error_response(&err),
    };

    let value = serde_json::from_str(&form.data)
        .unwrap_or_else(|_| serde_json::Value::String(form.data.clone()));
    host.events
        .received(&endpoint.connection_id, value)
        .await;
    Json(serde_json::json!({})).into_response()
}

async fn abort_handler(
    State(host): State<Arc<TransportHost>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let request = match TransportRequest::classify("abort", &params) {
        Ok(request) => request,
        Err(err) => return error_response(&err),
    };

    match host.abort(&request.connection_token).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            warn!(error = %err, "abort failed");
            error_response(&err)
        }
    }
}

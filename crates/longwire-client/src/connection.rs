//! Client-side connection state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use longwire_core::{
    ConnectionTimings, Cursor, KeepAliveData, NegotiationResponse, TransportError, TransportHooks,
    TransportResult,
};

use crate::abort::AbortCoordinator;
use crate::http::{self, HttpRequester};
use crate::keep_alive;
use crate::transport::ClientTransport;

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport is running.
    Disconnected,
    /// Negotiation or the first handshake is in flight.
    Connecting,
    /// A transport is committed and its channel is up.
    Connected,
    /// The channel dropped; a transport is re-establishing it.
    Reconnecting,
}

/// One logical connection from the consumer side.
///
/// Holds the negotiated identity, the last cursor, the group token, and the
/// hook set transports deliver into. Transports receive the connection by
/// reference on every call and keep no per-connection state of their own.
pub struct Connection {
    base_url: String,
    connection_data: Option<String>,
    requester: Arc<dyn HttpRequester>,
    hooks: TransportHooks,
    timings: ConnectionTimings,
    state: Mutex<ConnectionState>,
    negotiation: Mutex<Option<NegotiationResponse>>,
    cursor: Mutex<Option<Cursor>>,
    groups_token: Mutex<Option<String>>,
    keep_alive: Mutex<Option<KeepAliveData>>,
    transport: Mutex<Option<Arc<dyn ClientTransport>>>,
    abort: AbortCoordinator,
    stop_token: CancellationToken,
}

impl Connection {
    /// Creates a connection against `base_url`.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        requester: Arc<dyn HttpRequester>,
        hooks: TransportHooks,
        timings: ConnectionTimings,
    ) -> Arc<Self> {
        Arc::new(Self {
            base_url: base_url.into(),
            connection_data: None,
            requester,
            hooks,
            timings,
            state: Mutex::new(ConnectionState::Disconnected),
            negotiation: Mutex::new(None),
            cursor: Mutex::new(None),
            groups_token: Mutex::new(None),
            keep_alive: Mutex::new(None),
            transport: Mutex::new(None),
            abort: AbortCoordinator::new(),
            stop_token: CancellationToken::new(),
        })
    }

    /// Negotiates and starts `transport`, committing to it on success.
    ///
    /// # Errors
    ///
    /// A failed negotiation or handshake is reported here exactly once; the
    /// connection returns to `Disconnected` and nothing retries.
    pub async fn start(
        self: &Arc<Self>,
        transport: Arc<dyn ClientTransport>,
    ) -> TransportResult<()> {
        if !self.change_state(ConnectionState::Disconnected, ConnectionState::Connecting) {
            return Err(TransportError::StartFailed(
                "connection is already started".to_string(),
            ));
        }

        match self.start_inner(&transport).await {
            Ok(()) => {
                *self.transport.lock() = Some(Arc::clone(&transport));
                self.change_state(ConnectionState::Connecting, ConnectionState::Connected);
                self.hooks.connected();

                if transport.supports_keep_alive() {
                    if let Some(data) = self.keep_alive.lock().clone() {
                        keep_alive::spawn_monitor(
                            Arc::clone(self),
                            Arc::clone(&transport),
                            data.check_interval(),
                        );
                    }
                }
                info!(transport = transport.name(), "connection started");
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    async fn start_inner(
        self: &Arc<Self>,
        transport: &Arc<dyn ClientTransport>,
    ) -> TransportResult<()> {
        let url = http::negotiate_url(&self.base_url, self.connection_data.as_deref())?;
        let body = self.requester.post(&url, None).await?;
        let negotiation: NegotiationResponse = serde_json::from_str(&body)?;

        if let Some(secs) = negotiation.keep_alive_timeout {
            *self.keep_alive.lock() = Some(KeepAliveData::new(Duration::from_secs_f64(secs)));
        }
        debug!(connection_id = %negotiation.connection_id, "negotiation complete");
        *self.negotiation.lock() = Some(negotiation);

        transport.start(self).await
    }

    /// Sends one payload through the committed transport.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SendFailed`] when no transport is committed,
    /// or the transport's own failure.
    pub async fn send(self: &Arc<Self>, payload: serde_json::Value) -> TransportResult<()> {
        let transport = self.transport.lock().clone().ok_or_else(|| {
            TransportError::SendFailed("connection has no committed transport".to_string())
        })?;
        transport.send(self, payload).await
    }

    /// Stops the connection: deliberate, never surfaced as an error.
    ///
    /// Cancels every loop, issues the idempotent abort request, and fires
    /// the disconnected hook.
    pub async fn stop(self: &Arc<Self>, timeout: Duration) {
        self.stop_token.cancel();
        if let Some(transport) = self.transport.lock().clone() {
            transport.abort(self, timeout).await;
        }
        self.disconnect_locally();
    }

    /// Marks the connection disconnected and fires the hook once.
    pub fn disconnect_locally(&self) {
        let was = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, ConnectionState::Disconnected)
        };
        if was != ConnectionState::Disconnected {
            self.stop_token.cancel();
            self.hooks.disconnected();
        }
    }

    /// Issues the teardown request through the abort coordinator.
    pub(crate) async fn abort_request(&self, transport_name: &str, timeout: Duration) -> bool {
        let Some(token) = self.connection_token() else {
            self.abort.dispose();
            return true;
        };
        let url = http::control_url(
            &self.base_url,
            "abort",
            transport_name,
            &token,
            self.connection_data.as_deref(),
        );
        match url {
            Ok(url) => {
                let requester = Arc::clone(&self.requester);
                self.abort
                    .abort(|| async move { requester.post(&url, None).await.map(|_| ()) }, timeout)
                    .await
            }
            Err(_) => {
                self.abort.dispose();
                true
            }
        }
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Guarded transition; returns `true` if the swap happened.
    pub fn change_state(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn set_state(&self, to: ConnectionState) {
        *self.state.lock() = to;
    }

    /// Returns `true` while the consumer has not stopped the connection.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.stop_token.is_cancelled() && self.state() != ConnectionState::Disconnected
    }

    /// Token cancelled when the consumer deliberately stops the connection.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop_token.clone()
    }

    /// The hook set transports deliver into.
    #[must_use]
    pub fn hooks(&self) -> &TransportHooks {
        &self.hooks
    }

    /// The timing contract for retry delays and handshake timeouts.
    #[must_use]
    pub fn timings(&self) -> &ConnectionTimings {
        &self.timings
    }

    /// The injected HTTP seam.
    #[must_use]
    pub fn requester(&self) -> &Arc<dyn HttpRequester> {
        &self.requester
    }

    /// Base URL the endpoints are joined onto.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Opaque connection-initialization payload, if any.
    #[must_use]
    pub fn connection_data(&self) -> Option<&str> {
        self.connection_data.as_deref()
    }

    /// The negotiated connection token, once negotiation completed.
    #[must_use]
    pub fn connection_token(&self) -> Option<String> {
        self.negotiation
            .lock()
            .as_ref()
            .map(|n| n.connection_token.clone())
    }

    /// The last cursor observed on this connection.
    #[must_use]
    pub fn cursor(&self) -> Option<Cursor> {
        *self.cursor.lock()
    }

    /// Advances the cursor, never letting it regress.
    pub fn advance_cursor(&self, cursor: Cursor) {
        let mut slot = self.cursor.lock();
        *slot = Some(slot.map_or(cursor, |c| c.advanced_to(cursor)));
    }

    /// The group-membership token to echo on receive requests.
    #[must_use]
    pub fn groups_token(&self) -> Option<String> {
        self.groups_token.lock().clone()
    }

    /// Replaces the group-membership token.
    pub fn set_groups_token(&self, token: impl Into<String>) {
        *self.groups_token.lock() = Some(token.into());
    }

    /// Records keep-alive traffic for the monitor.
    pub fn mark_keep_alive(&self) {
        if let Some(data) = self.keep_alive.lock().as_mut() {
            data.mark();
        }
    }

    /// Runs `f` against the keep-alive descriptor, if keep-alive is on.
    pub(crate) fn with_keep_alive<R>(&self, f: impl FnOnce(&mut KeepAliveData) -> R) -> Option<R> {
        self.keep_alive.lock().as_mut().map(f)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("base_url", &self.base_url)
            .field("state", &self.state())
            .field("cursor", &self.cursor())
            .finish()
    }
}

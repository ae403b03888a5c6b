//! Inbound request classification.

use std::collections::HashMap;

use longwire_core::{Cursor, TransportError, TransportResult};

/// What an inbound request asks the transport layer to do.
///
/// `Send` and `Abort` short-circuit: they deliver a posted payload to the
/// consumer or tear the connection down, and never enter the receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// First-time handshake; no prior cursor.
    Connect,
    /// Re-establishing a channel for a connection that has a cursor.
    Reconnect,
    /// An ongoing receive iteration (long polling).
    Poll,
    /// A payload posted by the client for the consumer.
    Send,
    /// A teardown request.
    Abort,
}

/// A classified transport request with its common query parameters.
///
/// Query parameters are order-insensitive; unknown parameters are ignored.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// What the request asks for.
    pub kind: RequestKind,
    /// Wire encoding name (`longPolling`, `serverSentEvents`,
    /// `foreverFrame`, `webSockets`).
    pub transport: String,
    /// Token identifying the logical connection.
    pub connection_token: String,
    /// Protocol version the client speaks.
    pub client_protocol: Option<String>,
    /// Opaque connection-initialization payload.
    pub connection_data: Option<String>,
    /// Last cursor the client observed, when resuming.
    pub message_id: Option<Cursor>,
    /// Group-membership token echoed on receive endpoints.
    pub groups_token: Option<String>,
    /// Frame identifier, present only for forever-frame requests.
    pub frame_id: Option<String>,
}

impl TransportRequest {
    /// Classifies a request from its endpoint name and query parameters.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ProtocolError`] for an unknown endpoint, a
    /// missing connection token or transport name, or an unparsable
    /// `messageId`.
    pub fn classify(
        endpoint: &str,
        params: &HashMap<String, String>,
    ) -> TransportResult<Self> {
        let kind = match endpoint {
            "connect" => RequestKind::Connect,
            "reconnect" => RequestKind::Reconnect,
            "poll" => RequestKind::Poll,
            "send" => RequestKind::Send,
            "abort" => RequestKind::Abort,
            other => {
                return Err(TransportError::ProtocolError(format!(
                    "unknown endpoint {other:?}"
                )));
            }
        };

        let transport = params
            .get("transport")
            .filter(|t| !t.is_empty())
            .cloned()
            .ok_or_else(|| {
                TransportError::ProtocolError("missing transport parameter".to_string())
            })?;

        let connection_token = params
            .get("connectionToken")
            .filter(|t| !t.is_empty())
            .cloned()
            .ok_or_else(|| {
                TransportError::ProtocolError("missing connectionToken parameter".to_string())
            })?;

        let message_id = params
            .get("messageId")
            .filter(|m| !m.is_empty())
            .map(|m| m.parse::<Cursor>())
            .transpose()?;

        Ok(Self {
            kind,
            transport,
            connection_token,
            client_protocol: params.get("clientProtocol").cloned(),
            connection_data: params.get("connectionData").cloned(),
            message_id,
            groups_token: params.get("groupsToken").cloned(),
            frame_id: params.get("frameId").cloned(),
        })
    }

    /// Returns `true` for requests that bypass the receive loop.
    #[must_use]
    pub const fn short_circuits(&self) -> bool {
        matches!(self.kind, RequestKind::Send | RequestKind::Abort)
    }
}

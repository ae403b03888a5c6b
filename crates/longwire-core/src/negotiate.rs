//! Negotiation payload exchanged before a transport is chosen.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConnectionTimings;

/// Protocol version this implementation speaks.
pub const PROTOCOL_VERSION: &str = "1.5";

/// The response to a `negotiate` request.
///
/// Carries the identifiers and timing contract a client needs before it
/// attempts any transport: the connection token echoed on every subsequent
/// request, the keep-alive and disconnect windows, and whether the server is
/// willing to try native sockets at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationResponse {
    /// Stable identifier for the logical connection.
    pub connection_id: String,

    /// Opaque token presented on every subsequent request.
    pub connection_token: String,

    /// Protocol version the server speaks.
    pub protocol_version: String,

    /// Whether the client may try the native socket transport.
    pub try_web_sockets: bool,

    /// Keep-alive interval in seconds, absent when keep-alives are disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_timeout: Option<f64>,

    /// Seconds a silent connection is kept before being disconnected.
    pub disconnect_timeout: f64,

    /// Seconds a transport has to complete its handshake.
    pub transport_connect_timeout: f64,

    /// Seconds a long-polling client waits between polls.
    pub long_poll_delay: f64,
}

impl NegotiationResponse {
    /// Creates a response for a fresh connection under the given timings.
    #[must_use]
    pub fn new(timings: &ConnectionTimings, try_web_sockets: bool) -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            connection_token: Uuid::new_v4().to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            try_web_sockets,
            keep_alive_timeout: timings.keep_alive_interval.map(|d| d.as_secs_f64()),
            disconnect_timeout: timings.disconnect_threshold.as_secs_f64(),
            transport_connect_timeout: timings.transport_connect_timeout.as_secs_f64(),
            long_poll_delay: timings.long_poll_delay.as_secs_f64(),
        }
    }
}

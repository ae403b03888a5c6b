//! The per-iteration delivery unit produced by the cursor protocol.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;

/// One delivery unit returned by [`MessageSource::receive`].
///
/// An envelope carries zero or more messages in server emission order plus
/// the control flags that drive the receive loop's continuation decision.
/// It is produced once per loop iteration and consumed exactly once by the
/// owning transport.
///
/// [`MessageSource::receive`]: crate::source::MessageSource::receive
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Position of the log after the messages in this envelope.
    pub cursor: Cursor,

    /// Messages in server emission order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<serde_json::Value>,

    /// The connection has been told to disconnect; the loop stops without
    /// firing the disconnect hook (cleanup happens elsewhere).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disconnect: bool,

    /// The server-side reconnection window expired; the client should
    /// re-establish a fresh channel.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,

    /// The connection was aborted by the client; the loop stops and fires
    /// the disconnect hook exactly once.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,

    /// Updated group-membership token, echoed back on subsequent receives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups_token: Option<String>,

    /// Hint telling a long-polling client how long to wait before its next
    /// poll, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_poll_delay_ms: Option<u64>,
}

impl Envelope {
    /// Creates an empty envelope at the given cursor.
    #[must_use]
    pub fn at(cursor: Cursor) -> Self {
        Self {
            cursor,
            ..Self::default()
        }
    }

    /// Attaches messages, preserving their order.
    #[must_use]
    pub fn with_messages(mut self, messages: Vec<serde_json::Value>) -> Self {
        self.messages = messages;
        self
    }

    /// Marks the envelope as a disconnect command.
    #[must_use]
    pub const fn disconnecting(mut self) -> Self {
        self.disconnect = true;
        self
    }

    /// Marks the envelope as a reconnection-window expiry.
    #[must_use]
    pub const fn timed_out(mut self) -> Self {
        self.timed_out = true;
        self
    }

    /// Marks the envelope as the result of a client abort.
    #[must_use]
    pub const fn aborted(mut self) -> Self {
        self.aborted = true;
        self
    }

    /// Attaches an updated group-membership token.
    #[must_use]
    pub fn with_groups_token(mut self, token: impl Into<String>) -> Self {
        self.groups_token = Some(token.into());
        self
    }

    /// Attaches a long-poll delay hint.
    #[must_use]
    pub const fn with_long_poll_delay(mut self, delay: Duration) -> Self {
        self.long_poll_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    /// Returns `true` if the receive loop must stop after emitting this
    /// envelope.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.disconnect || self.timed_out || self.aborted
    }

    /// The long-poll delay hint as a [`Duration`], if present.
    #[must_use]
    pub fn long_poll_delay(&self) -> Option<Duration> {
        self.long_poll_delay_ms.map(Duration::from_millis)
    }
}

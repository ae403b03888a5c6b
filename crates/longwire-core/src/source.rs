//! The cursor protocol: the seam between transports and the messaging layer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::cursor::Cursor;
use crate::envelope::Envelope;
use crate::error::{TransportError, TransportResult};

/// A source of ordered, cursor-addressable envelopes for one connection.
///
/// Every server transport drives its receive loop through this trait: pass
/// the last-seen cursor (or `None` on first connect) and a cancellation
/// signal tied to host shutdown, get back the next [`Envelope`]. The call
/// suspends until messages are available, a control flag is raised, or the
/// cancellation signal fires.
///
/// Implementations must return envelopes whose cursors are monotonically
/// non-decreasing for the same connection, with message order preserved
/// within and across envelopes.
///
/// A `None` cursor marks a first-time connect: implementations complete
/// promptly with the current position (the handshake envelope) instead of
/// waiting for traffic, so a connect request is never held open.
#[async_trait]
pub trait MessageSource: Send + Sync + fmt::Debug {
    /// Pulls the next envelope after `cursor`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Cancelled`] when `cancel` fires before an
    /// envelope becomes available; other variants propagate faults from the
    /// underlying messaging layer.
    async fn receive(
        &self,
        cursor: Option<Cursor>,
        cancel: CancellationToken,
    ) -> TransportResult<Envelope>;
}

#[derive(Debug, Default)]
struct SourceState {
    log: Vec<serde_json::Value>,
    groups_token: Option<String>,
    disconnect: bool,
    timed_out: bool,
    aborted: bool,
}

/// An in-memory [`MessageSource`] backed by an append-only log.
///
/// This is the reference implementation used by the server host to back each
/// connection, and by tests to script envelope sequences. The cursor is the
/// log length after the delivered messages.
#[derive(Debug, Default)]
pub struct ChannelMessageSource {
    state: Mutex<SourceState>,
    notify: Notify,
}

impl ChannelMessageSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends a message to the log and wakes any pending receive.
    pub fn publish(&self, message: serde_json::Value) {
        self.state.lock().log.push(message);
        self.notify.notify_waiters();
    }

    /// Replaces the group-membership token delivered with the next envelope.
    pub fn set_groups_token(&self, token: impl Into<String>) {
        self.state.lock().groups_token = Some(token.into());
        self.notify.notify_waiters();
    }

    /// Raises the disconnect flag; the next receive returns a terminal
    /// envelope.
    pub fn disconnect(&self) {
        self.state.lock().disconnect = true;
        self.notify.notify_waiters();
    }

    /// Raises the timed-out flag, telling the client to reconnect fresh.
    pub fn time_out(&self) {
        self.state.lock().timed_out = true;
        self.notify.notify_waiters();
    }

    /// Raises the aborted flag in response to a client abort request.
    pub fn abort(&self) {
        self.state.lock().aborted = true;
        self.notify.notify_waiters();
    }

    /// Builds an envelope if anything is deliverable past `since`.
    fn try_build(&self, since: u64) -> Option<Envelope> {
        let state = self.state.lock();
        let len = state.log.len() as u64;

        // Terminal flags outrank pending messages: the loop must observe
        // them even when the log has advanced.
        if state.aborted {
            return Some(Envelope::at(Cursor::new(len.max(since))).aborted());
        }
        if state.disconnect {
            return Some(Envelope::at(Cursor::new(len.max(since))).disconnecting());
        }
        if state.timed_out {
            return Some(Envelope::at(Cursor::new(len.max(since))).timed_out());
        }

        if len > since {
            let messages = state.log[since as usize..].to_vec();
            let mut envelope = Envelope::at(Cursor::new(len)).with_messages(messages);
            envelope.groups_token = state.groups_token.clone();
            return Some(envelope);
        }

        None
    }
}

#[async_trait]
impl MessageSource for ChannelMessageSource {
    async fn receive(
        &self,
        cursor: Option<Cursor>,
        cancel: CancellationToken,
    ) -> TransportResult<Envelope> {
        let Some(cursor) = cursor else {
            // First-time connect: answer immediately with whatever exists
            // so the handshake response is never held open.
            let current = Cursor::new(self.state.lock().log.len() as u64);
            return Ok(self.try_build(0).unwrap_or_else(|| Envelope::at(current)));
        };
        let since = cursor.position();

        loop {
            // Arm the waiter before re-checking state so a publish between
            // the check and the await cannot be lost.
            let notified = self.notify.notified();

            if let Some(envelope) = self.try_build(since) {
                return Ok(envelope);
            }

            tokio::select! {
                () = notified => {}
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_receive_returns_published_messages_in_order() {
        let source = ChannelMessageSource::new();
        source.publish(json!("first"));
        source.publish(json!("second"));

        let envelope = source
            .receive(None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(envelope.cursor, Cursor::new(2));
        assert_eq!(envelope.messages, vec![json!("first"), json!("second")]);
    }

    #[tokio::test]
    async fn test_receive_resumes_after_cursor() {
        let source = ChannelMessageSource::new();
        source.publish(json!(1));
        source.publish(json!(2));
        source.publish(json!(3));

        let envelope = source
            .receive(Some(Cursor::new(2)), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(envelope.messages, vec![json!(3)]);
        assert_eq!(envelope.cursor, Cursor::new(3));
    }

    #[tokio::test]
    async fn test_first_receive_answers_immediately() {
        let source = ChannelMessageSource::new();
        let envelope = source
            .receive(None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(envelope.cursor, Cursor::new(0));
        assert!(envelope.messages.is_empty());
        assert!(!envelope.is_terminal());
    }

    #[tokio::test]
    async fn test_receive_unblocks_on_publish() {
        let source = ChannelMessageSource::new();
        let pending = {
            let source = Arc::clone(&source);
            tokio::spawn(async move {
                source
                    .receive(Some(Cursor::new(0)), CancellationToken::new())
                    .await
            })
        };

        tokio::task::yield_now().await;
        source.publish(json!("late"));

        let envelope = pending.await.unwrap().unwrap();
        assert_eq!(envelope.messages, vec![json!("late")]);
    }

    #[tokio::test]
    async fn test_receive_cancels_promptly() {
        let source = ChannelMessageSource::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = source.receive(Some(Cursor::new(0)), cancel).await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }

    #[tokio::test]
    async fn test_abort_outranks_pending_messages() {
        let source = ChannelMessageSource::new();
        source.publish(json!("pending"));
        source.abort();

        let envelope = source
            .receive(None, CancellationToken::new())
            .await
            .unwrap();
        assert!(envelope.aborted);
        assert!(envelope.messages.is_empty());
    }

    #[tokio::test]
    async fn test_cursors_non_decreasing_across_envelopes() {
        let source = ChannelMessageSource::new();
        let cancel = CancellationToken::new();
        let mut cursor = None;

        for round in 0..3 {
            source.publish(json!(round));
            let envelope = source.receive(cursor, cancel.clone()).await.unwrap();
            if let Some(previous) = cursor {
                assert!(envelope.cursor >= previous);
            }
            cursor = Some(envelope.cursor);
        }
        assert_eq!(cursor, Some(Cursor::new(3)));
    }
}

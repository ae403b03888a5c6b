//! The server-side connection handle and its event seam.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use longwire_core::TransportResult;
use longwire_core::source::ChannelMessageSource;

use crate::heartbeat::TrackedConnection;

/// Hooks the messaging layer implements to observe one connection.
///
/// The `connected`/`reconnected` hooks may run user code of arbitrary
/// duration; the receive-loop skeleton runs them concurrently with the first
/// receive and completes when both finish.
#[async_trait]
pub trait ConnectionEvents: Send + Sync + fmt::Debug {
    /// A first-time handshake completed.
    async fn connected(&self, connection_id: &str) {
        let _ = connection_id;
    }

    /// An existing connection re-established its channel.
    async fn reconnected(&self, connection_id: &str) {
        let _ = connection_id;
    }

    /// The connection ended; fired at most once per connection.
    async fn disconnected(&self, connection_id: &str) {
        let _ = connection_id;
    }

    /// A payload posted by the client arrived.
    async fn received(&self, connection_id: &str, data: serde_json::Value) {
        let _ = (connection_id, data);
    }
}

/// An event sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

#[async_trait]
impl ConnectionEvents for NoopEvents {}

/// One logical client session, owned by the server transport serving it.
///
/// `is_alive` reflects whether the transport channel is currently writable;
/// it flaps during long-polling gaps without the session being dead. The
/// liveness tracker references the handle by connection-id equality, never
/// by identity.
pub struct ServerConnection {
    id: String,
    alive: AtomicBool,
    timed_out: AtomicBool,
    disconnect_threshold: Duration,
    disconnect_fired: AtomicBool,
    cancel: CancellationToken,
    source: Arc<ChannelMessageSource>,
    events: Arc<dyn ConnectionEvents>,
}

impl ServerConnection {
    /// Creates a handle for the given connection id.
    ///
    /// `cancel` is a child of the host shutdown token; cancelling it
    /// unblocks any in-flight receive for this connection only.
    pub fn new(
        id: impl Into<String>,
        disconnect_threshold: Duration,
        cancel: CancellationToken,
        source: Arc<ChannelMessageSource>,
        events: Arc<dyn ConnectionEvents>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            alive: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            disconnect_threshold,
            disconnect_fired: AtomicBool::new(false),
            cancel,
            source,
            events,
        })
    }

    /// The message source backing this connection.
    #[must_use]
    pub fn source(&self) -> &Arc<ChannelMessageSource> {
        &self.source
    }

    /// The cancellation token scoped to this connection.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Marks the transport channel writable.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Marks the transport channel not writable (e.g. a long-polling gap).
    pub fn mark_inactive(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Claims the right to fire the disconnect hook.
    ///
    /// Returns `true` for exactly one caller over the connection's lifetime.
    pub fn try_fire_disconnect(&self) -> bool {
        self.disconnect_fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id)
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .field("timed_out", &self.timed_out.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl TrackedConnection for ServerConnection {
    fn connection_id(&self) -> &str {
        &self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    fn set_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
        // Surface the expiry through the envelope stream so the owning
        // transport emits it and stops.
        self.source.time_out();
    }

    fn disconnect_threshold(&self) -> Duration {
        self.disconnect_threshold
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if !self.try_fire_disconnect() {
            return Ok(());
        }
        self.mark_inactive();
        // A pending pull observes the terminal envelope rather than an
        // abrupt cancellation.
        self.source.disconnect();
        self.events.disconnected(&self.id).await;
        Ok(())
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use longwire_core::MessageSource;

    fn test_connection() -> Arc<ServerConnection> {
        ServerConnection::new(
            "c1",
            Duration::from_secs(5),
            CancellationToken::new(),
            ChannelMessageSource::new(),
            Arc::new(NoopEvents),
        )
    }

    #[test]
    fn test_alive_flag_flaps() {
        let connection = test_connection();
        assert!(!connection.is_alive());
        connection.mark_alive();
        assert!(connection.is_alive());
        connection.mark_inactive();
        assert!(!connection.is_alive());
    }

    #[test]
    fn test_disconnect_fires_once() {
        let connection = test_connection();
        assert!(connection.try_fire_disconnect());
        assert!(!connection.try_fire_disconnect());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_flags_source() {
        let connection = test_connection();
        connection.disconnect().await.unwrap();
        connection.disconnect().await.unwrap();

        let envelope = connection
            .source()
            .receive(None, CancellationToken::new())
            .await
            .unwrap();
        assert!(envelope.disconnect);
    }

    #[tokio::test]
    async fn test_timed_out_propagates_to_stream() {
        let connection = test_connection();
        connection.set_timed_out();
        assert!(connection.is_timed_out());

        let envelope = connection
            .source()
            .receive(None, CancellationToken::new())
            .await
            .unwrap();
        assert!(envelope.timed_out);
    }
}

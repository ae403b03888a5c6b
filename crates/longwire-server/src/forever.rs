//! The shared receive-loop skeleton every server encoding composes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use longwire_core::{Cursor, Envelope, MessageSource, TransportResult};

use crate::connection::{ConnectionEvents, ServerConnection};
use crate::heartbeat::{TrackedConnection, TransportHeartbeat};

/// How a receive loop is being entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEntry {
    /// First-time handshake: no prior cursor.
    Connect,
    /// Re-establishing the channel for a connection that has a cursor.
    Reconnect,
    /// An ongoing iteration; no lifecycle hook fires.
    Poll,
}

/// Why a loop iteration (or a whole loop) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The envelope was emitted and the loop may continue from this cursor.
    Continue(Cursor),
    /// The client aborted; the disconnect hook has fired.
    Aborted,
    /// The connection was told to disconnect; cleanup happened elsewhere.
    Disconnected,
    /// The reconnection window expired; the client should reconnect fresh.
    TimedOut,
}

impl LoopOutcome {
    /// Returns `true` if the loop must not run another iteration.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Continue(_))
    }
}

/// The wire seam each encoding implements.
///
/// One call per envelope, in pull order; implementations own the framing
/// (JSON body, `id:`/`data:` records, script blocks, socket frames).
#[async_trait]
pub trait WireWriter: Send + Sync {
    /// Emits one envelope in this encoding's framing.
    async fn send_envelope(&self, envelope: &Envelope) -> TransportResult<()>;
}

/// The request-loop skeleton shared by all four server encodings.
///
/// Encodings compose this component rather than inheriting from it: long
/// polling drives [`run_once`] per HTTP request, the streaming encodings
/// drive [`run_until_terminal`] over one persistent channel.
///
/// [`run_once`]: ForeverTransport::run_once
/// [`run_until_terminal`]: ForeverTransport::run_until_terminal
pub struct ForeverTransport {
    connection: Arc<ServerConnection>,
    source: Arc<dyn MessageSource>,
    heartbeat: Arc<TransportHeartbeat>,
    events: Arc<dyn ConnectionEvents>,
}

impl ForeverTransport {
    /// Assembles the skeleton around one connection.
    #[must_use]
    pub fn new(
        connection: Arc<ServerConnection>,
        source: Arc<dyn MessageSource>,
        heartbeat: Arc<TransportHeartbeat>,
        events: Arc<dyn ConnectionEvents>,
    ) -> Self {
        Self {
            connection,
            source,
            heartbeat,
            events,
        }
    }

    /// The connection this skeleton serves.
    #[must_use]
    pub fn connection(&self) -> &Arc<ServerConnection> {
        &self.connection
    }

    /// Runs exactly one loop iteration.
    ///
    /// Registers with the liveness tracker and marks the channel active. On
    /// a `Connect`/`Reconnect` entry the user lifecycle hook runs
    /// *concurrently* with the first receive; the iteration completes only
    /// when both finish. The pulled envelope is emitted through `writer`
    /// before the continuation decision is made.
    ///
    /// # Errors
    ///
    /// A failed pull (fault or cancellation) terminates the iteration and
    /// propagates to the caller without firing the disconnect hook. A failed
    /// emit is returned as the writer's error.
    pub async fn run_once(
        &self,
        writer: &dyn WireWriter,
        entry: LoopEntry,
        cursor: Option<Cursor>,
        cancel: CancellationToken,
    ) -> TransportResult<LoopOutcome> {
        let id = self.connection.connection_id().to_string();

        self.heartbeat
            .add_connection(Arc::clone(&self.connection) as Arc<dyn TrackedConnection>);
        self.connection.mark_alive();
        self.heartbeat.mark_connection(&id);

        let envelope = match entry {
            LoopEntry::Connect => {
                let ((), pulled) = tokio::join!(
                    self.events.connected(&id),
                    self.source.receive(cursor, cancel)
                );
                pulled?
            }
            LoopEntry::Reconnect => {
                let ((), pulled) = tokio::join!(
                    self.events.reconnected(&id),
                    self.source.receive(cursor, cancel)
                );
                pulled?
            }
            LoopEntry::Poll => self.source.receive(cursor, cancel).await?,
        };

        self.emit(writer, &envelope, cursor).await
    }

    /// Runs iterations until a terminal outcome, starting with `entry`.
    ///
    /// This is the persistent-channel variant used by the streaming
    /// encodings; long polling reconstructs the loop by reissuing requests
    /// and calls [`run_once`] instead.
    ///
    /// [`run_once`]: ForeverTransport::run_once
    ///
    /// # Errors
    ///
    /// Propagates the first pull or emit failure.
    pub async fn run_until_terminal(
        &self,
        writer: &dyn WireWriter,
        entry: LoopEntry,
        cursor: Option<Cursor>,
        cancel: CancellationToken,
    ) -> TransportResult<LoopOutcome> {
        let mut outcome = self.run_once(writer, entry, cursor, cancel.clone()).await?;

        while let LoopOutcome::Continue(next) = outcome {
            outcome = self
                .run_once(writer, LoopEntry::Poll, Some(next), cancel.clone())
                .await?;
        }

        Ok(outcome)
    }

    /// Emits one envelope and decides continuation.
    async fn emit(
        &self,
        writer: &dyn WireWriter,
        envelope: &Envelope,
        cursor: Option<Cursor>,
    ) -> TransportResult<LoopOutcome> {
        let id = self.connection.connection_id();
        let next = cursor.map_or(envelope.cursor, |c| c.advanced_to(envelope.cursor));

        writer.send_envelope(envelope).await?;
        self.heartbeat.mark_connection(id);
        trace!(connection_id = %id, cursor = %next, "envelope emitted");

        if envelope.aborted {
            // Exactly one disconnect notification per connection, shared
            // with the tracker's cleanup path.
            if self.connection.try_fire_disconnect() {
                debug!(connection_id = %id, "connection aborted, firing disconnect");
                self.events.disconnected(id).await;
            }
            self.heartbeat.remove_connection(id);
            return Ok(LoopOutcome::Aborted);
        }
        if envelope.disconnect {
            return Ok(LoopOutcome::Disconnected);
        }
        if envelope.timed_out {
            return Ok(LoopOutcome::TimedOut);
        }

        Ok(LoopOutcome::Continue(next))
    }
}

impl fmt::Debug for ForeverTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeverTransport")
            .field("connection", &self.connection)
            .finish()
    }
}

//! The connection liveness tracker.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use longwire_core::{ConnectionTimings, TransportResult};

/// The tracker's view of one connection.
///
/// Implemented by [`ServerConnection`]; the tracker compares entries by
/// connection-id equality only, never by reference identity.
///
/// [`ServerConnection`]: crate::connection::ServerConnection
#[async_trait]
pub trait TrackedConnection: Send + Sync + fmt::Debug {
    /// The id this connection is tracked under.
    fn connection_id(&self) -> &str;

    /// Whether the transport channel is currently writable.
    fn is_alive(&self) -> bool;

    /// Whether the connection has already been forced to time out.
    fn is_timed_out(&self) -> bool;

    /// Forces the connection into the timed-out state, telling the client
    /// to reconnect fresh.
    fn set_timed_out(&self);

    /// How long this connection survives without a mark once not writable.
    fn disconnect_threshold(&self) -> Duration;

    /// Tears the connection down. Errors are swallowed by the sweep.
    async fn disconnect(&self) -> TransportResult<()>;
}

/// Tracker metadata for one connection.
///
/// Replaced wholesale on re-registration so stale state cannot leak across
/// reconnects. `last_marked` stays unset until traffic is first observed;
/// a connection without a mark is treated as not-yet-expired.
struct TrackedEntry {
    connection: Arc<dyn TrackedConnection>,
    initial: Instant,
    last_marked: Option<Instant>,
}

/// Periodic sweep over all registered connections.
///
/// Each sweep classifies every connection as alive, timed-out, or dead:
///
/// - not writable and silent past `disconnect_threshold + grace`: removed,
///   `disconnect()` fired (failures swallowed);
/// - writable but older than the reconnection window measured from its
///   *initial* registration: forced timed-out, independent of message
///   activity;
/// - otherwise: re-marked alive so intermediary hardware does not consider
///   the channel idle.
///
/// An atomic guard prevents overlapping sweeps: a tick that lands while the
/// previous sweep is still running is observed and skipped, never queued.
pub struct TransportHeartbeat {
    connections: DashMap<String, TrackedEntry>,
    timings: ConnectionTimings,
    sweeping: AtomicBool,
}

impl TransportHeartbeat {
    /// Creates a tracker with the given timing contract.
    #[must_use]
    pub fn new(timings: ConnectionTimings) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            timings,
            sweeping: AtomicBool::new(false),
        })
    }

    /// Registers a connection, replacing any prior entry with the same id.
    ///
    /// Returns `true` if an entry was replaced.
    pub fn add_connection(&self, connection: Arc<dyn TrackedConnection>) -> bool {
        let id = connection.connection_id().to_string();
        let replaced = self
            .connections
            .insert(
                id.clone(),
                TrackedEntry {
                    connection,
                    initial: Instant::now(),
                    last_marked: None,
                },
            )
            .is_some();
        trace!(connection_id = %id, replaced, "connection registered with heartbeat");
        replaced
    }

    /// Records traffic for a connection, resetting its silence clock.
    pub fn mark_connection(&self, connection_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.last_marked = Some(Instant::now());
        }
    }

    /// Removes a connection from tracking.
    pub fn remove_connection(&self, connection_id: &str) {
        self.connections.remove(connection_id);
    }

    /// Number of tracked connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns `true` if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Returns `true` if the id is currently tracked.
    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Spawns the recurring sweep, stopping when `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let heartbeat = Arc::clone(self);
        let interval = heartbeat.timings.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => heartbeat.sweep().await,
                    () = cancel.cancelled() => {
                        debug!("heartbeat sweep stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Runs one sweep over every tracked connection.
    pub async fn sweep(&self) {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("heartbeat tick while previous sweep still running; skipping");
            return;
        }

        let now = Instant::now();
        let dead_window_slack = self.timings.network_grace_period;
        let reconnection_window = self.timings.reconnection_window;

        // Snapshot first: disconnect() suspends, and holding map shards
        // across awaits would let one connection's cleanup block another's
        // registration.
        let snapshot: Vec<(String, Arc<dyn TrackedConnection>, Instant, Option<Instant>)> = self
            .connections
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    Arc::clone(&entry.connection),
                    entry.initial,
                    entry.last_marked,
                )
            })
            .collect();

        for (id, connection, initial, last_marked) in snapshot {
            if !connection.is_alive() {
                // A connection that never produced traffic has no silence
                // clock yet and is not expired.
                let Some(marked) = last_marked else {
                    continue;
                };
                let allowed = connection.disconnect_threshold() + dead_window_slack;
                if now.saturating_duration_since(marked) > allowed {
                    debug!(connection_id = %id, "connection silent past threshold, removing");
                    self.connections.remove(&id);
                    if let Err(err) = connection.disconnect().await {
                        warn!(connection_id = %id, error = %err, "disconnect cleanup failed");
                    }
                }
            } else if !connection.is_timed_out()
                && now.saturating_duration_since(initial) > reconnection_window
            {
                debug!(connection_id = %id, "reconnection window expired, forcing timeout");
                connection.set_timed_out();
            } else {
                // Keep-alive tick.
                self.mark_connection(&id);
            }
        }

        self.sweeping.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for TransportHeartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHeartbeat")
            .field("connections", &self.connections.len())
            .field("interval", &self.timings.heartbeat_interval)
            .finish()
    }
}

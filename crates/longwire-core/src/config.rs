//! Connection timing configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The timing contract shared by both sides of a connection.
///
/// Two independent liveness windows are deliberate and must not be merged:
/// `disconnect_threshold + network_grace_period` bounds how long a
/// non-writable connection survives since its last mark, while
/// `reconnection_window` bounds the total reconnection lifetime measured
/// from the connection's *initial* registration, regardless of intermittent
/// activity. Whichever trips first wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTimings {
    /// How long a non-writable connection survives since its last mark.
    pub disconnect_threshold: Duration,

    /// Slack added to the disconnect threshold for flaky networks.
    pub network_grace_period: Duration,

    /// Total reconnection lifetime measured from initial registration.
    pub reconnection_window: Duration,

    /// Cadence of the liveness sweep.
    pub heartbeat_interval: Duration,

    /// Fixed delay before a client retries a failed receive.
    pub retry_delay: Duration,

    /// Keep-alive interval; `None` disables keep-alive traffic.
    pub keep_alive_interval: Option<Duration>,

    /// How long a transport has to complete its handshake.
    pub transport_connect_timeout: Duration,

    /// Pause a long-polling client inserts between polls.
    pub long_poll_delay: Duration,
}

impl Default for ConnectionTimings {
    fn default() -> Self {
        Self {
            disconnect_threshold: Duration::from_secs(30),
            network_grace_period: Duration::from_secs(5),
            reconnection_window: Duration::from_secs(110),
            heartbeat_interval: Duration::from_secs(10),
            retry_delay: Duration::from_secs(2),
            keep_alive_interval: Some(Duration::from_secs(10)),
            transport_connect_timeout: Duration::from_secs(5),
            long_poll_delay: Duration::ZERO,
        }
    }
}

impl ConnectionTimings {
    /// Short windows for tests and local development.
    #[must_use]
    pub const fn fast() -> Self {
        Self {
            disconnect_threshold: Duration::from_secs(5),
            network_grace_period: Duration::from_secs(2),
            reconnection_window: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(1),
            retry_delay: Duration::from_millis(250),
            keep_alive_interval: Some(Duration::from_secs(2)),
            transport_connect_timeout: Duration::from_secs(1),
            long_poll_delay: Duration::ZERO,
        }
    }

    /// Long windows for high-latency links behind aggressive proxies.
    #[must_use]
    pub const fn patient() -> Self {
        Self {
            disconnect_threshold: Duration::from_secs(60),
            network_grace_period: Duration::from_secs(10),
            reconnection_window: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(20),
            retry_delay: Duration::from_secs(5),
            keep_alive_interval: Some(Duration::from_secs(20)),
            transport_connect_timeout: Duration::from_secs(15),
            long_poll_delay: Duration::from_millis(500),
        }
    }

    /// The full window a dead connection is granted: threshold plus grace.
    #[must_use]
    pub fn dead_connection_window(&self) -> Duration {
        self.disconnect_threshold + self.network_grace_period
    }
}

//! Client-side keep-alive monitoring.

use std::sync::Arc;

use std::time::Duration;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::transport::ClientTransport;

enum KeepAliveAction {
    None,
    Warn,
    Lost,
}

/// Watches the keep-alive descriptor at its derived check interval.
///
/// Crossing the warning threshold raises the slow-connection hook once per
/// silence period; crossing the timeout declares the connection lost and
/// hands the transport its `lost_connection` signal. Any received message
/// re-marks the descriptor and re-arms both thresholds.
pub(crate) fn spawn_monitor(
    connection: Arc<Connection>,
    transport: Arc<dyn ClientTransport>,
    check_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let stop = connection.stop_token();
        let mut ticker = tokio::time::interval(check_interval);
        // The first tick completes immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = stop.cancelled() => break,
            }
            if !connection.is_active() {
                break;
            }

            let action = connection
                .with_keep_alive(|data| {
                    if data.is_timed_out() {
                        KeepAliveAction::Lost
                    } else if data.should_warn() {
                        KeepAliveAction::Warn
                    } else {
                        KeepAliveAction::None
                    }
                })
                .unwrap_or(KeepAliveAction::None);

            match action {
                KeepAliveAction::Lost => {
                    warn!(
                        transport = transport.name(),
                        "keep-alive timed out, signalling lost connection"
                    );
                    transport.lost_connection(&connection).await;
                    // Re-arm so the transport gets a full window to recover
                    // before the next lost signal.
                    connection.mark_keep_alive();
                }
                KeepAliveAction::Warn => {
                    warn!(
                        transport = transport.name(),
                        "keep-alive running late, connection may be slow"
                    );
                    connection.hooks().slow_connection();
                }
                KeepAliveAction::None => {}
            }
        }
        debug!("keep-alive monitor stopped");
    })
}

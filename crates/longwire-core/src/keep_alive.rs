//! Keep-alive timing descriptor.

use std::time::Duration;

use tokio::time::Instant;

/// Missed keep-alives tolerated before the connection is considered lost.
const TIMEOUT_FACTOR: u32 = 2;

/// Fraction of the timeout after which a slow-connection warning is raised.
const WARNING_NUMERATOR: u32 = 2;
const WARNING_DENOMINATOR: u32 = 3;

/// Divisor applied to the warn-to-timeout span to derive the check cadence.
const CHECK_DIVISOR: u32 = 3;

/// Timing state for keep-alive monitoring on one connection.
///
/// All derived values are recomputed as a unit whenever the base interval
/// changes; the descriptor is never read before being set. The consumer
/// (the client keep-alive monitor) marks the descriptor on every observed
/// message and asks it whether to warn or declare the connection lost.
#[derive(Debug, Clone)]
pub struct KeepAliveData {
    interval: Duration,
    timeout: Duration,
    timeout_warning: Duration,
    check_interval: Duration,
    last_keep_alive: Instant,
    warning_raised: bool,
}

impl KeepAliveData {
    /// Creates a descriptor from the negotiated keep-alive interval.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        let timeout = interval * TIMEOUT_FACTOR;
        let timeout_warning = timeout * WARNING_NUMERATOR / WARNING_DENOMINATOR;
        let check_interval = (timeout - timeout_warning) / CHECK_DIVISOR;

        Self {
            interval,
            timeout,
            timeout_warning,
            check_interval,
            last_keep_alive: Instant::now(),
            warning_raised: false,
        }
    }

    /// Replaces the base interval, recomputing every derived value and
    /// resetting the warning state.
    pub fn set_interval(&mut self, interval: Duration) {
        *self = Self::new(interval);
    }

    /// The negotiated keep-alive interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Elapsed time past this threshold means the connection is lost.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Elapsed time past this threshold raises a slow-connection warning.
    #[must_use]
    pub const fn timeout_warning(&self) -> Duration {
        self.timeout_warning
    }

    /// How often the monitor should check this descriptor.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Records keep-alive traffic, clearing any raised warning.
    pub fn mark(&mut self) {
        self.last_keep_alive = Instant::now();
        self.warning_raised = false;
    }

    /// Time since the last observed keep-alive.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.last_keep_alive.elapsed()
    }

    /// Returns `true` if the connection should be declared lost.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        self.elapsed() >= self.timeout
    }

    /// Returns `true` exactly once per silence period when the warning
    /// threshold is crossed.
    pub fn should_warn(&mut self) -> bool {
        if self.warning_raised {
            return false;
        }
        if self.elapsed() >= self.timeout_warning {
            self.warning_raised = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_values_recomputed_as_a_unit() {
        let mut data = KeepAliveData::new(Duration::from_secs(10));
        assert_eq!(data.timeout(), Duration::from_secs(20));
        assert_eq!(data.timeout_warning(), Duration::from_secs(20) * 2 / 3);
        assert_eq!(
            data.check_interval(),
            (data.timeout() - data.timeout_warning()) / 3
        );

        data.set_interval(Duration::from_secs(30));
        assert_eq!(data.timeout(), Duration::from_secs(60));
        assert_eq!(data.timeout_warning(), Duration::from_secs(40));
    }

    #[test]
    fn test_fresh_descriptor_is_not_timed_out() {
        let data = KeepAliveData::new(Duration::from_secs(10));
        assert!(!data.is_timed_out());
    }

    #[test]
    fn test_warning_raised_once_until_marked() {
        let mut data = KeepAliveData::new(Duration::ZERO);
        // Zero interval makes every threshold already elapsed.
        assert!(data.should_warn());
        assert!(!data.should_warn());

        data.mark();
        assert!(data.should_warn());
    }
}

//! Opaque, monotonically non-decreasing position marker.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// A position marker into a connection's message log.
///
/// Cursors resume delivery without gaps or duplicates: a client presents the
/// last cursor it observed and receives everything after it. For any single
/// connection, successive envelopes carry non-decreasing cursors.
///
/// The wire form is the decimal rendering of the inner value; clients treat
/// it as opaque and echo it back unchanged.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cursor(u64);

impl Cursor {
    /// Creates a cursor at the given position.
    #[must_use]
    pub const fn new(position: u64) -> Self {
        Self(position)
    }

    /// Returns the numeric position of this cursor.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.0
    }

    /// Merges two cursors, keeping whichever is further along.
    ///
    /// Transports apply this when updating their local cursor so the value
    /// can never move backwards.
    #[must_use]
    pub fn advanced_to(self, other: Self) -> Self {
        self.max(other)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|e| TransportError::ProtocolError(format!("invalid cursor {s:?}: {e}")))
    }
}

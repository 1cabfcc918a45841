//! Round-robin choice over a fixed list of upstream endpoints.

use std::net::SocketAddr;

use crate::config::ConfigError;

/// Cycles through the configured destinations, one per call.
///
/// The cursor is shared by every client of an instance: two consecutive
/// datagrams go to two consecutive destinations regardless of who sent them.
#[derive(Debug, Clone)]
pub struct DestinationSelector {
    destinations: Vec<SocketAddr>,
    cursor: usize,
}

impl DestinationSelector {
    /// Build a selector. The list must not be empty.
    pub fn new(destinations: Vec<SocketAddr>) -> Result<Self, ConfigError> {
        if destinations.is_empty() {
            return Err(ConfigError::NoDestinations {
                instance: String::from("(selector)"),
            });
        }
        Ok(Self {
            destinations,
            cursor: 0,
        })
    }

    /// Current destination, then advance.
    pub fn next(&mut self) -> SocketAddr {
        let dest = self.destinations[self.cursor];
        self.cursor = self.cursor.wrapping_add(1) % self.destinations.len();
        dest
    }

    pub fn destinations(&self) -> &[SocketAddr] {
        &self.destinations
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

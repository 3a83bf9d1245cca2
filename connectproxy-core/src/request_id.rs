//! Request and connection identifiers
//!
//! A [`RequestId`] pairs the numeric id of the client connection with a
//! sequence number drawn from the tracker that issued it. The pair is the
//! registry key; the `<connection>-<sequence>` string form exists for logs and
//! external correlation only.

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Numeric identifier of a client connection, used for log correlation.
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId {
    pub connection_id: ConnectionId,
    pub sequence: u64,
}

impl RequestId {
    pub fn new(connection_id: ConnectionId, sequence: u64) -> Self {
        Self {
            connection_id,
            sequence,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.connection_id, self.sequence)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRequestIdError(String);

impl fmt::Display for ParseRequestIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid request id: {:?}", self.0)
    }
}

impl std::error::Error for ParseRequestIdError {}

impl FromStr for RequestId {
    type Err = ParseRequestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRequestIdError(s.to_string());
        let (connection, sequence) = s.rsplit_once('-').ok_or_else(err)?;
        Ok(Self {
            connection_id: connection.parse().map_err(|_| err())?,
            sequence: sequence.parse().map_err(|_| err())?,
        })
    }
}

/// Issues request ids with a monotonically increasing per-allocator sequence.
#[derive(Debug)]
pub struct RequestIdAllocator {
    counter: AtomicU64,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Allocates the next id for `connection_id`. The first sequence is 1.
    pub fn allocate(&self, connection_id: ConnectionId) -> RequestId {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        RequestId::new(connection_id, sequence)
    }
}

impl Default for RequestIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out connection ids for accepted client sockets, starting at 1.
#[derive(Debug)]
pub struct ConnectionIdAllocator {
    next: AtomicU64,
}

impl ConnectionIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ConnectionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequence_starts_at_one_and_increases() {
        let ids = RequestIdAllocator::new();
        assert_eq!(ids.allocate(7), RequestId::new(7, 1));
        assert_eq!(ids.allocate(7), RequestId::new(7, 2));
        assert_eq!(ids.allocate(9), RequestId::new(9, 3));
    }

    #[test]
    fn test_display_and_parse() {
        let id = RequestId::new(42, 5);
        assert_eq!(id.to_string(), "42-5");
        assert_eq!("42-5".parse::<RequestId>().unwrap(), id);
        assert!("42".parse::<RequestId>().is_err());
        assert!("a-1".parse::<RequestId>().is_err());
        assert!("1-".parse::<RequestId>().is_err());
    }

    #[test]
    fn test_serializes_as_string() {
        let json = serde_json::to_string(&RequestId::new(3, 12)).unwrap();
        assert_eq!(json, "\"3-12\"");
    }

    #[test]
    fn test_unique_under_concurrency() {
        let ids = Arc::new(RequestIdAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|conn| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..500).map(|_| ids.allocate(conn)).collect::<Vec<_>>())
            })
            .collect();

        let mut sequences = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(sequences.insert(id.sequence), "duplicate sequence {}", id);
            }
        }
        assert_eq!(sequences.len(), 4000);
    }

    #[test]
    fn test_connection_ids() {
        let conns = ConnectionIdAllocator::new();
        assert_eq!(conns.next_id(), 1);
        assert_eq!(conns.next_id(), 2);
    }
}

//! In-memory timestamp allocator.
//!
//! Serves as a memory-only fallback when no TSO server is available, and as
//! the allocator behind test servers. Each instance is independent.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::timestamp::Timestamp;

/// Hands out strictly increasing timestamps from local state.
#[derive(Debug, Default)]
pub struct LocalOracle {
    last: Mutex<Timestamp>,
}

impl LocalOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an oracle whose first timestamp is strictly after `start`.
    pub fn with_start(start: Timestamp) -> Self {
        Self {
            last: Mutex::new(start),
        }
    }

    /// Allocates the next timestamp.
    ///
    /// `physical` follows the wall clock but never moves backwards; `logical`
    /// counts up within a tick and resets when `physical` advances.
    pub fn next(&self) -> Timestamp {
        let now = wall_clock_ms();
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let ts = if now > last.physical {
            Timestamp::new(now, 0)
        } else {
            match last.logical.checked_add(1) {
                Some(logical) => Timestamp::new(last.physical, logical),
                // Logical space exhausted, borrow the next millisecond.
                None => Timestamp::new(last.physical.saturating_add(1), 0),
            }
        };
        *last = ts;
        ts
    }

    /// Returns the most recently allocated timestamp.
    pub fn last(&self) -> Timestamp {
        *self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_strictly_increasing() {
        let oracle = LocalOracle::new();
        let mut prev = oracle.next();
        for _ in 0..10_000 {
            let ts = oracle.next();
            assert!(ts > prev, "{ts} not after {prev}");
            prev = ts;
        }
        assert_eq!(oracle.last(), prev);
    }

    #[test]
    fn test_start_in_future_counts_logical() {
        let start = Timestamp::new(i64::MAX / 2, 5);
        let oracle = LocalOracle::with_start(start);
        assert_eq!(oracle.next(), Timestamp::new(start.physical, 6));
        assert_eq!(oracle.next(), Timestamp::new(start.physical, 7));
    }

    #[test]
    fn test_logical_overflow_advances_physical() {
        let start = Timestamp::new(i64::MAX / 2, i64::MAX);
        let oracle = LocalOracle::with_start(start);
        let ts = oracle.next();
        assert_eq!(ts, Timestamp::new(start.physical + 1, 0));
        assert!(ts > start);
        assert_eq!(oracle.next(), Timestamp::new(start.physical + 1, 1));
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let oracle = Arc::new(LocalOracle::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let oracle = oracle.clone();
                std::thread::spawn(move || (0..1000).map(|_| oracle.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<Timestamp> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}

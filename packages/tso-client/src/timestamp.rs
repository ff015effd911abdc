//! Timestamp values handed out by the oracle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A (physical, logical) timestamp pair.
///
/// Ordering is lexicographic: physical first, then logical. Field order
/// matters for the derived `Ord`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Millisecond-granularity counter derived from the leader's wall clock.
    pub physical: i64,
    /// Sequence number within one physical tick.
    pub logical: i64,
}

impl Timestamp {
    pub const fn new(physical: i64, logical: i64) -> Self {
        Self { physical, logical }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical, self.logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexicographic_order() {
        assert!(Timestamp::new(1, 9) < Timestamp::new(2, 0));
        assert!(Timestamp::new(2, 0) < Timestamp::new(2, 1));
        assert_eq!(Timestamp::new(3, 3), Timestamp::new(3, 3));
    }

    #[test]
    fn test_display() {
        assert_eq!(Timestamp::new(1700000000000, 7).to_string(), "1700000000000.7");
    }
}

//! Request priority classes
//!
//! Skein admits requests to the network in priority order:
//! - High: content the user is looking at right now
//! - Medium: content about to scroll into view
//! - Low: background enrichment (metadata batches, prefetch)
//!
//! Lower numeric value means stronger priority.

/// Admission priority of a subscription request
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    High = 0,
    #[default]
    Medium = 1,
    Low = 2,
}

impl Priority {
    /// Parse from numeric tier
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Priority::High),
            1 => Some(Priority::Medium),
            2 => Some(Priority::Low),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Is `self` strictly stronger than `other`?
    #[inline]
    pub fn outranks(self, other: Priority) -> bool {
        self < other
    }

    /// The stronger of two priorities
    #[inline]
    pub fn strongest(self, other: Priority) -> Priority {
        self.min(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_roundtrip() {
        for p in [Priority::High, Priority::Medium, Priority::Low] {
            assert_eq!(Priority::from_byte(p.to_byte()), Some(p));
        }
        assert_eq!(Priority::from_byte(9), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High.outranks(Priority::Medium));
        assert!(Priority::Medium.outranks(Priority::Low));
        assert!(!Priority::Medium.outranks(Priority::Medium));
        assert_eq!(Priority::Low.strongest(Priority::High), Priority::High);
    }
}

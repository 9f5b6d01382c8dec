//! Core identifiers: LSNs, election terms, and candidate node ids.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A log sequence number: a byte offset into the primary's WAL stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Rounds down to the nearest segment boundary.
    pub fn segment_floor(self, wal_seg_size: u64) -> Lsn {
        Lsn(self.0 - (self.0 % wal_seg_size))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

impl std::ops::Add<u64> for Lsn {
    type Output = Lsn;
    fn add(self, rhs: u64) -> Lsn {
        Lsn(self.0 + rhs)
    }
}

impl std::ops::Sub<Lsn> for Lsn {
    type Output = u64;
    fn sub(self, rhs: Lsn) -> u64 {
        self.0 - rhs.0
    }
}

/// A monotonic election epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a leader candidate: totally ordered by term, then by uuid.
///
/// The uuid tiebreak compares the two distinct candidate ids being
/// ranked, not an id against itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeId {
    pub term: Term,
    pub uuid: Uuid,
}

impl NodeId {
    pub fn new(term: Term, uuid: Uuid) -> Self {
        NodeId { term, uuid }
    }

    pub fn zero(uuid: Uuid) -> Self {
        NodeId {
            term: Term::ZERO,
            uuid,
        }
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.term
            .cmp(&other.term)
            .then_with(|| self.uuid.cmp(&other.uuid))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{term={}, uuid={}}}", self.term, self.uuid)
    }
}

/// Index of a configured safekeeper, stable for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub usize);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(byte: u8) -> Uuid {
        Uuid::from_bytes([byte; 16])
    }

    #[test]
    fn node_id_orders_by_term_first() {
        let low_term_high_uuid = NodeId::new(Term(1), uuid(0xff));
        let high_term_low_uuid = NodeId::new(Term(2), uuid(0x00));
        assert!(low_term_high_uuid < high_term_low_uuid);
    }

    #[test]
    fn node_id_breaks_ties_on_uuid() {
        let a = NodeId::new(Term(5), uuid(0x01));
        let b = NodeId::new(Term(5), uuid(0x02));
        assert!(a < b);
        assert!(b > a);
        assert_eq!(a.cmp(&a), std::cmp::Ordering::Equal);
    }

    #[test]
    fn lsn_segment_floor() {
        assert_eq!(Lsn(16 * 1024 * 1024 + 5).segment_floor(16 * 1024 * 1024), Lsn(16 * 1024 * 1024));
        assert_eq!(Lsn(10).segment_floor(16 * 1024 * 1024), Lsn(0));
    }

    #[test]
    fn term_bump_is_strictly_greater() {
        let observed = [Term(5), Term(7), Term(6)];
        let max = observed.iter().copied().max().unwrap();
        let proposed = max.next();
        assert_eq!(proposed, Term(8));

        let observed2 = [Term(8), Term(8), Term(8)];
        let max2 = observed2.iter().copied().max().unwrap();
        let proposed2 = max2.next();
        assert_eq!(proposed2, Term(9));
        assert!(proposed2 > proposed);
    }
}

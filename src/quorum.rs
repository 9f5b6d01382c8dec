//! Quorum commit computation and upstream feedback.

use crate::codec::Feedback;
use crate::id::Lsn;

/// Returns the highest LSN acknowledged by at least `quorum` of the
/// given peer ack positions: sort ascending, take the element at
/// index `len - quorum`.
pub fn commit_lsn(acks: &[Lsn], quorum: usize) -> Lsn {
    if acks.is_empty() || quorum == 0 || quorum > acks.len() {
        return Lsn::INVALID;
    }
    let mut sorted: Vec<Lsn> = acks.to_vec();
    sorted.sort();
    sorted[sorted.len() - quorum]
}

/// Builds the standby-feedback frame to send upstream for a given
/// commit position.
pub fn feedback_for(commit: Lsn, send_time: i64) -> Feedback {
    Feedback {
        write_lsn: commit,
        flush_lsn: commit,
        apply_lsn: Lsn::INVALID,
        send_time,
        reply_requested: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_two_of_three_all_healthy() {
        let acks = [Lsn(100), Lsn(100), Lsn(100)];
        assert_eq!(commit_lsn(&acks, 2), Lsn(100));
    }

    #[test]
    fn lagging_peer_sequence() {
        assert_eq!(commit_lsn(&[Lsn(100), Lsn(100), Lsn(50)], 2), Lsn(100));
        assert_eq!(commit_lsn(&[Lsn(200), Lsn(150), Lsn(50)], 2), Lsn(150));
        assert_eq!(commit_lsn(&[Lsn(200), Lsn(200), Lsn(50)], 2), Lsn(200));
    }

    #[test]
    fn commit_is_monotonic_under_increasing_acks() {
        let mut prev = Lsn::INVALID;
        let sequences = [
            [Lsn(10), Lsn(0), Lsn(0)],
            [Lsn(10), Lsn(5), Lsn(0)],
            [Lsn(20), Lsn(20), Lsn(0)],
            [Lsn(20), Lsn(20), Lsn(15)],
        ];
        for acks in sequences {
            let c = commit_lsn(&acks, 2);
            assert!(c >= prev);
            prev = c;
        }
    }

    #[test]
    fn quorum_larger_than_peer_count_yields_invalid() {
        assert_eq!(commit_lsn(&[Lsn(10)], 2), Lsn::INVALID);
    }
}

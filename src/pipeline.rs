//! Ordered WAL message queue with per-peer ack bitmask and trimming.
//!
//! Replaces a doubly-linked list of raw-pointer-spliced nodes with a
//! `VecDeque` indexed by a monotonically increasing sequence number; a
//! peer's in-flight message is an index, never a pointer.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::id::{Lsn, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(pub u64);

#[derive(Debug, Clone)]
pub struct WalMessage {
    pub seq: Seq,
    pub wal_pos: Lsn,
    pub end_pos: Lsn,
    pub data: Bytes,
    acked: Vec<bool>,
}

impl WalMessage {
    pub fn is_acked_by(&self, peer: PeerId) -> bool {
        self.acked.get(peer.0).copied().unwrap_or(false)
    }

    pub fn is_fully_acked(&self) -> bool {
        self.acked.iter().all(|&b| b)
    }
}

/// FIFO queue of not-yet-fully-acknowledged WAL messages.
pub struct Pipeline {
    queue: VecDeque<WalMessage>,
    next_seq: u64,
    n_peers: usize,
}

impl Pipeline {
    pub fn new(n_peers: usize) -> Self {
        Pipeline {
            queue: VecDeque::new(),
            next_seq: 0,
            n_peers,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Appends a new message to the tail, assigning the next sequence
    /// number. `end_pos` is the caller's responsibility: `data` may be
    /// a raw frame with a header, so the queue can't derive the
    /// record's end LSN from `data.len()` alone.
    pub fn push(&mut self, wal_pos: Lsn, end_pos: Lsn, data: Bytes) -> Seq {
        let seq = Seq(self.next_seq);
        self.next_seq += 1;
        self.queue.push_back(WalMessage {
            seq,
            wal_pos,
            end_pos,
            data,
            acked: vec![false; self.n_peers],
        });
        seq
    }

    pub fn get(&self, seq: Seq) -> Option<&WalMessage> {
        self.queue.iter().find(|m| m.seq == seq)
    }

    /// Finds the oldest message not yet acknowledged by `peer`, the
    /// resume point for that peer after an idle transition or a
    /// reconnect.
    pub fn oldest_unacked_for(&self, peer: PeerId) -> Option<Seq> {
        self.queue
            .iter()
            .find(|m| !m.is_acked_by(peer))
            .map(|m| m.seq)
    }

    /// Records a cumulative ack: every queued message whose end offset
    /// is covered by `ack_lsn` is marked acknowledged for `peer`, even
    /// if it was never individually the peer's "current" message.
    pub fn apply_ack(&mut self, peer: PeerId, ack_lsn: Lsn) {
        for msg in self.queue.iter_mut() {
            if msg.end_pos <= ack_lsn {
                if peer.0 < msg.acked.len() {
                    msg.acked[peer.0] = true;
                }
            }
        }
    }

    /// Drops every prefix message that has been acknowledged by all
    /// configured peers.
    pub fn trim(&mut self) {
        while let Some(front) = self.queue.front() {
            if front.is_fully_acked() {
                self.queue.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &WalMessage> {
        self.queue.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: usize) -> PeerId {
        PeerId(n)
    }

    #[test]
    fn push_assigns_increasing_sequence_numbers() {
        let mut p = Pipeline::new(2);
        let s0 = p.push(Lsn(0), Lsn(4), Bytes::from_static(b"aaaa"));
        let s1 = p.push(Lsn(4), Lsn(6), Bytes::from_static(b"bb"));
        assert_eq!(s0, Seq(0));
        assert_eq!(s1, Seq(1));
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn message_is_trimmed_only_once_every_peer_acks() {
        let mut p = Pipeline::new(2);
        p.push(Lsn(0), Lsn(4), Bytes::from_static(b"aaaa"));
        p.apply_ack(peer(0), Lsn(4));
        p.trim();
        assert_eq!(p.len(), 1, "still pinned: peer 1 hasn't acked");
        p.apply_ack(peer(1), Lsn(4));
        p.trim();
        assert_eq!(p.len(), 0);
    }

    #[test]
    fn cumulative_ack_retires_multiple_messages_at_once() {
        let mut p = Pipeline::new(2);
        p.push(Lsn(0), Lsn(4), Bytes::from_static(b"aaaa")); // ends at 4
        p.push(Lsn(4), Lsn(8), Bytes::from_static(b"bbbb")); // ends at 8
        p.push(Lsn(8), Lsn(12), Bytes::from_static(b"cccc")); // ends at 12
        p.apply_ack(peer(0), Lsn(8));
        p.apply_ack(peer(1), Lsn(8));
        p.trim();
        assert_eq!(p.len(), 1, "only the 12-ending message remains queued");
    }

    #[test]
    fn oldest_unacked_is_the_resume_point_after_reconnect() {
        let mut p = Pipeline::new(2);
        p.push(Lsn(0), Lsn(4), Bytes::from_static(b"aaaa"));
        p.push(Lsn(4), Lsn(8), Bytes::from_static(b"bbbb"));
        p.apply_ack(peer(0), Lsn(8));
        // peer 1 disconnects before acking anything, then reconnects.
        assert_eq!(p.oldest_unacked_for(peer(1)), Some(Seq(0)));
        p.apply_ack(peer(1), Lsn(4));
        assert_eq!(p.oldest_unacked_for(peer(1)), Some(Seq(1)));
    }
}

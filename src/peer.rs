//! Per-safekeeper connection state machine.

use bytes::BytesMut;
use tracing::{info, warn};

use crate::codec::{self, ServerInfo};
use crate::config::SafekeeperAddr;
use crate::id::{Lsn, PeerId};
use crate::pipeline::Seq;
use crate::socket::PeerSocket;

/// `Offline -> Connecting -> Handshake -> Vote -> WaitVerdict -> Idle
/// <-> SendWal -> RecvAck`. States that need scratch data carry it as
/// enum payload rather than as always-present struct fields.
///
/// `Connecting` holds the `JoinHandle` of a spawned connect task
/// rather than the raw connect future: the event loop rebuilds its
/// readiness futures every iteration, and a raw `TcpStream::connect`
/// future would restart the handshake from scratch if dropped after
/// losing a `select_all` race. The handle persists across iterations;
/// only the cheap wrapper that polls it is rebuilt.
pub enum PeerState {
    Offline,
    Connecting(tokio::task::JoinHandle<anyhow::Result<PeerSocket>>),
    Handshake { read_buf: BytesMut },
    Vote,
    WaitVerdict { read_buf: BytesMut },
    Idle,
    SendWal { seq: Seq, offset: usize },
    RecvAck { read_buf: BytesMut },
}

impl PeerState {
    pub fn name(&self) -> &'static str {
        match self {
            PeerState::Offline => "offline",
            PeerState::Connecting(_) => "connecting",
            PeerState::Handshake { .. } => "handshake",
            PeerState::Vote => "vote",
            PeerState::WaitVerdict { .. } => "wait_verdict",
            PeerState::Idle => "idle",
            PeerState::SendWal { .. } => "send_wal",
            PeerState::RecvAck { .. } => "recv_ack",
        }
    }
}

pub struct SafekeeperPeer {
    pub id: PeerId,
    pub addr: SafekeeperAddr,
    pub socket: Option<PeerSocket>,
    pub state: PeerState,
    pub info: Option<ServerInfo>,
    pub ack_lsn: Lsn,
}

impl SafekeeperPeer {
    pub fn new(id: PeerId, addr: SafekeeperAddr) -> Self {
        SafekeeperPeer {
            id,
            addr,
            socket: None,
            state: PeerState::Offline,
            info: None,
            ack_lsn: Lsn::INVALID,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, PeerState::Idle)
    }

    pub fn is_vote(&self) -> bool {
        matches!(self.state, PeerState::Vote)
    }

    pub fn is_wait_verdict(&self) -> bool {
        matches!(self.state, PeerState::WaitVerdict { .. })
    }

    /// Marks the peer as connected and ready to receive the handshake
    /// write. Called once `connect_async` resolves successfully.
    pub fn on_connected(&mut self, socket: PeerSocket) {
        info!(peer = %self.id, addr = %self.addr, "connected");
        self.socket = Some(socket);
        self.state = PeerState::Handshake {
            read_buf: BytesMut::with_capacity(ServerInfo::WIRE_LEN),
        };
    }

    pub fn on_handshake_complete(&mut self, info: ServerInfo) {
        info!(peer = %self.id, node_id = %info.node_id, "handshake complete");
        self.info = Some(info);
        self.state = PeerState::Vote;
    }

    pub fn on_verdict_accepted(&mut self) {
        info!(peer = %self.id, "vote accepted, peer is idle");
        self.state = PeerState::Idle;
    }

    pub fn on_ack(&mut self, ack_lsn: Lsn) {
        if ack_lsn > self.ack_lsn {
            self.ack_lsn = ack_lsn;
        }
        self.state = PeerState::Idle;
    }

    /// Resets the peer back to `Offline`, dropping its socket and any
    /// in-flight buffers. Safe to call from any state; idempotent.
    pub fn reset(&mut self, reason: &str) {
        if !matches!(self.state, PeerState::Offline) {
            warn!(peer = %self.id, addr = %self.addr, %reason, "resetting connection");
        }
        if let PeerState::Connecting(handle) = &self.state {
            handle.abort();
        }
        self.socket = None;
        self.state = PeerState::Offline;
    }

    pub fn begin_send(&mut self, seq: Seq, offset: usize) {
        self.state = PeerState::SendWal { seq, offset };
    }

    pub fn begin_recv_ack(&mut self) {
        self.state = PeerState::RecvAck {
            read_buf: BytesMut::with_capacity(codec::ACK_WIRE_LEN),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SafekeeperPeer {
        SafekeeperPeer::new(
            PeerId(0),
            SafekeeperAddr {
                host: "localhost".into(),
                port: 5000,
            },
        )
    }

    #[test]
    fn starts_offline() {
        let p = peer();
        assert_eq!(p.state.name(), "offline");
    }

    #[test]
    fn ack_is_monotonic_and_returns_to_idle() {
        let mut p = peer();
        p.begin_recv_ack();
        p.on_ack(Lsn(100));
        assert_eq!(p.ack_lsn, Lsn(100));
        assert!(p.is_idle());
        p.begin_recv_ack();
        p.on_ack(Lsn(50));
        assert_eq!(p.ack_lsn, Lsn(100), "ack must not regress");
    }

    #[test]
    fn reset_is_idempotent_from_any_state() {
        let mut p = peer();
        p.reset("test");
        assert!(matches!(p.state, PeerState::Offline));
        p.reset("test again");
        assert!(matches!(p.state, PeerState::Offline));
        assert!(p.socket.is_none());
    }
}

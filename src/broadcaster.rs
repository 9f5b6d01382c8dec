//! Owns all broadcaster state and drives the single-threaded event
//! loop: one readiness multiplexer wait per iteration, then the
//! corresponding state-machine transition run to completion before
//! waiting again.

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use futures::future::{select_all, BoxFuture};
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec::{self, ServerInfo, PROTOCOL_VERSION};
use crate::config::BroadcasterConf;
use crate::error::BroadcasterError;
use crate::id::{Lsn, NodeId, PeerId, Term};
use crate::metrics;
use crate::peer::{PeerState, SafekeeperPeer};
use crate::pipeline::Pipeline;
use crate::primary::{PrimaryConn, PrimaryEvent};
use crate::quorum;
use crate::socket::{PeerSocket, ReadStatus};

/// One readiness event, tagged with the peer (if any) it concerns.
/// Built fresh every iteration from `readable()`/`writable()` awaits,
/// which tokio documents as safe to reconstruct in a loop — unlike
/// the connect future, which is spawned once and polled by reference.
enum Event {
    Primary,
    PeerConnected(PeerId, anyhow::Result<PeerSocket>),
    PeerReadable(PeerId),
    PeerWritable(PeerId),
}

/// What a completed read against a peer socket produced, computed
/// while `peer.state` is still borrowed; the corresponding transition
/// is applied by the caller once that borrow has ended.
enum ReadOutcome {
    Handshake(ServerInfo),
    Verdict(NodeId),
    Ack(Lsn),
}

fn poll_join_handle<T: Send + 'static>(
    handle: &mut tokio::task::JoinHandle<T>,
) -> impl Future<Output = Result<T, tokio::task::JoinError>> + '_ {
    poll_fn(move |cx| Pin::new(&mut *handle).poll(cx))
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

pub struct Broadcaster {
    conf: BroadcasterConf,
    peers: Vec<SafekeeperPeer>,
    pipeline: Pipeline,
    self_uuid: Uuid,
    proposed_term: Option<Term>,
    n_votes: usize,
    last_ack_lsn: Lsn,
    streaming: bool,
    wal_seg_size: u32,
    timeline: u32,
    system_id: u64,
    wal_end: Lsn,
}

impl Broadcaster {
    pub fn new(conf: BroadcasterConf) -> Self {
        let peers = conf
            .safekeepers
            .iter()
            .enumerate()
            .map(|(i, addr)| SafekeeperPeer::new(PeerId(i), addr.clone()))
            .collect();
        let n = conf.safekeepers.len();
        Broadcaster {
            conf,
            peers,
            pipeline: Pipeline::new(n),
            self_uuid: Uuid::new_v4(),
            proposed_term: None,
            n_votes: 0,
            last_ack_lsn: Lsn::INVALID,
            // Flips to true once START_REPLICATION has put the
            // primary connection into copy-both mode; the election
            // phase below never polls the primary socket.
            streaming: false,
            wal_seg_size: 16 * 1024 * 1024,
            timeline: 1,
            system_id: 0,
            wal_end: Lsn::INVALID,
        }
    }

    pub async fn run(&mut self) -> Result<(), BroadcasterError> {
        let mut primary = PrimaryConn::connect(&self.conf)
            .await
            .map_err(BroadcasterError::Primary)?;
        let identity = primary
            .identify_system()
            .await
            .map_err(BroadcasterError::Primary)?;
        self.system_id = identity.system_id;
        self.timeline = identity.timeline;
        self.wal_end = identity.wal_end;
        info!(
            system_id = self.system_id,
            timeline = self.timeline,
            wal_end = %self.wal_end,
            "connected to primary"
        );

        for peer in self.peers.iter_mut() {
            spawn_connect(peer);
        }

        // Election phase: wait until quorum-many peers have accepted
        // our candidacy (a rejection anywhere aborts the process via
        // `?`, per the vote-rejection error class).
        while self.n_votes < self.conf.quorum {
            self.step(&mut primary).await?;
        }

        let commit = self.commit_lsn();
        let start_lsn = if commit.is_valid() {
            commit.segment_floor(self.wal_seg_size as u64)
        } else {
            // No peer has acked anything yet at the moment quorum is
            // reached (streaming hasn't started), so fall back to the
            // primary's own reported position.
            self.wal_end
        };
        info!(%start_lsn, "quorum established, starting replication");
        primary
            .start_replication(start_lsn, self.timeline)
            .await
            .map_err(BroadcasterError::Primary)?;
        self.streaming = true;

        while self.streaming || !self.pipeline.is_empty() {
            self.step(&mut primary).await?;
        }

        self.shut_down_peers().await;
        Ok(())
    }

    fn commit_lsn(&self) -> Lsn {
        let acks: Vec<Lsn> = self.peers.iter().map(|p| p.ack_lsn).collect();
        quorum::commit_lsn(&acks, self.conf.quorum)
    }

    /// Runs exactly one iteration: wait for the first ready event
    /// across the primary and all peers, then drive that one
    /// transition to completion.
    async fn step(&mut self, primary: &mut PrimaryConn) -> Result<(), BroadcasterError> {
        let mut futs: Vec<BoxFuture<'_, Event>> = Vec::new();

        if self.streaming {
            futs.push(Box::pin(async move {
                primary.readable().await.ok();
                Event::Primary
            }));
        }

        for peer in self.peers.iter_mut() {
            let id = peer.id;
            match &mut peer.state {
                PeerState::Offline => unreachable!("offline peers are reconnected synchronously"),
                PeerState::Connecting(handle) => {
                    futs.push(Box::pin(async move {
                        let result = poll_join_handle(handle)
                            .await
                            .unwrap_or_else(|e| Err(anyhow::anyhow!("connect task panicked: {e}")));
                        Event::PeerConnected(id, result)
                    }));
                }
                PeerState::Handshake { .. } | PeerState::WaitVerdict { .. } | PeerState::RecvAck { .. } => {
                    if let Some(socket) = &peer.socket {
                        futs.push(Box::pin(async move {
                            socket.readable().await.ok();
                            Event::PeerReadable(id)
                        }));
                    }
                }
                PeerState::SendWal { .. } => {
                    if let Some(socket) = &peer.socket {
                        futs.push(Box::pin(async move {
                            socket.writable().await.ok();
                            Event::PeerWritable(id)
                        }));
                    }
                }
                PeerState::Vote | PeerState::Idle => {
                    // Nothing pending: Vote waits on the broadcaster
                    // to reach quorum; Idle waits to be scheduled.
                }
            }
        }

        if futs.is_empty() {
            // No sockets are mid-flight; give the scheduler a chance
            // to dispatch queued messages to idle peers before
            // yielding once to the runtime so this can't spin hot.
            self.dispatch_to_idle_peers();
            tokio::task::yield_now().await;
            return Ok(());
        }

        let (event, _idx, _rest) = select_all(futs).await;
        self.handle_event(event, primary).await
    }

    async fn handle_event(
        &mut self,
        event: Event,
        primary: &mut PrimaryConn,
    ) -> Result<(), BroadcasterError> {
        match event {
            Event::Primary => self.handle_primary_readable(primary).await,
            Event::PeerConnected(id, result) => self.handle_peer_connected(id, result).await,
            Event::PeerReadable(id) => self.handle_peer_readable(id).await,
            Event::PeerWritable(id) => self.handle_peer_writable(id).await,
        }
    }

    async fn handle_primary_readable(
        &mut self,
        primary: &mut PrimaryConn,
    ) -> Result<(), BroadcasterError> {
        let event = primary.try_read_frame().map_err(BroadcasterError::Primary)?;
        match event {
            PrimaryEvent::Pending => {}
            PrimaryEvent::StreamEnded => {
                info!("primary closed the stream; draining outstanding acks");
                self.streaming = false;
            }
            PrimaryEvent::Message(crate::codec::PrimaryMessage::Keepalive { reply_requested, .. }) => {
                if reply_requested {
                    self.send_feedback(primary).await?;
                }
            }
            PrimaryEvent::Message(crate::codec::PrimaryMessage::WalData {
                start_lsn,
                send_time,
                payload,
                ..
            }) => {
                let end_pos = start_lsn + payload.len() as u64;
                let frame = codec::encode_wal_frame(start_lsn, send_time, &payload);
                let seq = self.pipeline.push(start_lsn, end_pos, frame);
                metrics::QUEUE_DEPTH.set(self.pipeline.len() as i64);
                tracing::trace!(?seq, %start_lsn, %end_pos, "enqueued WAL message");
                self.dispatch_to_idle_peers();
            }
        }
        self.maybe_send_feedback(primary).await
    }

    async fn handle_peer_connected(
        &mut self,
        id: PeerId,
        result: anyhow::Result<PeerSocket>,
    ) -> Result<(), BroadcasterError> {
        let peer = &mut self.peers[id.0];
        match result {
            Ok(socket) => {
                peer.on_connected(socket);
                self.send_handshake(id).await?;
            }
            Err(e) => {
                warn!(peer = %id, error = %e, "connect failed, retrying");
                peer.reset("connect failed");
                spawn_connect(peer);
            }
        }
        Ok(())
    }

    async fn send_handshake(&mut self, id: PeerId) -> Result<(), BroadcasterError> {
        let info = ServerInfo {
            protocol_version: PROTOCOL_VERSION,
            pg_version: 0,
            system_id: self.system_id,
            wal_seg_size: self.wal_seg_size,
            timeline: self.timeline,
            wal_end: self.wal_end,
            node_id: NodeId::zero(self.self_uuid),
        };
        let mut buf = BytesMut::new();
        info.encode(&mut buf);
        let peer = &mut self.peers[id.0];
        let write_result = match &peer.socket {
            Some(socket) => socket.write_all(&buf).await,
            None => return Ok(()),
        };
        if let Err(e) = write_result {
            // A dropped connection during the handshake write is
            // transient, same as any other per-peer I/O failure: reset
            // and reconnect rather than killing the whole process.
            peer.reset(&format!("sending handshake: {e}"));
            spawn_connect(peer);
        }
        Ok(())
    }

    async fn handle_peer_readable(&mut self, id: PeerId) -> Result<(), BroadcasterError> {
        // Read into whichever buffer the peer's current state owns.
        // The match only collects what happened (an I/O error, a
        // completed record, or neither); the corresponding state
        // transition runs afterwards, once the borrow of `peer.state`
        // has ended, so it can freely use `peer` and `self` again.
        let peer = &mut self.peers[id.0];
        let state_name = peer.state.name();
        let socket = match &peer.socket {
            Some(s) => s,
            None => return Ok(()),
        };

        let mut io_error: Option<String> = None;
        let mut outcome: Option<ReadOutcome> = None;

        match &mut peer.state {
            PeerState::Handshake { read_buf } => {
                let mut chunk = [0u8; 256];
                match socket.read_partial(&mut chunk) {
                    Ok(ReadStatus::WouldBlock) => {}
                    Ok(ReadStatus::Eof) => io_error = Some("peer closed during handshake".into()),
                    Ok(ReadStatus::Data(n)) => read_buf.extend_from_slice(&chunk[..n]),
                    Err(e) => io_error = Some(e.to_string()),
                }
                if io_error.is_none() && read_buf.len() >= ServerInfo::WIRE_LEN {
                    match ServerInfo::decode(read_buf) {
                        Ok(info) => outcome = Some(ReadOutcome::Handshake(info)),
                        Err(e) => io_error = Some(e.to_string()),
                    }
                }
            }
            PeerState::WaitVerdict { read_buf } => {
                let mut chunk = [0u8; 64];
                match socket.read_partial(&mut chunk) {
                    Ok(ReadStatus::WouldBlock) => {}
                    Ok(ReadStatus::Eof) => io_error = Some("peer closed awaiting verdict".into()),
                    Ok(ReadStatus::Data(n)) => read_buf.extend_from_slice(&chunk[..n]),
                    Err(e) => io_error = Some(e.to_string()),
                }
                if io_error.is_none() && read_buf.len() >= codec::NODE_ID_WIRE_LEN {
                    match codec::decode_node_id(read_buf) {
                        Ok(verdict) => outcome = Some(ReadOutcome::Verdict(verdict)),
                        Err(e) => io_error = Some(e.to_string()),
                    }
                }
            }
            PeerState::RecvAck { read_buf } => {
                let mut chunk = [0u8; 64];
                match socket.read_partial(&mut chunk) {
                    Ok(ReadStatus::WouldBlock) => {}
                    Ok(ReadStatus::Eof) => io_error = Some("peer closed awaiting ack".into()),
                    Ok(ReadStatus::Data(n)) => read_buf.extend_from_slice(&chunk[..n]),
                    Err(e) => io_error = Some(e.to_string()),
                }
                if io_error.is_none() && read_buf.len() >= codec::ACK_WIRE_LEN {
                    match codec::decode_ack(read_buf) {
                        Ok(ack_lsn) => outcome = Some(ReadOutcome::Ack(ack_lsn)),
                        Err(e) => io_error = Some(e.to_string()),
                    }
                }
            }
            _ => {
                warn!(peer = %id, state = state_name, "unexpected readable event");
            }
        }

        // A transient per-peer I/O error resets the connection and
        // returns normally; it never becomes a fatal error out of the
        // event loop.
        if let Some(detail) = io_error {
            let peer = &mut self.peers[id.0];
            peer.reset(&detail);
            spawn_connect(peer);
            return Ok(());
        }

        match outcome {
            None => Ok(()),
            Some(ReadOutcome::Handshake(info)) => {
                if info.protocol_version != PROTOCOL_VERSION {
                    return Err(BroadcasterError::ProtocolVersionMismatch {
                        peer: id,
                        ours: PROTOCOL_VERSION,
                        theirs: info.protocol_version,
                    });
                }
                self.peers[id.0].on_handshake_complete(info);
                self.try_dispatch_vote(id).await
            }
            Some(ReadOutcome::Verdict(verdict)) => {
                let proposed = NodeId::new(self.proposed_term.unwrap_or(Term::ZERO), self.self_uuid);
                if verdict != proposed {
                    return Err(BroadcasterError::VoteRejected {
                        peer: id,
                        proposed,
                        peer_term: verdict,
                    });
                }
                self.peers[id.0].on_verdict_accepted();
                self.n_votes += 1;
                metrics::CONNECTED_PEERS.set(self.n_votes as i64);
                Ok(())
            }
            Some(ReadOutcome::Ack(ack_lsn)) => {
                self.peers[id.0].on_ack(ack_lsn);
                self.pipeline.apply_ack(id, ack_lsn);
                self.pipeline.trim();
                metrics::QUEUE_DEPTH.set(self.pipeline.len() as i64);
                self.dispatch_to_idle_peers();
                Ok(())
            }
        }
    }

    async fn try_dispatch_vote(&mut self, id: PeerId) -> Result<(), BroadcasterError> {
        if let Some(term) = self.proposed_term {
            // Round already in progress: a late handshake joins it
            // immediately rather than waiting for a second round.
            self.send_vote_proposal(id, term).await?;
            return Ok(());
        }

        let n_in_vote = self.peers.iter().filter(|p| p.is_vote()).count();
        if n_in_vote < self.conf.quorum {
            return Ok(());
        }

        let max_node_id = self
            .peers
            .iter()
            .filter_map(|p| p.info.as_ref().map(|i| i.node_id))
            .max()
            .unwrap_or_else(|| NodeId::zero(self.self_uuid));
        let term = max_node_id.term.next();
        self.proposed_term = Some(term);
        info!(%term, "quorum of peers reached, proposing candidacy");

        let vote_targets: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|p| p.is_vote())
            .map(|p| p.id)
            .collect();
        for target in vote_targets {
            self.send_vote_proposal(target, term).await?;
        }
        Ok(())
    }

    // Proposes under our own uuid, not whichever peer's uuid the
    // max_node_id fold in `try_dispatch_vote` happened to carry (see
    // DESIGN.md open question 6).
    async fn send_vote_proposal(&mut self, id: PeerId, term: Term) -> Result<(), BroadcasterError> {
        let proposal = NodeId::new(term, self.self_uuid);
        let mut buf = BytesMut::new();
        codec::encode_node_id(&proposal, &mut buf);
        let peer = &mut self.peers[id.0];
        let write_result = match &peer.socket {
            Some(socket) => socket.write_all(&buf).await,
            None => return Ok(()),
        };
        if let Err(e) = write_result {
            peer.reset(&format!("sending vote proposal: {e}"));
            spawn_connect(peer);
            return Ok(());
        }
        peer.state = PeerState::WaitVerdict {
            read_buf: BytesMut::with_capacity(codec::NODE_ID_WIRE_LEN),
        };
        Ok(())
    }

    async fn handle_peer_writable(&mut self, id: PeerId) -> Result<(), BroadcasterError> {
        let (seq, offset) = match &self.peers[id.0].state {
            PeerState::SendWal { seq, offset } => (*seq, *offset),
            _ => return Ok(()),
        };
        let Some(msg) = self.pipeline.get(seq) else {
            // Message was trimmed while we were waiting for writability
            // (every peer including this one already acked it via a
            // later cumulative ack); nothing left to send.
            self.peers[id.0].state = PeerState::Idle;
            return Ok(());
        };
        let data = msg.data.clone();
        let peer = &mut self.peers[id.0];
        let socket = match &peer.socket {
            Some(s) => s,
            None => return Ok(()),
        };
        let written = match socket.write_partial(&data[offset..]) {
            Ok(n) => n,
            Err(e) => {
                let detail = e.to_string();
                peer.reset(&detail);
                spawn_connect(peer);
                return Ok(());
            }
        };
        let new_offset = offset + written;
        if new_offset >= data.len() {
            peer.begin_recv_ack();
        } else {
            peer.begin_send(seq, new_offset);
        }
        Ok(())
    }

    /// For every idle peer, dispatches the oldest message it hasn't
    /// acknowledged yet. Covers both fresh arrivals and reconnect
    /// redelivery through the same code path.
    fn dispatch_to_idle_peers(&mut self) {
        let idle: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|p| p.is_idle())
            .map(|p| p.id)
            .collect();
        for id in idle {
            if let Some(seq) = self.pipeline.oldest_unacked_for(id) {
                self.peers[id.0].begin_send(seq, 0);
            }
        }
    }

    async fn maybe_send_feedback(&mut self, primary: &mut PrimaryConn) -> Result<(), BroadcasterError> {
        let commit = self.commit_lsn();
        if commit > self.last_ack_lsn {
            self.last_ack_lsn = commit;
            metrics::COMMITTED_LSN.set(commit.0 as i64);
            self.send_feedback(primary).await?;
        }
        Ok(())
    }

    async fn send_feedback(&mut self, primary: &mut PrimaryConn) -> Result<(), BroadcasterError> {
        let feedback = quorum::feedback_for(self.last_ack_lsn, now_micros());
        primary
            .send_feedback(feedback)
            .await
            .map_err(BroadcasterError::Primary)
    }

    async fn shut_down_peers(&mut self) {
        for peer in self.peers.iter_mut() {
            if let Some(socket) = &peer.socket {
                let mut quit = BytesMut::new();
                quit.put_u8(codec::QUIT_TAG);
                if let Err(e) = socket.write_all(&quit).await {
                    warn!(peer = %peer.id, error = %e, "failed sending quit to peer");
                }
            }
            peer.reset("shutting down");
        }
    }
}

fn spawn_connect(peer: &mut SafekeeperPeer) {
    let host = peer.addr.host.clone();
    let port = peer.addr.port;
    let handle = tokio::spawn(async move { PeerSocket::connect(&host, port).await });
    peer.state = PeerState::Connecting(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    use crate::config::SafekeeperAddr;
    use crate::pipeline::Seq;

    fn test_conf(n: usize, quorum: usize) -> BroadcasterConf {
        BroadcasterConf {
            safekeepers: (0..n)
                .map(|i| SafekeeperAddr {
                    host: "127.0.0.1".into(),
                    port: 5000 + i as u16,
                })
                .collect(),
            quorum,
            primary_dbname: "postgres".into(),
            primary_host: "localhost".into(),
            primary_port: 5432,
            primary_username: "postgres".into(),
            verbose: 0,
        }
    }

    fn sample_info(term: u64, uuid_byte: u8) -> ServerInfo {
        ServerInfo {
            protocol_version: PROTOCOL_VERSION,
            pg_version: 0,
            system_id: 1,
            wal_seg_size: 16 * 1024 * 1024,
            timeline: 1,
            wal_end: Lsn(100),
            node_id: NodeId::new(Term(term), Uuid::from_bytes([uuid_byte; 16])),
        }
    }

    /// A connected loopback pair: the client end as a `PeerSocket`
    /// (what the broadcaster holds) and the server end as a raw
    /// `TcpStream` the test reads from to observe what got written.
    async fn connected_pair() -> (PeerSocket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, (server, _)) = tokio::join!(
            PeerSocket::connect("127.0.0.1", addr.port()),
            async { listener.accept().await.unwrap() }
        );
        (client.unwrap(), server)
    }

    #[tokio::test]
    async fn late_voter_is_admitted_into_an_in_progress_round() {
        let mut b = Broadcaster::new(test_conf(3, 2));

        let (sock0, mut server0) = connected_pair().await;
        let (sock1, mut server1) = connected_pair().await;
        let (sock2, mut server2) = connected_pair().await;

        b.peers[0].socket = Some(sock0);
        b.peers[0].state = PeerState::Vote;
        b.peers[0].info = Some(sample_info(1, 1));

        b.peers[1].socket = Some(sock1);
        b.peers[1].state = PeerState::Vote;
        b.peers[1].info = Some(sample_info(0, 2));

        // One handshake alone isn't quorum yet: no round starts.
        b.try_dispatch_vote(PeerId(0)).await.unwrap();
        assert!(b.proposed_term.is_none());

        // The second handshake reaches quorum and starts the round,
        // proposing to every peer currently waiting on a vote.
        b.try_dispatch_vote(PeerId(1)).await.unwrap();
        let term = b.proposed_term.expect("quorum should have started a round");

        let mut buf = [0u8; codec::NODE_ID_WIRE_LEN];
        server0.read_exact(&mut buf).await.unwrap();
        let proposal = codec::decode_node_id(&buf).unwrap();
        assert_eq!(proposal, NodeId::new(term, b.self_uuid));
        server1.read_exact(&mut buf).await.unwrap();
        assert_eq!(codec::decode_node_id(&buf).unwrap(), proposal);

        // Peer 2's handshake only completes after the round is already
        // under way. It must be folded into the in-progress round
        // immediately rather than left stalled for a second quorum.
        b.peers[2].socket = Some(sock2);
        b.peers[2].state = PeerState::Vote;
        b.peers[2].info = Some(sample_info(0, 3));
        b.try_dispatch_vote(PeerId(2)).await.unwrap();
        assert!(matches!(b.peers[2].state, PeerState::WaitVerdict { .. }));

        server2.read_exact(&mut buf).await.unwrap();
        assert_eq!(codec::decode_node_id(&buf).unwrap(), proposal);
    }

    #[test]
    fn reconnected_peer_resumes_from_its_oldest_unacked_message() {
        let mut b = Broadcaster::new(test_conf(2, 2));
        b.pipeline.push(Lsn(0), Lsn(4), Bytes::from_static(b"aaaa"));
        b.pipeline.push(Lsn(4), Lsn(8), Bytes::from_static(b"bbbb"));

        // Peer 0 had already acked the first message before going
        // idle; peer 1 is rejoining having missed everything.
        b.pipeline.apply_ack(PeerId(0), Lsn(4));
        b.peers[0].state = PeerState::Idle;
        b.peers[1].state = PeerState::Idle;

        b.dispatch_to_idle_peers();

        assert!(matches!(
            b.peers[0].state,
            PeerState::SendWal {
                seq: Seq(1),
                offset: 0
            }
        ));
        assert!(matches!(
            b.peers[1].state,
            PeerState::SendWal {
                seq: Seq(0),
                offset: 0
            }
        ));
    }
}


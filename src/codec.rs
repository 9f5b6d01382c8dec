//! Wire framing. Two distinct protocols share this module:
//!
//! - the primary's replication copy-data stream (tags `w`, `k`, `r`),
//!   nested inside the generic CopyData envelope;
//! - the broadcaster-to-safekeeper binary records (handshake, vote,
//!   ack), serialized little-endian regardless of either peer's
//!   native struct layout.

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::id::{Lsn, NodeId, Term};

pub const PROTOCOL_VERSION: u32 = 1;

/// Sent by both sides at handshake time: the broadcaster's identity
/// (term 0, a fresh uuid) and, in reply, each peer's last-known
/// leader candidacy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub protocol_version: u32,
    pub pg_version: u32,
    pub system_id: u64,
    pub wal_seg_size: u32,
    pub timeline: u32,
    pub wal_end: Lsn,
    pub node_id: NodeId,
}

const SERVER_INFO_LEN: usize = 4 + 4 + 8 + 4 + 4 + 8 + 8 + 16;

impl ServerInfo {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.protocol_version);
        buf.put_u32_le(self.pg_version);
        buf.put_u64_le(self.system_id);
        buf.put_u32_le(self.wal_seg_size);
        buf.put_u32_le(self.timeline);
        buf.put_u64_le(self.wal_end.0);
        buf.put_u64_le(self.node_id.term.0);
        buf.put_slice(self.node_id.uuid.as_bytes());
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < SERVER_INFO_LEN {
            bail!("short ServerInfo: {} bytes", buf.len());
        }
        let protocol_version = buf.get_u32_le();
        let pg_version = buf.get_u32_le();
        let system_id = buf.get_u64_le();
        let wal_seg_size = buf.get_u32_le();
        let timeline = buf.get_u32_le();
        let wal_end = Lsn(buf.get_u64_le());
        let term = Term(buf.get_u64_le());
        let mut uuid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut uuid_bytes);
        Ok(ServerInfo {
            protocol_version,
            pg_version,
            system_id,
            wal_seg_size,
            timeline,
            wal_end,
            node_id: NodeId::new(term, Uuid::from_bytes(uuid_bytes)),
        })
    }

    pub const WIRE_LEN: usize = SERVER_INFO_LEN;
}

/// Candidate node id sent standalone, for vote proposals and verdicts.
pub fn encode_node_id(id: &NodeId, buf: &mut BytesMut) {
    buf.put_u64_le(id.term.0);
    buf.put_slice(id.uuid.as_bytes());
}

pub const NODE_ID_WIRE_LEN: usize = 8 + 16;

pub fn decode_node_id(mut buf: &[u8]) -> Result<NodeId> {
    if buf.len() < NODE_ID_WIRE_LEN {
        bail!("short NodeId: {} bytes", buf.len());
    }
    let term = Term(buf.get_u64_le());
    let mut uuid_bytes = [0u8; 16];
    buf.copy_to_slice(&mut uuid_bytes);
    Ok(NodeId::new(term, Uuid::from_bytes(uuid_bytes)))
}

/// Cumulative flush LSN reported by a peer.
pub fn encode_ack(lsn: Lsn, buf: &mut BytesMut) {
    buf.put_u64_le(lsn.0);
}

pub const ACK_WIRE_LEN: usize = 8;

pub fn decode_ack(buf: &[u8]) -> Result<Lsn> {
    if buf.len() < ACK_WIRE_LEN {
        bail!("short ack: {} bytes", buf.len());
    }
    Ok(Lsn(LittleEndian::read_u64(buf)))
}

pub const QUIT_TAG: u8 = b'q';

/// A frame received from the primary's replication stream, already
/// unwrapped from the generic CopyData envelope.
#[derive(Debug, Clone)]
pub enum PrimaryMessage {
    WalData {
        start_lsn: Lsn,
        end_lsn: Lsn,
        send_time: i64,
        payload: Bytes,
    },
    Keepalive {
        end_lsn: Lsn,
        reply_requested: bool,
    },
}

const WAL_HEADER_LEN: usize = 1 + 8 + 8 + 8;
const KEEPALIVE_LEN: usize = 1 + 8 + 8 + 1;

impl PrimaryMessage {
    /// Parses one copy-data payload (the bytes after the outer 'd' tag
    /// and length prefix have already been stripped).
    pub fn parse(mut buf: Bytes) -> Result<Self> {
        if buf.is_empty() {
            bail!("empty copy-data payload");
        }
        let tag = buf[0];
        match tag {
            b'w' => {
                if buf.len() < WAL_HEADER_LEN {
                    bail!("short WAL frame: {} bytes", buf.len());
                }
                let mut header = buf.split_to(WAL_HEADER_LEN);
                header.advance(1);
                let start_lsn = Lsn(header.get_u64());
                let end_lsn = Lsn(header.get_u64());
                let send_time = header.get_i64();
                Ok(PrimaryMessage::WalData {
                    start_lsn,
                    end_lsn,
                    send_time,
                    payload: buf,
                })
            }
            b'k' => {
                if buf.len() < KEEPALIVE_LEN {
                    bail!("short keepalive frame: {} bytes", buf.len());
                }
                let mut b = buf.clone();
                b.advance(1);
                let end_lsn = Lsn(b.get_u64());
                let _send_time = b.get_i64();
                let reply_requested = b.get_u8() != 0;
                Ok(PrimaryMessage::Keepalive {
                    end_lsn,
                    reply_requested,
                })
            }
            other => bail!("unrecognized primary message tag {:?}", other as char),
        }
    }
}

/// Rebuilds a verbatim `w`-tagged copy-data frame around `payload`,
/// with `end_lsn` recomputed from `start_lsn` and the payload length
/// rather than trusted from whatever the primary last sent — this is
/// the exact buffer written to a peer's socket, header included.
pub fn encode_wal_frame(start_lsn: Lsn, send_time: i64, payload: &[u8]) -> Bytes {
    let end_lsn = start_lsn + payload.len() as u64;
    let mut buf = BytesMut::with_capacity(WAL_HEADER_LEN + payload.len());
    buf.put_u8(b'w');
    buf.put_u64(start_lsn.0);
    buf.put_u64(end_lsn.0);
    buf.put_i64(send_time);
    buf.put_slice(payload);
    buf.freeze()
}

/// Standby status update sent upstream to the primary (tag `r`).
#[derive(Debug, Clone, Copy)]
pub struct Feedback {
    pub write_lsn: Lsn,
    pub flush_lsn: Lsn,
    pub apply_lsn: Lsn,
    pub send_time: i64,
    pub reply_requested: u8,
}

impl Feedback {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(b'r');
        buf.put_u64(self.write_lsn.0);
        buf.put_u64(self.flush_lsn.0);
        buf.put_u64(self.apply_lsn.0);
        buf.put_i64(self.send_time);
        buf.put_u8(self.reply_requested);
    }
}

/// Wraps a payload in the generic CopyData ('d') envelope: tag byte +
/// big-endian i32 length (length includes itself, matching the wire
/// protocol this rides on top of).
pub fn wrap_copy_data(payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(1 + 4 + payload.len());
    out.put_u8(b'd');
    out.put_i32(payload.len() as i32 + 4);
    out.put_slice(payload);
    out
}

/// Strips one CopyData envelope from the front of `buf`, returning the
/// inner payload if a full frame is present.
pub fn try_unwrap_copy_data(buf: &[u8]) -> Result<Option<(Bytes, usize)>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    if buf[0] != b'd' {
        bail!("expected CopyData tag 'd', got {:?}", buf[0] as char);
    }
    let total_len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    let frame_len = 1 + total_len;
    if buf.len() < frame_len {
        return Ok(None);
    }
    let payload = Bytes::copy_from_slice(&buf[5..frame_len]);
    Ok(Some((payload, frame_len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_server_info() -> ServerInfo {
        ServerInfo {
            protocol_version: PROTOCOL_VERSION,
            pg_version: 160_000,
            system_id: 0xdead_beef,
            wal_seg_size: 16 * 1024 * 1024,
            timeline: 1,
            wal_end: Lsn(0x1_0000_0000),
            node_id: NodeId::new(Term(7), Uuid::from_bytes([9; 16])),
        }
    }

    #[test]
    fn server_info_round_trips() {
        let info = sample_server_info();
        let mut buf = BytesMut::new();
        info.encode(&mut buf);
        assert_eq!(buf.len(), ServerInfo::WIRE_LEN);
        let decoded = ServerInfo::decode(&buf).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn node_id_round_trips() {
        let id = NodeId::new(Term(42), Uuid::from_bytes([3; 16]));
        let mut buf = BytesMut::new();
        encode_node_id(&id, &mut buf);
        assert_eq!(decode_node_id(&buf).unwrap(), id);
    }

    #[test]
    fn ack_round_trips() {
        let mut buf = BytesMut::new();
        encode_ack(Lsn(123456), &mut buf);
        assert_eq!(decode_ack(&buf).unwrap(), Lsn(123456));
    }

    #[test]
    fn parses_wal_frame() {
        let mut raw = BytesMut::new();
        raw.put_u8(b'w');
        raw.put_u64(1000);
        raw.put_u64(1100);
        raw.put_i64(0);
        raw.put_slice(b"hello wal record");
        let msg = PrimaryMessage::parse(raw.freeze()).unwrap();
        match msg {
            PrimaryMessage::WalData {
                start_lsn,
                end_lsn,
                payload,
                ..
            } => {
                assert_eq!(start_lsn, Lsn(1000));
                assert_eq!(end_lsn, Lsn(1100));
                assert_eq!(&payload[..], b"hello wal record");
            }
            _ => panic!("expected WalData"),
        }
    }

    #[test]
    fn parses_keepalive_frame() {
        let mut raw = BytesMut::new();
        raw.put_u8(b'k');
        raw.put_u64(2000);
        raw.put_i64(0);
        raw.put_u8(1);
        let msg = PrimaryMessage::parse(raw.freeze()).unwrap();
        match msg {
            PrimaryMessage::Keepalive {
                end_lsn,
                reply_requested,
            } => {
                assert_eq!(end_lsn, Lsn(2000));
                assert!(reply_requested);
            }
            _ => panic!("expected Keepalive"),
        }
    }

    #[test]
    fn encoded_wal_frame_round_trips_through_parse() {
        let frame = encode_wal_frame(Lsn(1000), 0, b"hello wal record");
        let msg = PrimaryMessage::parse(frame).unwrap();
        match msg {
            PrimaryMessage::WalData {
                start_lsn,
                end_lsn,
                payload,
                ..
            } => {
                assert_eq!(start_lsn, Lsn(1000));
                assert_eq!(end_lsn, Lsn(1000 + 16));
                assert_eq!(&payload[..], b"hello wal record");
            }
            _ => panic!("expected WalData"),
        }
    }

    #[test]
    fn rejects_unknown_tag() {
        let raw = Bytes::from_static(b"\x99garbage");
        assert!(PrimaryMessage::parse(raw).is_err());
    }

    #[test]
    fn copy_data_envelope_round_trips() {
        let payload = b"some wal bytes";
        let wrapped = wrap_copy_data(payload);
        let (inner, consumed) = try_unwrap_copy_data(&wrapped).unwrap().unwrap();
        assert_eq!(consumed, wrapped.len());
        assert_eq!(&inner[..], payload);
    }

    #[test]
    fn copy_data_envelope_needs_more_bytes() {
        let payload = b"some wal bytes";
        let wrapped = wrap_copy_data(payload);
        let short = &wrapped[..wrapped.len() - 1];
        assert!(try_unwrap_copy_data(short).unwrap().is_none());
    }
}

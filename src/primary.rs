//! Minimal connection to the primary: startup handshake (trust auth
//! only), `IDENTIFY_SYSTEM`, `START_REPLICATION`, and the copy-both
//! streaming phase. Full SQL result marshalling and challenge-response
//! authentication are out of scope; an auth challenge is surfaced as a
//! configuration error.

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::codec::{self, Feedback, PrimaryMessage};
use crate::config::BroadcasterConf;
use crate::error::BroadcasterError;
use crate::id::Lsn;

const STARTUP_PROTOCOL_VERSION: i32 = 196_608; // 3.0 in the major/minor encoding this wire format uses

/// Result of one non-blocking read attempt against the primary's
/// copy-both stream.
#[derive(Debug)]
pub enum PrimaryEvent {
    Message(PrimaryMessage),
    StreamEnded,
    Pending,
}

pub struct PrimaryConn {
    stream: TcpStream,
    recv_buf: BytesMut,
}

impl PrimaryConn {
    pub async fn connect(conf: &BroadcasterConf) -> Result<Self> {
        let stream = TcpStream::connect((conf.primary_host.as_str(), conf.primary_port))
            .await
            .with_context(|| format!("connecting to primary at {}:{}", conf.primary_host, conf.primary_port))?;
        stream.set_nodelay(true).ok();
        let mut conn = PrimaryConn {
            stream,
            recv_buf: BytesMut::new(),
        };
        conn.send_startup(conf).await?;
        conn.await_ready_for_query().await?;
        Ok(conn)
    }

    async fn send_startup(&mut self, conf: &BroadcasterConf) -> Result<()> {
        let mut params = BytesMut::new();
        for (k, v) in [
            ("user", conf.primary_username.as_str()),
            ("database", conf.primary_dbname.as_str()),
            ("replication", "true"),
        ] {
            params.put_slice(k.as_bytes());
            params.put_u8(0);
            params.put_slice(v.as_bytes());
            params.put_u8(0);
        }
        params.put_u8(0);

        let mut msg = BytesMut::new();
        msg.put_i32(STARTUP_PROTOCOL_VERSION);
        msg.put_slice(&params);

        let mut framed = BytesMut::with_capacity(4 + msg.len());
        framed.put_i32(4 + msg.len() as i32);
        framed.put_slice(&msg);
        self.stream.write_all(&framed).await.context("sending startup message")?;
        Ok(())
    }

    /// Drains authentication and parameter-status messages until the
    /// backend announces `ReadyForQuery` ('Z'). Any authentication
    /// request other than `AuthenticationOk` (auth type 0) is treated
    /// as a configuration error: this client speaks trust auth only.
    async fn await_ready_for_query(&mut self) -> Result<()> {
        loop {
            let (tag, body) = self.read_backend_message().await?;
            match tag {
                b'R' => {
                    let auth_type = BigEndian::read_i32(&body[..4]);
                    if auth_type != 0 {
                        return Err(BroadcasterError::Config(format!(
                            "primary requested authentication type {auth_type}; only trust auth is supported"
                        ))
                        .into());
                    }
                }
                b'S' | b'K' | b'N' => { /* ParameterStatus, BackendKeyData, NoticeResponse: ignored */ }
                b'E' => bail!("primary returned an error during startup: {}", describe_error(&body)),
                b'Z' => return Ok(()),
                other => bail!("unexpected message {:?} while awaiting ReadyForQuery", other as char),
            }
        }
    }

    /// Reads one tagged backend message: a 1-byte tag, a 4-byte
    /// big-endian length (including itself), and the body.
    async fn read_backend_message(&mut self) -> Result<(u8, Bytes)> {
        let mut header = [0u8; 5];
        self.stream.read_exact(&mut header).await.context("reading message header")?;
        let tag = header[0];
        let len = BigEndian::read_i32(&header[1..]) as usize;
        if len < 4 {
            bail!("invalid message length {len}");
        }
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body).await.context("reading message body")?;
        Ok((tag, Bytes::from(body)))
    }

    async fn simple_query(&mut self, query: &str) -> Result<()> {
        let mut msg = BytesMut::new();
        msg.put_slice(query.as_bytes());
        msg.put_u8(0);
        let mut framed = BytesMut::with_capacity(5 + msg.len());
        framed.put_u8(b'Q');
        framed.put_i32(4 + msg.len() as i32);
        framed.put_slice(&msg);
        self.stream.write_all(&framed).await.context("sending simple query")
    }

    /// Issues `IDENTIFY_SYSTEM` and returns the primary's identity: its
    /// system id, current timeline, and current WAL insert position.
    /// The `dbname` column (present only when a database was named on
    /// the connection) is read but unused.
    pub async fn identify_system(&mut self) -> Result<SystemIdentity> {
        self.simple_query("IDENTIFY_SYSTEM").await?;
        let mut identity: Option<SystemIdentity> = None;
        loop {
            let (tag, body) = self.read_backend_message().await?;
            match tag {
                b'T' => { /* RowDescription */ }
                b'D' => {
                    identity = Some(parse_identify_system_row(&body)?);
                }
                b'C' | b'Z' => {
                    if tag == b'Z' {
                        return identity.context("IDENTIFY_SYSTEM returned no data row");
                    }
                }
                b'E' => bail!("IDENTIFY_SYSTEM failed: {}", describe_error(&body)),
                _ => {}
            }
        }
    }

    /// Starts physical replication at `start_lsn` on `timeline`,
    /// leaving the connection in CopyBoth streaming mode.
    pub async fn start_replication(&mut self, start_lsn: Lsn, timeline: u32) -> Result<()> {
        let query = format!("START_REPLICATION {} TIMELINE {}", start_lsn, timeline);
        self.simple_query(&query).await?;
        loop {
            let (tag, body) = self.read_backend_message().await?;
            match tag {
                b'W' => return Ok(()), // CopyBothResponse
                b'E' => bail!("START_REPLICATION failed: {}", describe_error(&body)),
                _ => {}
            }
        }
    }

    /// Awaits readability without consuming any bytes; cancel-safe, so
    /// it can be rebuilt fresh on every event-loop iteration.
    pub async fn readable(&self) -> Result<()> {
        self.stream.readable().await.context("awaiting primary readability")
    }

    /// Drains whatever is currently available into the internal
    /// buffer (non-blocking) and parses at most one complete frame.
    /// Only called after `readable()` has resolved, so a `WouldBlock`
    /// here means another task raced us to the data, not a bug.
    pub fn try_read_frame(&mut self) -> Result<PrimaryEvent> {
        let mut chunk = [0u8; 8192];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => return Ok(PrimaryEvent::StreamEnded),
                Ok(n) => self.recv_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        if self.recv_buf.is_empty() {
            return Ok(PrimaryEvent::Pending);
        }
        match self.recv_buf[0] {
            b'd' => match codec::try_unwrap_copy_data(&self.recv_buf)? {
                Some((payload, consumed)) => {
                    self.recv_buf.advance(consumed);
                    Ok(PrimaryEvent::Message(PrimaryMessage::parse(payload)?))
                }
                None => Ok(PrimaryEvent::Pending),
            },
            b'c' => {
                self.recv_buf.clear();
                Ok(PrimaryEvent::StreamEnded)
            }
            other => bail!("unexpected message tag {:?} in copy-both stream", other as char),
        }
    }

    pub async fn send_feedback(&mut self, feedback: Feedback) -> Result<()> {
        let mut payload = BytesMut::new();
        feedback.encode(&mut payload);
        let framed = codec::wrap_copy_data(&payload);
        debug!(flush_lsn = %feedback.flush_lsn, "sending standby feedback");
        self.stream.write_all(&framed).await.context("sending feedback")
    }
}

fn describe_error(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .split('\0')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// The primary's identity as reported by `IDENTIFY_SYSTEM`: its
/// system id, current timeline, and current WAL insert position.
#[derive(Debug, Clone, Copy)]
pub struct SystemIdentity {
    pub system_id: u64,
    pub timeline: u32,
    pub wal_end: Lsn,
}

/// Splits a `DataRow` body into its column texts, `None` for a SQL
/// NULL. Columns are length-prefixed text, not typed wire values: this
/// backend always sends `IDENTIFY_SYSTEM`'s columns as text.
fn parse_data_row_columns(mut body: &[u8]) -> Result<Vec<Option<String>>> {
    if body.len() < 2 {
        bail!("empty DataRow");
    }
    let n_cols = BigEndian::read_i16(&body[..2]);
    body.advance(2);
    let mut cols = Vec::with_capacity(n_cols.max(0) as usize);
    for _ in 0..n_cols {
        if body.len() < 4 {
            bail!("truncated DataRow column header");
        }
        let col_len = BigEndian::read_i32(&body[..4]);
        body.advance(4);
        if col_len < 0 {
            cols.push(None);
            continue;
        }
        let col_len = col_len as usize;
        if body.len() < col_len {
            bail!("truncated DataRow column body");
        }
        let text = std::str::from_utf8(&body[..col_len])
            .context("DataRow column is not valid utf8")?
            .to_string();
        body.advance(col_len);
        cols.push(Some(text));
    }
    Ok(cols)
}

/// Parses a `X/X` hex-pair LSN, the text format every replication
/// command that reports a position uses (`IDENTIFY_SYSTEM`'s
/// `xlogpos`, `START_REPLICATION`'s implicit position, feedback
/// logging elsewhere in this workspace).
fn parse_lsn(text: &str) -> Result<Lsn> {
    let (hi, lo) = text
        .split_once('/')
        .with_context(|| format!("malformed LSN {text:?}: missing '/'"))?;
    let hi = u32::from_str_radix(hi, 16).with_context(|| format!("malformed LSN {text:?}"))?;
    let lo = u32::from_str_radix(lo, 16).with_context(|| format!("malformed LSN {text:?}"))?;
    Ok(Lsn(((hi as u64) << 32) | lo as u64))
}

fn parse_identify_system_row(body: &[u8]) -> Result<SystemIdentity> {
    let cols = parse_data_row_columns(body)?;
    let system_id = cols
        .first()
        .and_then(|c| c.as_deref())
        .context("IDENTIFY_SYSTEM system_id column is NULL")?
        .parse::<u64>()
        .context("parsing system_id column")?;
    let timeline = cols
        .get(1)
        .and_then(|c| c.as_deref())
        .context("IDENTIFY_SYSTEM timeline column is NULL")?
        .parse::<u32>()
        .context("parsing timeline column")?;
    let wal_end = cols
        .get(2)
        .and_then(|c| c.as_deref())
        .context("IDENTIFY_SYSTEM xlogpos column is NULL")
        .and_then(parse_lsn)?;
    Ok(SystemIdentity {
        system_id,
        timeline,
        wal_end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn sample_identify_system_row() -> BytesMut {
        let mut row = BytesMut::new();
        row.put_i16(4); // n_cols
        for col in ["6970983760957638794", "3", "16/B374D848", "postgres"] {
            row.put_i32(col.len() as i32);
            row.put_slice(col.as_bytes());
        }
        row
    }

    #[test]
    fn parses_all_identify_system_columns() {
        let row = sample_identify_system_row();
        let identity = parse_identify_system_row(&row).unwrap();
        assert_eq!(identity.system_id, 6970983760957638794);
        assert_eq!(identity.timeline, 3);
        assert_eq!(identity.wal_end, Lsn(0x16 << 32 | 0xB374D848));
    }

    #[test]
    fn parses_lsn_hex_pair() {
        assert_eq!(parse_lsn("0/0").unwrap(), Lsn(0));
        assert_eq!(parse_lsn("16/B374D848").unwrap(), Lsn(0x16 << 32 | 0xB374D848));
    }

    #[test]
    fn rejects_malformed_lsn() {
        assert!(parse_lsn("not-an-lsn").is_err());
        assert!(parse_lsn("16").is_err());
    }

    #[test]
    fn null_system_id_column_is_an_error() {
        let mut row = BytesMut::new();
        row.put_i16(1);
        row.put_i32(-1); // NULL
        assert!(parse_identify_system_row(&row).is_err());
    }
}

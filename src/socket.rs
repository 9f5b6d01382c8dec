//! Non-blocking socket wrapper. Partial reads/writes return the byte
//! count transferred; a zero-without-error return stands in for
//! `EWOULDBLOCK` and callers resume from their own accumulated offset.

use anyhow::{Context, Result};
use tokio::net::TcpStream;

/// Outcome of one non-blocking read attempt. `try_read` returns `Ok(0)`
/// for a genuine EOF and `Err(WouldBlock)` when nothing is available
/// yet; collapsing both to the same value would make a closed peer
/// look like an idle one and spin the event loop on its readiness.
pub enum ReadStatus {
    WouldBlock,
    Eof,
    Data(usize),
}

pub struct PeerSocket {
    stream: TcpStream,
}

impl PeerSocket {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("connecting to {host}:{port}"))?;
        stream.set_nodelay(true).context("setting TCP_NODELAY")?;
        Ok(PeerSocket { stream })
    }

    /// Writes as much of `buf` as the socket will currently accept.
    /// Returns `Ok(0)` on would-block, never blocking the caller.
    pub fn write_partial(&self, buf: &[u8]) -> Result<usize> {
        match self.stream.try_write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads as much as is currently available into `buf`.
    pub fn read_partial(&self, buf: &mut [u8]) -> Result<ReadStatus> {
        match self.stream.try_read(buf) {
            Ok(0) => Ok(ReadStatus::Eof),
            Ok(n) => Ok(ReadStatus::Data(n)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(ReadStatus::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    /// Awaits completion of a full write. Only used for the small,
    /// one-shot election-phase buffers.
    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut stream = &self.stream;
        stream.write_all(buf).await.context("write_all to peer")
    }

    pub async fn readable(&self) -> Result<()> {
        self.stream.readable().await.context("awaiting readability")
    }

    pub async fn writable(&self) -> Result<()> {
        self.stream.writable().await.context("awaiting writability")
    }
}

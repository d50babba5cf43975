//! Connection endpoint: line-oriented reader/writer over a byte stream, and the one-line
//! username handshake.

use std::io;
use std::time::Duration;

use nonet_core::wire::{decode_line, decode_trailing, LineDecodeError};
use nonet_core::{IdentityError, PeerId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 8 * 1024;

/// Buffered line reader. Bytes past the last returned line stay buffered, so the
/// handshake and the inbound pump can share one reader.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            eof: false,
        }
    }

    /// Next line without its terminator. `Ok(None)` at end-of-stream; a final
    /// unterminated line is returned before that. Cancel-safe: buffered bytes are only
    /// extended after a read completes.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            match decode_line(&self.buf) {
                Ok((line, consumed)) => {
                    self.buf.drain(..consumed);
                    return Ok(Some(line));
                }
                Err(LineDecodeError::NeedMore) => {}
                Err(e) => return Err(invalid_data(e)),
            }
            if self.eof {
                let rest = std::mem::take(&mut self.buf);
                return decode_trailing(&rest).map_err(invalid_data);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

fn invalid_data(e: LineDecodeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Write one already-encoded line and flush it.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &[u8]) -> io::Result<()> {
    writer.write_all(line).await?;
    writer.flush().await
}

/// Accepting side: read the first line as the peer's identifier, bounded by `limit`.
pub async fn read_handshake<R: AsyncRead + Unpin>(
    reader: &mut LineReader<R>,
    limit: Duration,
) -> Result<PeerId, HandshakeError> {
    let line = tokio::time::timeout(limit, reader.next_line())
        .await
        .map_err(|_| HandshakeError::Timeout(limit))??
        .ok_or(HandshakeError::Closed)?;
    Ok(PeerId::from_handshake_line(&line)?)
}

/// Connecting side: write our identifier as the first line. No acknowledgement follows.
pub async fn write_handshake<W: AsyncWrite + Unpin>(
    writer: &mut W,
    me: &PeerId,
) -> Result<(), HandshakeError> {
    write_line(writer, me.handshake_line().as_bytes()).await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("no handshake line within {0:?}")]
    Timeout(Duration),
    #[error("connection closed before handshake")]
    Closed,
    #[error("handshake I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid peer identifier: {0}")]
    Invalid(#[from] IdentityError),
}

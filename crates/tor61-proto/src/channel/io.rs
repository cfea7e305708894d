//! Reading and writing whole cells on a byte stream.

use crate::Result;
use tor61_cell::{FrameReader, RawCell};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// How many bytes we try to read from the network at once.
const READ_CHUNK: usize = 8192;

/// The reading half of a channel: a byte stream, plus the framer that
/// turns it into cells.
///
/// Cells that arrive in the same read as the one the caller asked for
/// stay queued here, so the handshake can hand the reader to the
/// reactor without losing anything the peer sent early.
pub(crate) struct CellReader<R> {
    /// The underlying stream.
    inner: R,
    /// Framing state for this connection.
    frames: FrameReader,
    /// Scratch buffer for reads.
    buf: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> CellReader<R> {
    /// Wrap a new byte stream.
    pub(crate) fn new(inner: R) -> Self {
        CellReader {
            inner,
            frames: FrameReader::new(),
            buf: vec![0_u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Return the next cell from the stream, or None if the stream has
    /// closed.
    ///
    /// This is cancel-safe: bytes are only ever consumed from the
    /// stream and framed within a single poll.
    pub(crate) async fn next_cell(&mut self) -> Result<Option<RawCell>> {
        loop {
            if let Some(cell) = self.frames.next_cell() {
                return Ok(Some(cell));
            }
            let n = self.inner.read(&mut self.buf[..]).await?;
            if n == 0 {
                if self.frames.partial_len() > 0 {
                    debug!(
                        "Connection closed with {} bytes of an unfinished cell",
                        self.frames.partial_len()
                    );
                }
                return Ok(None);
            }
            self.frames.feed(&self.buf[..n]);
        }
    }
}

/// Write a single cell onto `w`.
pub(crate) async fn write_cell<W: AsyncWrite + Unpin>(w: &mut W, cell: &RawCell) -> Result<()> {
    w.write_all(cell.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

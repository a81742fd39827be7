//! Newline-delimited packet framing over async streams.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::domain::Packet;
use crate::error::{DaemonError, Result};

const READ_CHUNK: usize = 4096;

/// Streaming packet decoder.
///
/// Reads from the underlying stream only when the internal buffer holds no
/// complete line, so bytes belonging to later protocol phases are never
/// consumed; anything buffered past the last returned packet can be
/// reclaimed with [`into_parts`](Self::into_parts).
pub struct PacketReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read the next packet. `Ok(None)` means the stream ended cleanly on a
    /// packet boundary; EOF in the middle of a line is a framing error.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                let line = trim_whitespace(&line[..pos]);
                if line.is_empty() {
                    continue;
                }
                return Packet::decode(line).map(Some);
            }

            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                if trim_whitespace(&self.buf).is_empty() {
                    return Ok(None);
                }
                return Err(DaemonError::framing(
                    "stream ended in the middle of a packet",
                ));
            }
        }
    }

    /// Tear the reader apart, returning the stream and any bytes that were
    /// buffered beyond the last packet.
    pub fn into_parts(self) -> (R, Vec<u8>) {
        (self.inner, self.buf.to_vec())
    }
}

fn trim_whitespace(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(start);
    &line[start..end]
}

/// Write one packet followed by its framing newline and flush.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let data = packet.encode()?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

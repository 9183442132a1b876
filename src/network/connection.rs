use std::io::{self, ErrorKind};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::frame::split_frame;
use crate::{AppError, AppResult};

/// Read half of a framed connection.
///
/// Both ends of the transport use it: the node reads request frames, the
/// client reads response frames. A frame is returned as its raw body; the
/// caller decides whether it is a request or a response.
#[derive(Debug)]
pub struct Connection<R> {
    reader: R,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> Connection<R> {
    pub fn new(reader: R, max_frame_size: usize) -> Connection<R> {
        Connection {
            reader,
            buffer: BytesMut::with_capacity(4 * 1024),
            max_frame_size,
        }
    }

    /// Reads the next frame body.
    ///
    /// A malformed or oversized frame is an error and the connection should
    /// be closed. If the peer closes the connection between frames, `None`
    /// is returned; closing in the middle of a frame is an error.
    pub async fn read_frame(&mut self) -> AppResult<Option<BytesMut>> {
        loop {
            if let Some(frame) = split_frame(&mut self.buffer, self.max_frame_size)? {
                return Ok(Some(frame));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    // peer has closed the connection gracefully
                    Ok(None)
                } else {
                    // peer closed the connection while sending a frame
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }
}

/// Writes an encoded frame and flushes it.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(frame)
        .await
        .map_err(|e| AppError::DetailedIoError(format!("write frame error: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| AppError::DetailedIoError(format!("flush frame error: {}", e)))
}

//! Frame encoder and decoder.
//!
//! `decode` works on an accumulating read buffer and never blocks: it either
//! extracts one complete frame or reports that more bytes are needed. The
//! async helpers drive it against a socket half, applying an optional
//! absolute deadline to every read or write.

use std::future::Future;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

use super::{Message, HEADER_SIZE};
use crate::error::FrameError;

/// Outcome of a decode attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// One frame was consumed from the buffer into the message.
    Frame,
    /// The buffer does not yet hold a complete frame.
    Incomplete,
}

/// Decode one frame from the front of `buf` into `msg`.
///
/// On [`Decoded::Incomplete`] the buffer is left untouched and has been
/// reserved for the rest of the frame. The body is split off the buffer
/// without copying.
pub fn decode(
    buf: &mut BytesMut,
    msg: &mut Message,
    max_frame: usize,
) -> Result<Decoded, FrameError> {
    if buf.len() < HEADER_SIZE {
        buf.reserve(HEADER_SIZE - buf.len());
        return Ok(Decoded::Incomplete);
    }

    let mut header = &buf[..HEADER_SIZE];
    let length = header.get_i32();
    let route_id = header.get_i32();
    let message_id = header.get_i32();

    if length < 0 {
        return Err(FrameError::InvalidLength(length));
    }
    let body_len = length as usize;
    if body_len > max_frame {
        return Err(FrameError::TooLarge {
            length: body_len,
            max: max_frame,
        });
    }

    let total = HEADER_SIZE + body_len;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(Decoded::Incomplete);
    }

    buf.advance(HEADER_SIZE);
    let body = buf.split_to(body_len).freeze();
    msg.set_decoded(body, message_id, route_id);
    Ok(Decoded::Frame)
}

/// Append the encoded frame for `msg` to `dst`.
pub fn encode(msg: &Message, dst: &mut BytesMut) -> Result<(), FrameError> {
    check_length(msg)?;
    dst.reserve(HEADER_SIZE + msg.body().len());
    dst.put_i32(msg.length());
    dst.put_i32(msg.route_id());
    dst.put_i32(msg.message_id());
    dst.put_slice(msg.body());
    Ok(())
}

/// Read exactly one frame, pulling more bytes from `reader` as needed.
///
/// Bytes past the frame stay in `buf` for the next call. A stream that ends
/// mid-frame yields [`FrameError::EndOfStream`].
pub async fn read_message<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    msg: &mut Message,
    max_frame: usize,
    deadline: Option<Instant>,
) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if decode(buf, msg, max_frame)? == Decoded::Frame {
            return Ok(());
        }
        let n = with_deadline(deadline, "read", reader.read_buf(buf)).await?;
        if n == 0 {
            return Err(FrameError::EndOfStream);
        }
    }
}

/// Write the header fields and body in order, then flush.
///
/// Flushing a buffered writer pushes the frame to the socket; on an
/// unbuffered stream it is a no-op.
pub async fn write_message<W>(
    writer: &mut W,
    msg: &Message,
    deadline: Option<Instant>,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    check_length(msg)?;
    with_deadline(deadline, "write", async {
        writer.write_i32(msg.length()).await?;
        writer.write_i32(msg.route_id()).await?;
        writer.write_i32(msg.message_id()).await?;
        writer.write_all(msg.body()).await?;
        writer.flush().await
    })
    .await
}

fn check_length(msg: &Message) -> Result<(), FrameError> {
    if msg.body().len() != msg.length() as usize {
        return Err(FrameError::InvalidLength(msg.length()));
    }
    Ok(())
}

async fn with_deadline<F, T>(
    deadline: Option<Instant>,
    op: &'static str,
    fut: F,
) -> Result<T, FrameError>
where
    F: Future<Output = io::Result<T>>,
{
    let res = match deadline {
        Some(at) => match timeout_at(at, fut).await {
            Ok(res) => res,
            Err(_) => return Err(FrameError::Timeout(op)),
        },
        None => fut.await,
    };
    res.map_err(FrameError::from_io)
}

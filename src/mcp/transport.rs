//! Newline-delimited JSON framing.
//!
//! One JSON value per line in each direction. Blank lines are skipped.
//! Generic over the byte streams so tests can drive the server through an
//! in-memory duplex pipe.

use serde::Serialize;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Frames longer than this are rejected instead of buffered.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub struct LineReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
        }
    }

    /// Read the next non-blank line. `Ok(None)` at end of stream.
    pub async fn next_frame(&mut self) -> io::Result<Option<String>> {
        loop {
            let mut line = String::new();
            if self.inner.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            if line.len() > MAX_FRAME_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {} bytes exceeds the limit", line.len()),
                ));
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }
}

pub struct LineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    /// Serialise `message` onto one line and flush.
    pub async fn write_frame<T: Serialize>(&mut self, message: &T) -> io::Result<()> {
        let mut bytes = serde_json::to_vec(message).map_err(io::Error::other)?;
        bytes.push(b'\n');
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await
    }
}

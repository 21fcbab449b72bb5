//! Line-delimited JSON over any async reader/writer pair.

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{RpcId, RpcRequest, RpcResponse};

/// Longest accepted line, newline included.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Parse(#[from] serde_json::Error),
    /// Well-formed JSON that is not a request; `id` is kept when present.
    #[error("invalid request: {source}")]
    Invalid { id: Option<RpcId>, source: serde_json::Error },
    #[error("message exceeds {limit} bytes")]
    Oversized { limit: usize },
}

pub struct JsonlTransport<R, W> {
    reader: R,
    writer: W,
    max_line: usize,
}

impl<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin> JsonlTransport<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer, max_line: MAX_LINE_BYTES }
    }

    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    /// Next request, or `None` at EOF. Blank lines are skipped. A line that
    /// is not JSON is reported as `Parse`; JSON that is not a request as
    /// `Invalid`. Either way the line is consumed.
    pub async fn read_message(&mut self) -> Result<Option<RpcRequest>, TransportError> {
        let mut line = Vec::new();
        loop {
            line.clear();
            if !self.read_line(&mut line).await? {
                return Ok(None);
            }
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            let message: Value = serde_json::from_str(trimmed)?;
            let id = RpcId::of(&message);
            return serde_json::from_value(message).map(Some).map_err(|source| TransportError::Invalid { id, source });
        }
    }

    /// Fill `buf` with one line. `false` at EOF with nothing read. Oversized
    /// lines are drained up to their newline before the error is returned.
    async fn read_line(&mut self, buf: &mut Vec<u8>) -> Result<bool, TransportError> {
        let mut oversized = false;
        loop {
            let chunk = self.reader.fill_buf().await?;
            if chunk.is_empty() {
                if oversized {
                    return Err(TransportError::Oversized { limit: self.max_line });
                }
                return Ok(!buf.is_empty());
            }
            let (used, done) = match chunk.iter().position(|b| *b == b'\n') {
                Some(i) => (i + 1, true),
                None => (chunk.len(), false),
            };
            if !oversized {
                if buf.len() + used > self.max_line {
                    oversized = true;
                    buf.clear();
                } else {
                    buf.extend_from_slice(&chunk[..used]);
                }
            }
            self.reader.consume(used);
            if done {
                if oversized {
                    return Err(TransportError::Oversized { limit: self.max_line });
                }
                return Ok(true);
            }
        }
    }

    pub async fn write_response(&mut self, response: &RpcResponse) -> Result<(), TransportError> {
        let json = serde_json::to_string(response)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

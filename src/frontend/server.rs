//! Line protocol server implementation.

use std::future::Future;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info};

use super::service::{AdmissionResponse, AdmissionService};
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{Limiter, Verdict, MAX_KEY_LEN};

/// Longest request line held in memory. Bytes past this are counted and
/// dropped until the next newline.
pub const MAX_LINE_LEN: usize = MAX_KEY_LEN * 4;

/// One request line as read off the wire.
#[derive(Debug, PartialEq, Eq)]
enum RequestLine {
    Text(String),
    NotUtf8,
    Oversized(usize),
}

/// Newline-delimited reader that never buffers more than [`MAX_LINE_LEN`]
/// bytes of a line.
///
/// Partial lines live in `buf` between calls and bytes are only consumed from
/// the inner reader without an intervening await, so a `next_line` future can
/// be dropped in a `select!` without losing input.
struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
    /// Bytes of the current line dropped for exceeding the cap
    dropped: usize,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            dropped: 0,
        }
    }

    /// Next line, or `None` at end of input.
    async fn next_line(&mut self) -> io::Result<Option<RequestLine>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() && self.dropped == 0 {
                    return Ok(None);
                }
                return Ok(Some(self.finish_line()));
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            let room = MAX_LINE_LEN.saturating_sub(self.buf.len());
            let kept = chunk.len().min(room);
            self.buf.extend_from_slice(&chunk[..kept]);
            self.dropped += chunk.len() - kept;

            let consumed = newline.map_or(available.len(), |i| i + 1);
            self.reader.consume(consumed);

            if newline.is_some() {
                return Ok(Some(self.finish_line()));
            }
        }
    }

    fn finish_line(&mut self) -> RequestLine {
        let bytes = std::mem::take(&mut self.buf);
        let dropped = std::mem::replace(&mut self.dropped, 0);
        if dropped > 0 {
            return RequestLine::Oversized(bytes.len() + dropped);
        }

        match String::from_utf8(bytes) {
            Ok(mut line) => {
                if line.ends_with('\r') {
                    line.pop();
                }
                RequestLine::Text(line)
            }
            Err(_) => RequestLine::NotUtf8,
        }
    }
}

/// Totals for one run of the front end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeStats {
    /// Requests admitted
    pub allowed: u64,
    /// Requests denied by the limiter
    pub denied: u64,
    /// Lines that did not name a usable client
    pub invalid: u64,
}

impl ServeStats {
    fn record(&mut self, response: &AdmissionResponse) {
        match response {
            AdmissionResponse::Decision {
                verdict: Verdict::Allowed { .. },
                ..
            } => self.allowed += 1,
            AdmissionResponse::Decision {
                verdict: Verdict::Denied { .. },
                ..
            } => self.denied += 1,
            AdmissionResponse::Error { .. } => self.invalid += 1,
        }
    }
}

/// Serves admission decisions over a line-oriented stream.
pub struct LineServer {
    /// The limiter instance
    limiter: Arc<Limiter>,
}

impl LineServer {
    /// Create a new server deciding with `limiter`.
    pub fn new(limiter: Arc<Limiter>) -> Self {
        Self { limiter }
    }

    /// Serve until `reader` reaches end of input.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<ServeStats>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.serve_with_shutdown(reader, writer, std::future::pending())
            .await
    }

    /// Serve until `reader` reaches end of input or `signal` resolves.
    pub async fn serve_with_shutdown<R, W, F>(
        self,
        reader: R,
        mut writer: W,
        signal: F,
    ) -> Result<ServeStats>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        let service = AdmissionService::new(self.limiter);
        let mut lines = LineReader::new(reader);
        let mut stats = ServeStats::default();
        tokio::pin!(signal);

        info!("Starting admission front end");

        loop {
            let line = tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown requested, closing admission front end");
                    break;
                }
                line = lines.next_line() => line.map_err(|e| {
                    error!(error = %e, "Failed to read admission request");
                    GatekeeperError::Io(e)
                })?,
            };

            let Some(line) = line else {
                debug!("Input closed");
                break;
            };

            let response = match line {
                RequestLine::Text(line) => match service.handle_line(&line) {
                    Some(response) => response,
                    None => continue,
                },
                RequestLine::NotUtf8 => service.reject("request line is not valid UTF-8"),
                RequestLine::Oversized(len) => service.reject(&format!(
                    "request line is {} bytes, at most {} allowed",
                    len, MAX_LINE_LEN
                )),
            };
            stats.record(&response);

            let mut encoded = serde_json::to_vec(&response)?;
            encoded.push(b'\n');
            writer.write_all(&encoded).await?;
            writer.flush().await?;
        }

        info!(
            allowed = stats.allowed,
            denied = stats.denied,
            invalid = stats.invalid,
            "Admission front end stopped"
        );

        Ok(stats)
    }
}

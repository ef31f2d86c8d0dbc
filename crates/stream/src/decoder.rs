//! Newline-delimited JSON decoding.
//!
//! A JSON value may arrive split across reads, and so may the line break
//! that terminates it. [`FrameDecoder`] buffers raw bytes and only parses
//! complete lines, so multi-byte UTF-8 sequences split across chunks are
//! never decoded early. A malformed line is reported and skipped; it never
//! aborts the stream.

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Size of each read from the underlying reader.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Default cap on one line. Longer lines are reported and skipped.
pub const DEFAULT_MAX_LINE_LEN: usize = 1024 * 1024;

/// Raw text of a malformed line is truncated to this many bytes in errors.
const RAW_PREVIEW_LEN: usize = 200;

/// Why a line was rejected.
#[derive(Debug, thiserror::Error)]
pub enum LineFault {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("line exceeds {limit} bytes")]
    TooLong { limit: usize },
}

/// A line that could not be parsed as one JSON value of the expected type.
#[derive(Debug, thiserror::Error)]
#[error("Malformed frame on line {line}: {source}")]
pub struct LineError {
    /// 1-based line number within the stream.
    pub line: usize,
    /// Lossy, truncated copy of the offending line.
    pub raw: String,
    #[source]
    pub source: LineFault,
}

/// Stateful push parser for newline-delimited JSON.
///
/// At most `max_line_len` bytes of an unterminated line are held. Once a
/// line grows past that, it is reported as [`LineFault::TooLong`] and the
/// rest of it is dropped up to the next line break.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no line break.
    scanned: usize,
    /// Dropping the tail of an oversized line.
    overflowed: bool,
    max_line_len: usize,
    line: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            overflowed: false,
            max_line_len,
            line: 0,
        }
    }

    /// Bytes received but not yet terminated by a line break.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and parse every line it completes.
    ///
    /// Blank lines are skipped; `\r\n` endings are accepted.
    pub fn push<T: DeserializeOwned>(&mut self, chunk: &[u8]) -> Vec<Result<T, LineError>> {
        self.buffer.extend_from_slice(chunk);

        let mut decoded = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(len) = self.buffer[from..].iter().position(|b| *b == b'\n') {
            let end = from + len;
            if self.overflowed {
                // Tail of a line already reported as too long.
                self.overflowed = false;
            } else {
                self.line += 1;
                let line = &self.buffer[start..end];
                if let Some(result) = parse_line(line, self.line, self.max_line_len) {
                    decoded.push(result);
                }
            }
            start = end + 1;
            from = start;
        }
        self.buffer.drain(..start);

        if self.overflowed {
            self.buffer.clear();
        } else if self.buffer.len() > self.max_line_len {
            self.line += 1;
            decoded.push(Err(LineError {
                line: self.line,
                raw: preview(&self.buffer),
                source: LineFault::TooLong {
                    limit: self.max_line_len,
                },
            }));
            self.buffer.clear();
            self.overflowed = true;
        }
        self.scanned = self.buffer.len();

        decoded
    }

    /// End of stream: parse whatever remains without a terminating line
    /// break. The decoder is empty afterwards.
    pub fn finish<T: DeserializeOwned>(&mut self) -> Option<Result<T, LineError>> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if std::mem::take(&mut self.overflowed) {
            return None;
        }
        self.line += 1;
        parse_line(&rest, self.line, self.max_line_len)
    }
}

fn parse_line<T: DeserializeOwned>(
    line: &[u8],
    number: usize,
    max_len: usize,
) -> Option<Result<T, LineError>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    if line.len() > max_len {
        return Some(Err(LineError {
            line: number,
            raw: preview(line),
            source: LineFault::TooLong { limit: max_len },
        }));
    }
    Some(serde_json::from_slice(line).map_err(|source| LineError {
        line: number,
        raw: preview(line),
        source: source.into(),
    }))
}

fn preview(line: &[u8]) -> String {
    let text = String::from_utf8_lossy(line);
    if text.len() <= RAW_PREVIEW_LEN {
        return text.into_owned();
    }
    let mut end = RAW_PREVIEW_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

// ---------------------------------------------------------------------------
// Async driver
// ---------------------------------------------------------------------------

/// Counters for one decode run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStats {
    /// Values handed to the callback.
    pub delivered: usize,
    /// Lines logged and skipped.
    pub malformed: usize,
}

/// How a decode run ended. Cancellation is an outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The reader reached end of stream.
    Finished(DecodeStats),
    /// The cancellation token fired; the reader was dropped.
    Cancelled(DecodeStats),
}

impl DecodeOutcome {
    pub fn stats(&self) -> DecodeStats {
        match self {
            DecodeOutcome::Finished(stats) | DecodeOutcome::Cancelled(stats) => *stats,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DecodeOutcome::Cancelled(_))
    }
}

/// Transport failure while reading the stream.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Stream read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Read newline-delimited JSON from `reader`, calling `on_frame` for each
/// value that parses as `T`.
///
/// If `cancel` is already triggered, returns [`DecodeOutcome::Cancelled`]
/// without reading at all. A cancellation during a read aborts that read.
/// Cancellation is also checked before every callback, so once the token
/// fires no further values are delivered, including when `on_frame` itself
/// triggers it.
pub async fn decode_stream<R, T, F>(
    reader: R,
    cancel: &CancellationToken,
    mut on_frame: F,
) -> Result<DecodeOutcome, DecodeError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
    F: FnMut(T),
{
    let mut reader = reader;
    let mut decoder = FrameDecoder::new();
    let mut stats = DecodeStats::default();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        if cancel.is_cancelled() {
            return Ok(DecodeOutcome::Cancelled(stats));
        }

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(DecodeOutcome::Cancelled(stats)),
            read = reader.read(&mut chunk) => read?,
        };
        if read == 0 {
            break;
        }

        for result in decoder.push::<T>(&chunk[..read]) {
            if cancel.is_cancelled() {
                return Ok(DecodeOutcome::Cancelled(stats));
            }
            deliver(result, &mut stats, &mut on_frame);
        }
    }

    if let Some(result) = decoder.finish::<T>() {
        if cancel.is_cancelled() {
            return Ok(DecodeOutcome::Cancelled(stats));
        }
        deliver(result, &mut stats, &mut on_frame);
    }

    Ok(DecodeOutcome::Finished(stats))
}

fn deliver<T, F: FnMut(T)>(result: Result<T, LineError>, stats: &mut DecodeStats, on_frame: &mut F) {
    match result {
        Ok(value) => {
            stats.delivered += 1;
            on_frame(value);
        }
        Err(e) => {
            stats.malformed += 1;
            tracing::warn!(
                line = e.line,
                error = %e.source,
                raw = %e.raw,
                "Skipping malformed frame",
            );
        }
    }
}

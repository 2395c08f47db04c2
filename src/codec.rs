//! Content-Length message framing for JSON-RPC over byte streams.
//!
//! This module implements HTTP-style Content-Length framing, the same protocol
//! used by the Language Server Protocol (LSP). This enables reliable message
//! boundaries over stream-oriented transports (pipes, sockets, stdio).
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! Header parsing is case-insensitive and handles both CRLF and LF line
//! endings. The decoder is incremental: bytes arrive in arbitrarily split
//! chunks via [`FrameDecoder::push`] and complete frames are pulled out with
//! [`FrameDecoder::next_frame`], so parsing never blocks the transport.
//!
//! # Failure Semantics
//!
//! An oversized or unparseable `Content-Length` is fatal: further framing is
//! undecidable, so the decoder terminates the stream. A body that fails JSON
//! parsing is recoverable: the declared length still lets the decoder skip
//! cleanly to the next frame boundary.

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Maximum frame size (32 MiB) to prevent OOM from malicious/buggy peers.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Above this declared body size the decoder reserves the full buffer up
/// front, so a large body is copied once instead of re-grown per chunk.
const LARGE_BODY_THRESHOLD: usize = 64 * 1024;

/// Consumed-prefix length that triggers a buffer compaction.
const COMPACT_THRESHOLD: usize = 8 * 1024;

/// Fatal framing errors. Once one of these is returned the decoder is dead
/// and every subsequent call returns the same error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The header block carried no `Content-Length` header.
    #[error("Missing Content-Length header")]
    MissingContentLength,

    /// `Content-Length` was not a valid non-negative integer.
    #[error("Invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),

    /// `Content-Length` declared a body larger than [`MAX_FRAME_SIZE`].
    #[error("Frame size {declared} exceeds maximum {MAX_FRAME_SIZE} bytes")]
    Oversized {
        /// The declared body length.
        declared: usize,
    },
}

/// One parsed header+body unit off the wire.
///
/// Header names are lower-cased and values trimmed at parse time; insertion
/// order is preserved. The body is the parsed JSON document.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Ordered `(lower-cased name, trimmed value)` pairs.
    pub headers: Vec<(String, String)>,
    /// Parsed JSON body.
    pub body: Value,
}

impl Frame {
    /// Look up a header by (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// One decode result: either a well-formed frame, or a recoverable
/// parse-error marker (valid length, body not valid JSON).
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A complete, well-formed frame.
    Frame(Frame),
    /// The body failed JSON parsing; the decoder has already resynced past
    /// it. Carries the parser's message for the Parse-Error response.
    ParseError(String),
}

/// Incremental Content-Length frame decoder.
///
/// Feed raw transport chunks with [`push`](Self::push); drain complete frames
/// with [`next_frame`](Self::next_frame) until it returns `Ok(None)`, then
/// return control to the transport. The decoder holds at most one partial
/// frame of buffered bytes plus whatever the transport delivered beyond it.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Read position into `buf`; everything before it is consumed.
    pos: usize,
    /// Set once a fatal framing error occurs; the decoder stays dead.
    fatal: Option<CodecError>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw chunk from the transport.
    ///
    /// Chunks may be split at arbitrary byte boundaries; the decoder emits
    /// the same frame sequence regardless of how the bytes were chunked.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.fatal.is_some() {
            return;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Pull the next complete frame out of the buffer.
    ///
    /// Returns `Ok(None)` when no full frame is buffered yet (wait for more
    /// input), `Ok(Some(_))` for each complete frame or recoverable parse
    /// error, and `Err(_)` for a fatal framing error after which the stream
    /// must be torn down.
    pub fn next_frame(&mut self) -> Result<Option<Decoded>, CodecError> {
        if let Some(err) = &self.fatal {
            return Err(err.clone());
        }

        // Locate the header/body delimiter: CRLFCRLF normally, bare LFLF
        // accepted for resilience. Whichever occurs first wins.
        let pending = &self.buf[self.pos..];
        let crlf = find_subslice(pending, b"\r\n\r\n").map(|i| (i, 4));
        let lf = find_subslice(pending, b"\n\n").map(|i| (i, 2));
        let (header_len, delim_len) = match (crlf, lf) {
            (Some(a), Some(b)) => {
                if a.0 <= b.0 {
                    a
                } else {
                    b
                }
            }
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => {
                self.compact();
                return Ok(None);
            }
        };

        let headers = parse_headers(&pending[..header_len]);
        let body_len = match content_length(&headers) {
            Ok(len) => len,
            Err(err) => {
                // Corrupt length: no trustworthy resync point exists.
                warn!("fatal framing error: {}", err);
                self.fatal = Some(err.clone());
                self.buf.clear();
                self.pos = 0;
                return Err(err);
            }
        };

        let body_start = self.pos + header_len + delim_len;
        let available = self.buf.len() - body_start;
        if available < body_len {
            if body_len > LARGE_BODY_THRESHOLD {
                // Single up-front reservation bounds memory-copy cost for
                // large bodies.
                self.buf.reserve(body_len - available);
            }
            return Ok(None);
        }

        let body_bytes = &self.buf[body_start..body_start + body_len];
        let decoded = match serde_json::from_slice::<Value>(body_bytes) {
            Ok(body) => Decoded::Frame(Frame { headers, body }),
            Err(e) => {
                // Length was valid, so skipping the declared bytes resyncs
                // at the next frame boundary.
                warn!("recoverable frame parse error: {}", e);
                Decoded::ParseError(e.to_string())
            }
        };

        self.pos = body_start + body_len;
        self.compact();
        Ok(Some(decoded))
    }

    /// True once a fatal framing error has been observed.
    pub fn is_dead(&self) -> bool {
        self.fatal.is_some()
    }

    /// Drop the consumed prefix once it is worth the memmove.
    fn compact(&mut self) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos >= COMPACT_THRESHOLD {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

/// Serialize a JSON body into a complete wire frame.
pub fn encode_frame(body: &Value) -> Vec<u8> {
    let body_bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"null".to_vec());
    let header = format!("Content-Length: {}\r\n\r\n", body_bytes.len());
    let mut out = Vec::with_capacity(header.len() + body_bytes.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&body_bytes);
    out
}

/// Write a framed message to the stream, awaiting backpressure.
///
/// Writes the header bytes, then the body bytes, then flushes. Callers that
/// share a stream must serialize calls externally so frames never interleave.
pub async fn write_frame<W>(writer: &mut W, body: &Value) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body_bytes = serde_json::to_vec(body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let header = format!("Content-Length: {}\r\n\r\n", body_bytes.len());

    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body_bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Parse a header block into ordered `(lower name, trimmed value)` pairs.
///
/// Lines without a colon are ignored rather than rejected; the only header
/// that framing depends on is `Content-Length`.
fn parse_headers(block: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(block);
    let mut headers = Vec::new();
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if let Some(colon) = line.find(':') {
            let name = line[..colon].trim().to_ascii_lowercase();
            let value = line[colon + 1..].trim().to_string();
            headers.push((name, value));
        }
    }
    headers
}

/// Extract and validate the mandatory `Content-Length` header.
fn content_length(headers: &[(String, String)]) -> Result<usize, CodecError> {
    let value = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| v.as_str())
        .ok_or(CodecError::MissingContentLength)?;

    let len: usize = value
        .parse()
        .map_err(|_| CodecError::InvalidContentLength(value.to_string()))?;

    if len > MAX_FRAME_SIZE {
        return Err(CodecError::Oversized { declared: len });
    }
    Ok(len)
}

/// First occurrence of `needle` in `haystack`.
fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

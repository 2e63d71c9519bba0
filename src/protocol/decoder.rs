//! Streaming Request Decoder
//!
//! Reads requests straight off a buffered byte source and turns each one into
//! an [`Invocation`]: the command name followed by its arguments.
//!
//! Two request grammars are accepted, selected by the first byte:
//!
//! ```text
//! *2\r\n$3\r\nGET\r\n$1\r\nx\r\n      multi-bulk  -> ["GET", "x"]
//! SET  "a b" 1\r\n                     inline      -> ["SET", "a b", "1"]
//! ```
//!
//! Multi-bulk elements may be integers (`:`), bulk strings (`$`) or nested
//! arrays (`*`). Nested arrays are flattened depth-first into the outer
//! argument list; no nested invocation is ever built. An element with any
//! other lead byte consumes only that byte and yields nothing.
//!
//! The decoder never writes to the connection. End of stream between requests
//! is `Ok(None)`; everything else that goes wrong is a [`DecodeError`].

use crate::protocol::types::prefix;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::trace;

/// A decoded request: command name first, then positional arguments.
/// Never empty when returned by [`RequestDecoder::next_invocation`].
pub type Invocation = Vec<Bytes>;

/// Maximum length of a single protocol line (64 KB)
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum number of elements announced by one array header
pub const MAX_ARRAY_LENGTH: usize = 1024 * 1024;

/// Maximum array nesting depth
pub const MAX_NESTING_DEPTH: usize = 32;

/// Initial buffer capacity for a bulk payload
const BULK_READ_CHUNK: usize = 64 * 1024;

/// Errors that can occur while decoding a request.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Transport failure, including a stream that ends mid-request
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid length prefix '{0}'")]
    InvalidLength(String),

    #[error("invalid integer '{0}'")]
    InvalidInteger(String),

    #[error("unbalanced quotes in request")]
    UnbalancedQuotes,

    /// A `\r` followed by something other than `\n`
    #[error("expected line feed after carriage return, found {0:#04x}")]
    BadTerminator(u8),

    #[error("bulk string not terminated by CRLF")]
    MissingTerminator,

    #[error("line too long (max {max} bytes)")]
    LineTooLong { max: usize },

    #[error("bulk string too large: {size} bytes (max {max})")]
    BulkTooLarge { size: usize, max: usize },

    #[error("array too large: {size} elements (max {max})")]
    ArrayTooLarge { size: usize, max: usize },

    #[error("maximum nesting depth exceeded: {0}")]
    NestingTooDeep(usize),
}

impl DecodeError {
    /// True for malformed input, false for transport failures.
    pub fn is_protocol(&self) -> bool {
        !matches!(self, DecodeError::Io(_))
    }
}

/// Result type for decoding operations.
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Size limits enforced while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderLimits {
    pub max_line_len: usize,
    pub max_bulk_len: usize,
    pub max_array_len: usize,
    pub max_depth: usize,
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self {
            max_line_len: MAX_LINE_LENGTH,
            max_bulk_len: MAX_BULK_SIZE,
            max_array_len: MAX_ARRAY_LENGTH,
            max_depth: MAX_NESTING_DEPTH,
        }
    }
}

/// Per-connection request decoder.
///
/// # Example
///
/// ```
/// use tidekv::protocol::RequestDecoder;
///
/// # tokio_test::block_on(async {
/// let mut decoder = RequestDecoder::new(&b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n"[..]);
/// let invocation = decoder.next_invocation().await.unwrap().unwrap();
/// assert_eq!(invocation, vec!["GET", "x"]);
/// assert!(decoder.next_invocation().await.unwrap().is_none());
/// # });
/// ```
#[derive(Debug)]
pub struct RequestDecoder<R> {
    reader: R,
    /// The line most recently read, without its terminator
    line: Vec<u8>,
    limits: DecoderLimits,
}

impl<R: AsyncBufRead + Unpin> RequestDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self::with_limits(reader, DecoderLimits::default())
    }

    pub fn with_limits(reader: R, limits: DecoderLimits) -> Self {
        Self {
            reader,
            line: Vec::new(),
            limits,
        }
    }

    /// Decodes the next request.
    ///
    /// Requests that decode to no arguments at all (a blank inline line,
    /// `*0`, an array of skipped elements) are passed over silently.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(invocation))` - a non-empty request
    /// - `Ok(None)` - the peer closed the stream between requests
    /// - `Err(e)` - transport failure or malformed request
    pub async fn next_invocation(&mut self) -> DecodeResult<Option<Invocation>> {
        loop {
            let first = match self.reader.fill_buf().await?.first() {
                Some(&b) => b,
                None => return Ok(None),
            };

            let args = if first == prefix::ARRAY {
                self.reader.consume(1);
                self.read_multi_bulk().await?
            } else {
                self.read_line().await?;
                InlineTokenizer::new(&self.line).tokenize()?
            };

            if args.is_empty() {
                trace!("Skipping empty request");
                continue;
            }

            return Ok(Some(args));
        }
    }

    /// Reads an array whose leading `*` has been consumed, flattening nested
    /// arrays into a single argument list.
    async fn read_multi_bulk(&mut self) -> DecodeResult<Invocation> {
        let mut args = Vec::new();
        // Elements still to read at each open nesting level
        let mut pending = vec![self.read_count().await?];

        loop {
            let Some(remaining) = pending.last_mut() else {
                break;
            };
            if *remaining == 0 {
                pending.pop();
                continue;
            }
            *remaining -= 1;

            match self.reader.read_u8().await? {
                prefix::INTEGER => {
                    self.read_line().await?;
                    let text = std::str::from_utf8(&self.line)
                        .ok()
                        .filter(|s| s.parse::<i64>().is_ok())
                        .ok_or_else(|| {
                            DecodeError::InvalidInteger(String::from_utf8_lossy(&self.line).into())
                        })?;
                    args.push(Bytes::copy_from_slice(text.as_bytes()));
                }
                prefix::BULK_STRING => {
                    if let Some(data) = self.read_bulk().await? {
                        args.push(data);
                    }
                }
                prefix::ARRAY => {
                    let count = self.read_count().await?;
                    if pending.len() >= self.limits.max_depth {
                        return Err(DecodeError::NestingTooDeep(self.limits.max_depth));
                    }
                    pending.push(count);
                }
                other => {
                    trace!(byte = other, "Skipping array element with unknown prefix");
                }
            }
        }

        Ok(args)
    }

    /// Reads an array header count; `-1` (null array) counts as empty.
    async fn read_count(&mut self) -> DecodeResult<usize> {
        self.read_line().await?;
        let count = parse_length(&self.line)?;
        if count == -1 {
            return Ok(0);
        }
        let count =
            usize::try_from(count).map_err(|_| DecodeError::InvalidLength(count.to_string()))?;
        if count > self.limits.max_array_len {
            return Err(DecodeError::ArrayTooLarge {
                size: count,
                max: self.limits.max_array_len,
            });
        }
        Ok(count)
    }

    /// Reads a bulk string whose `$` has been consumed. `$-1` yields `None`.
    async fn read_bulk(&mut self) -> DecodeResult<Option<Bytes>> {
        self.read_line().await?;
        let length = parse_length(&self.line)?;
        if length == -1 {
            return Ok(None);
        }
        let length =
            usize::try_from(length).map_err(|_| DecodeError::InvalidLength(length.to_string()))?;
        if length > self.limits.max_bulk_len {
            return Err(DecodeError::BulkTooLarge {
                size: length,
                max: self.limits.max_bulk_len,
            });
        }

        // Grow with the payload actually received, not the declared length
        let mut data = Vec::with_capacity(length.min(BULK_READ_CHUNK));
        (&mut self.reader)
            .take(length as u64)
            .read_to_end(&mut data)
            .await?;
        if data.len() < length {
            return Err(DecodeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-request",
            )));
        }

        let mut crlf = [0u8; 2];
        self.reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(DecodeError::MissingTerminator);
        }

        Ok(Some(Bytes::from(data)))
    }

    /// Reads one `\r\n`-terminated line into `self.line`, terminator excluded.
    async fn read_line(&mut self) -> DecodeResult<()> {
        self.line.clear();
        let max = self.limits.max_line_len;

        loop {
            let chunk = self.reader.fill_buf().await?;
            if chunk.is_empty() {
                return Err(DecodeError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-request",
                )));
            }

            let (take, found) = match chunk.iter().position(|&b| b == b'\r') {
                Some(pos) => (pos, true),
                None => (chunk.len(), false),
            };
            if self.line.len() + take > max {
                return Err(DecodeError::LineTooLong { max });
            }
            self.line.extend_from_slice(&chunk[..take]);

            if found {
                self.reader.consume(take + 1);
                break;
            }
            self.reader.consume(take);
        }

        match self.reader.read_u8().await? {
            b'\n' => Ok(()),
            other => Err(DecodeError::BadTerminator(other)),
        }
    }
}

/// Parses a decimal length prefix.
fn parse_length(line: &[u8]) -> DecodeResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| DecodeError::InvalidLength(String::from_utf8_lossy(line).into()))
}

/// Splits an inline command line into tokens.
///
/// Tokens are separated by runs of spaces. A token opening with `"` runs to
/// the next unescaped `"`; inside it `\"` stands for a quote and every other
/// backslash is kept as is. Empty tokens are dropped.
struct InlineTokenizer<'a> {
    line: &'a [u8],
    pos: usize,
}

impl<'a> InlineTokenizer<'a> {
    fn new(line: &'a [u8]) -> Self {
        Self { line, pos: 0 }
    }

    fn tokenize(mut self) -> DecodeResult<Invocation> {
        let mut args = Vec::new();
        while self.pos < self.line.len() {
            let token = self.next_token()?;
            if !token.is_empty() {
                args.push(Bytes::from(token));
            }
        }
        Ok(args)
    }

    #[inline]
    fn peek(&self, offset: usize) -> Option<u8> {
        self.line.get(self.pos + offset).copied()
    }

    fn next_token(&mut self) -> DecodeResult<Vec<u8>> {
        while self.peek(0) == Some(b' ') {
            self.pos += 1;
        }

        if self.peek(0) == Some(b'"') {
            self.pos += 1;
            return self.quoted_token();
        }

        let start = self.pos;
        while matches!(self.peek(0), Some(b) if b != b' ') {
            self.pos += 1;
        }
        Ok(self.line[start..self.pos].to_vec())
    }

    fn quoted_token(&mut self) -> DecodeResult<Vec<u8>> {
        let mut token = Vec::new();
        loop {
            match self.peek(0) {
                None => return Err(DecodeError::UnbalancedQuotes),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(token);
                }
                Some(b'\\') if self.peek(1) == Some(b'"') => {
                    token.push(b'"');
                    self.pos += 2;
                }
                Some(b) => {
                    token.push(b);
                    self.pos += 1;
                }
            }
        }
    }
}

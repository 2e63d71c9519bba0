//! Command Handler
//!
//! Executes parsed commands against the storage engine and produces the reply
//! for the session to write back.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │   parse()   │───>│  dispatch() │───>│  Outcome    │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! │                            │                                │
//! │                            ▼                                │
//! │                      StorageEngine                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::commands::command::Command;
use crate::protocol::{Invocation, RespValue};
use crate::storage::{SetCondition, StorageEngine};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// The result of executing one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub reply: RespValue,
    /// False once the client asked to close the connection
    pub keep_open: bool,
}

impl Outcome {
    fn reply(reply: RespValue) -> Self {
        Self {
            reply,
            keep_open: true,
        }
    }

    fn close(reply: RespValue) -> Self {
        Self {
            reply,
            keep_open: false,
        }
    }

    /// The reply in wire format.
    pub fn encode(&self) -> Vec<u8> {
        self.reply.serialize()
    }
}

/// Executes commands against a shared storage engine.
///
/// Cheap to clone; every connection gets its own handle.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
}

impl CommandHandler {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        Self { storage }
    }

    /// Executes a decoded invocation.
    ///
    /// Command-level errors become `-ERR` replies and leave the connection
    /// open; only `QUIT` closes it.
    ///
    /// # Example
    ///
    /// ```
    /// use tidekv::commands::CommandHandler;
    /// use tidekv::storage::StorageEngine;
    /// use bytes::Bytes;
    /// use std::sync::Arc;
    ///
    /// let handler = CommandHandler::new(Arc::new(StorageEngine::new()));
    /// let outcome = handler.execute(vec![Bytes::from("DEL"), Bytes::from("nothing")]);
    /// assert_eq!(outcome.encode(), b":0\r\n");
    /// assert!(outcome.keep_open);
    /// ```
    pub fn execute(&self, invocation: Invocation) -> Outcome {
        match Command::parse(invocation) {
            Ok(command) => {
                trace!(command = command.name(), "Executing command");
                self.dispatch(command)
            }
            Err(e) => {
                trace!(error = %e, "Rejected command");
                Outcome::reply(e.to_resp())
            }
        }
    }

    fn dispatch(&self, command: Command) -> Outcome {
        match command {
            Command::Get { key } => Outcome::reply(self.cmd_get(&key)),
            Command::Set {
                key,
                value,
                condition,
                ttl,
            } => Outcome::reply(self.cmd_set(key, value, condition, ttl)),
            Command::Del { keys } => Outcome::reply(self.cmd_del(&keys)),
            Command::Quit => Outcome::close(RespValue::ok()),
            Command::Unsupported { name } => {
                debug!(command = %name, "Command not supported");
                Outcome::reply(RespValue::error(format!("ERR unknown command '{}'", name)))
            }
        }
    }

    /// GET key
    fn cmd_get(&self, key: &Bytes) -> RespValue {
        match self.storage.get(key) {
            Some(value) => match unquote(&value) {
                Some(inner) => RespValue::bulk_string(inner),
                None => RespValue::bulk_string(value),
            },
            None => RespValue::null(),
        }
    }

    /// SET key value [NX|XX] [EX seconds|PX milliseconds]
    fn cmd_set(
        &self,
        key: Bytes,
        value: Bytes,
        condition: SetCondition,
        ttl: Option<Duration>,
    ) -> RespValue {
        if self.storage.set_if(key, value, condition, ttl) {
            RespValue::ok()
        } else {
            RespValue::null()
        }
    }

    /// DEL key [key ...]
    fn cmd_del(&self, keys: &[Bytes]) -> RespValue {
        RespValue::integer(self.storage.delete_many(keys) as i64)
    }
}

/// Unwraps a value stored with its surrounding double quotes.
///
/// Returns `None` when the value is not quote-delimited or the text between
/// the quotes is not a well-formed escaped string; the caller then returns
/// the stored bytes as they are.
fn unquote(raw: &[u8]) -> Option<Vec<u8>> {
    let inner = raw.strip_prefix(b"\"")?.strip_suffix(b"\"")?;
    let mut out = Vec::with_capacity(inner.len());
    let mut bytes = inner.iter().copied();

    while let Some(b) = bytes.next() {
        match b {
            b'"' | b'\n' => return None,
            b'\\' => {
                let unescaped = match bytes.next()? {
                    b'a' => 0x07,
                    b'b' => 0x08,
                    b'f' => 0x0c,
                    b'n' => b'\n',
                    b'r' => b'\r',
                    b't' => b'\t',
                    b'v' => 0x0b,
                    b'\\' => b'\\',
                    b'\'' => b'\'',
                    b'"' => b'"',
                    b'x' => read_hex(&mut bytes, 2)? as u8,
                    // Three octal digits, at most \377
                    first @ b'0'..=b'7' => {
                        let mut n = u32::from(first - b'0');
                        for _ in 0..2 {
                            n = (n << 3) | u32::from(octal_value(bytes.next()?)?);
                        }
                        u8::try_from(n).ok()?
                    }
                    escape @ (b'u' | b'U') => {
                        let digits = if escape == b'u' { 4 } else { 8 };
                        // Surrogates and values past U+10FFFF are rejected
                        let c = char::from_u32(read_hex(&mut bytes, digits)?)?;
                        out.extend_from_slice(c.encode_utf8(&mut [0u8; 4]).as_bytes());
                        continue;
                    }
                    _ => return None,
                };
                out.push(unescaped);
            }
            other => out.push(other),
        }
    }

    Some(out)
}

/// Reads exactly `digits` hex digits.
fn read_hex(bytes: &mut impl Iterator<Item = u8>, digits: usize) -> Option<u32> {
    (0..digits).try_fold(0u32, |n, _| {
        Some((n << 4) | u32::from(hex_value(bytes.next()?)?))
    })
}

#[inline]
fn octal_value(b: u8) -> Option<u8> {
    matches!(b, b'0'..=b'7').then(|| b - b'0')
}

#[inline]
fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

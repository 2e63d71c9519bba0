//! Wire Protocol
//!
//! The request side is decoded from a buffered byte stream, the reply side is
//! encoded from [`RespValue`].
//!
//! ## Modules
//!
//! - `decoder`: Streaming decoder for inline and multi-bulk requests
//! - `types`: The `RespValue` reply type and its serialization
//!
//! ## Example
//!
//! ```
//! use tidekv::protocol::{RequestDecoder, RespValue};
//!
//! # tokio_test::block_on(async {
//! let mut decoder = RequestDecoder::new(&b"GET name\r\n"[..]);
//! let invocation = decoder.next_invocation().await.unwrap().unwrap();
//! assert_eq!(invocation, vec!["GET", "name"]);
//!
//! assert_eq!(RespValue::null().serialize(), b"$-1\r\n");
//! # });
//! ```

pub mod decoder;
pub mod types;

pub use decoder::{DecodeError, DecodeResult, DecoderLimits, Invocation, RequestDecoder};
pub use types::RespValue;

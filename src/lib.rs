//! # TideKV - An In-Memory Key-Value Server
//!
//! TideKV is a small key-value server that speaks the Redis request protocol.
//! Clients send commands either as multi-bulk arrays (what `redis-cli` and
//! client libraries send) or as plain inline text (what you type into
//! `telnet`), and get RESP replies back.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              TideKV                                     │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │                  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │                  │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘                  │
//! │                            │                  │                         │
//! │                            ▼                  ▼                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐   │
//! │  │  Request    │    │              StorageEngine                   │   │
//! │  │  Decoder    │    │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │   │
//! │  │ (inline +   │    │  │Shard 0 │ │Shard 1 │ │Shard 2 │ │...N    │ │   │
//! │  │ multi-bulk) │    │  │RwLock  │ │RwLock  │ │RwLock  │ │shards  │ │   │
//! │  └─────────────┘    │  └────────┘ └────────┘ └────────┘ └────────┘ │   │
//! │                     └──────────────────────────────────────────────┘   │
//! │                                  ▲                   ▲                  │
//! │                                  │                   │                  │
//! │                     ┌────────────┴──────┐  ┌─────────┴───────────────┐  │
//! │                     │  Expiry timers    │  │     ExpirySweeper       │  │
//! │                     │ (one task per TTL)│  │ (Background Tokio Task) │  │
//! │                     └───────────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use tidekv::commands::CommandHandler;
//! use tidekv::connection::{handle_connection, ConnectionStats};
//! use tidekv::protocol::DecoderLimits;
//! use tidekv::storage::{start_expiry_sweeper, StorageEngine};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let storage = Arc::new(StorageEngine::new());
//!     let _sweeper = start_expiry_sweeper(Arc::clone(&storage));
//!     let stats = Arc::new(ConnectionStats::new());
//!
//!     let listener = TcpListener::bind("127.0.0.1:6380").await?;
//!
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         let handler = CommandHandler::new(Arc::clone(&storage));
//!         let stats = Arc::clone(&stats);
//!
//!         tokio::spawn(handle_connection(
//!             stream,
//!             addr,
//!             handler,
//!             stats,
//!             DecoderLimits::default(),
//!         ));
//!     }
//! }
//! ```
//!
//! ## Supported Commands
//!
//! - `GET key`
//! - `SET key value [NX|XX] [EX seconds|PX milliseconds]`
//! - `DEL key [key ...]`
//! - `QUIT`
//!
//! Anything else is answered with `-ERR unknown command '<name>'`.
//!
//! ## Module Overview
//!
//! - [`protocol`]: request decoder and RESP reply types
//! - [`storage`]: sharded store, expiry timers and sweeper
//! - [`commands`]: command parsing and execution
//! - [`connection`]: per-client session loop
//! - [`config`]: command-line configuration
//!
//! ## Expiry
//!
//! A key written with `EX`/`PX` disappears in three ways:
//! 1. **Lazy**: reads treat it as absent once its deadline has passed
//! 2. **Timer**: a task armed by the write removes it when the TTL elapses
//! 3. **Active**: the sweeper periodically reclaims anything still left
//!
//! See [`storage::ExpiryMode`] for how timers treat keys that were
//! overwritten before they fired.

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod storage;

pub use commands::CommandHandler;
pub use config::ServerConfig;
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{DecodeError, RequestDecoder, RespValue};
pub use storage::{start_expiry_sweeper, ExpiryConfig, ExpiryMode, ExpirySweeper, StorageEngine};

/// The default port TideKV listens on
pub const DEFAULT_PORT: u16 = 6380;

/// The default host TideKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of TideKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

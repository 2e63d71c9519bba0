//! Storage Engine Module
//!
//! A thread-safe, sharded key-value store with per-key expiry, the timers
//! that enforce expiry, and a background sweeper.
//!
//! ## Features
//!
//! - **Sharded Storage**: 64 independent shards reduce lock contention
//! - **Linearizable per key**: each operation runs under one shard lock
//! - **Lazy Expiry**: expired keys read as absent and are removed on access
//! - **Expiry Timers**: one short-lived task per expiring write
//! - **Active Expiry**: a background sweeper reclaims anything left behind
//!
//! ## Example
//!
//! ```
//! use tidekv::storage::{SetCondition, StorageEngine};
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! let engine = StorageEngine::new();
//!
//! engine.set(Bytes::from("name"), Bytes::from("tide"), None);
//! assert_eq!(engine.get(&Bytes::from("name")), Some(Bytes::from("tide")));
//!
//! // NX: only written if absent
//! let written = engine.set_if(
//!     Bytes::from("name"),
//!     Bytes::from("other"),
//!     SetCondition::IfAbsent,
//!     Some(Duration::from_secs(60)),
//! );
//! assert!(!written);
//! ```

pub mod engine;
pub mod expiry;

pub use engine::{Entry, SetCondition, StorageEngine, StorageStats};
pub use expiry::{start_expiry_sweeper, ExpiryConfig, ExpiryMode, ExpirySweeper};

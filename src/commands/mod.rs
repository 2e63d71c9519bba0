//! Command Engine
//!
//! Receives decoded invocations, executes them against the storage engine,
//! and returns the reply along with whether the connection stays open.
//!
//! ```text
//! Invocation ──> Command::parse ──> CommandHandler::dispatch ──> Outcome
//!                                          │
//!                                          ▼
//!                                    StorageEngine
//! ```
//!
//! ## Supported Commands
//!
//! - `GET key`
//! - `SET key value [NX|XX] [EX seconds|PX milliseconds]`
//! - `DEL key [key ...]`
//! - `QUIT`

pub mod command;
pub mod handler;

pub use command::{Command, CommandError};
pub use handler::{CommandHandler, Outcome};

//! Connection Handler
//!
//! Runs one client session: decode a request, execute it, write the reply,
//! repeat. Requests on a connection are handled strictly one at a time, in
//! arrival order.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects
//!        │
//!        ▼
//! 2. ConnectionHandler spawned
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │  next_invocation()           │──── EOF / I/O error ────┐
//!    │        │                     │                         │
//!    │        │  protocol error ────┼── write -ERR, close ────┤
//!    │        ▼                     │                         │
//!    │  CommandHandler::execute()   │                         │
//!    │        │                     │                         │
//!    │        ▼                     │                         │
//!    │  write + flush reply         │                         │
//!    │        │                     │                         │
//!    │        ├── QUIT ─────────────┼─────────────────────────┤
//!    │        ▼                     │                         │
//!    │   [Loop back]                │                         │
//!    └──────────────────────────────┘                         │
//!                                                             ▼
//! 4. Handler task ends, connection closed
//! ```

use crate::commands::CommandHandler;
use crate::protocol::{DecodeError, DecoderLimits, RequestDecoder, RespValue};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Read buffer capacity per connection
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Connections closed because of a malformed request
    pub protocol_errors: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Network failure, or the peer went away mid-request
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed request; the client has been told before closing
    #[error("Protocol error: {0}")]
    Protocol(DecodeError),
}

/// Handles a single client connection.
pub struct ConnectionHandler<S> {
    decoder: RequestDecoder<BufReader<ReadHalf<S>>>,
    writer: BufWriter<WriteHalf<S>>,
    /// Client's address (for logging)
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
}

impl<S: AsyncRead + AsyncWrite> ConnectionHandler<S> {
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `stream` - The client byte stream
    /// * `addr` - The client's socket address
    /// * `command_handler` - The command handler for executing commands
    /// * `stats` - Shared connection statistics
    /// * `limits` - Request size limits for the decoder
    pub fn new(
        stream: S,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
        limits: DecoderLimits,
    ) -> Self {
        stats.connection_opened();

        let (read_half, write_half) = tokio::io::split(stream);

        Self {
            decoder: RequestDecoder::with_limits(
                BufReader::with_capacity(READ_BUFFER_SIZE, read_half),
                limits,
            ),
            writer: BufWriter::new(write_half),
            addr,
            command_handler,
            stats,
        }
    }

    /// Runs the session until the client quits, disconnects, or sends a
    /// malformed request.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected"),
            Err(ConnectionError::IoError(io_err))
                if matches!(
                    io_err.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::UnexpectedEof
                ) =>
            {
                debug!(client = %self.addr, error = %io_err, "Connection dropped by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }

        // Best effort: the peer may already be gone
        let _ = self.writer.shutdown().await;
        self.stats.connection_closed();
        result
    }

    /// The main read-execute-respond loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let invocation = match self.decoder.next_invocation().await {
                Ok(Some(invocation)) => invocation,
                Ok(None) => return Ok(()),
                Err(DecodeError::Io(e)) => return Err(ConnectionError::IoError(e)),
                Err(e) => {
                    self.stats.protocol_error();
                    self.send_response(&RespValue::error(format!("ERR {}", e)))
                        .await?;
                    return Err(ConnectionError::Protocol(e));
                }
            };

            let outcome = self.command_handler.execute(invocation);
            self.stats.command_processed();
            self.send_response(&outcome.reply).await?;

            if !outcome.keep_open {
                debug!(client = %self.addr, "Client requested close");
                return Ok(());
            }
        }
    }

    /// Sends a response to the client.
    async fn send_response(&mut self, response: &RespValue) -> Result<(), ConnectionError> {
        let bytes = response.serialize();
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        self.stats.bytes_written(bytes.len());
        trace!(client = %self.addr, bytes = bytes.len(), "Sent response");
        Ok(())
    }
}

/// Serves one accepted TCP connection to completion.
///
/// Errors are logged by the handler and otherwise dropped; they never affect
/// other connections.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    limits: DecoderLimits,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(client = %addr, error = %e, "Failed to disable Nagle");
    }
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats, limits);
    let _ = handler.run().await;
}

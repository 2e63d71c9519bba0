//! Server configuration, parsed from the command line.

use crate::protocol::decoder::{DecoderLimits, MAX_BULK_SIZE, MAX_LINE_LENGTH};
use crate::storage::{ExpiryConfig, ExpiryMode};
use clap::Parser;
use std::time::Duration;

/// TideKV server
#[derive(Parser, Debug, Clone)]
#[command(name = "tidekv")]
#[command(about = "In-memory key-value server speaking the Redis request protocol")]
#[command(version)]
pub struct ServerConfig {
    /// Host to bind to
    #[arg(long, default_value = crate::DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = crate::DEFAULT_PORT)]
    pub port: u16,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// How expiry timers treat keys overwritten before they fire
    #[arg(long, default_value_t = ExpiryMode::Detached)]
    pub expiry_mode: ExpiryMode,

    /// Base interval of the background expiry sweeper, in milliseconds
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..))]
    pub sweep_interval_ms: u64,

    /// Longest accepted request line, in bytes
    #[arg(long, default_value_t = MAX_LINE_LENGTH)]
    pub max_line_length: usize,

    /// Largest accepted bulk argument, in bytes
    #[arg(long, default_value_t = MAX_BULK_SIZE)]
    pub max_bulk_length: usize,
}

impl ServerConfig {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Sweeper settings, with the base interval taken from the command line.
    pub fn expiry_config(&self) -> ExpiryConfig {
        let defaults = ExpiryConfig::default();
        let base_interval = Duration::from_millis(self.sweep_interval_ms);
        ExpiryConfig {
            base_interval,
            min_interval: defaults.min_interval.min(base_interval),
            max_interval: defaults.max_interval.max(base_interval),
            ..defaults
        }
    }

    pub fn decoder_limits(&self) -> DecoderLimits {
        DecoderLimits {
            max_line_len: self.max_line_length,
            max_bulk_len: self.max_bulk_length,
            ..DecoderLimits::default()
        }
    }
}

//! Key Expiry
//!
//! Expired keys are removed in three ways:
//!
//! 1. **Lazy**: a read that finds an expired entry removes it.
//! 2. **Timers**: every write with a TTL spawns a short-lived task that
//!    sleeps until the deadline and then removes the key.
//! 3. **Sweeper**: a background task periodically scans every shard, so keys
//!    whose timer could not be spawned are still reclaimed.
//!
//! ## Timer Modes
//!
//! Timers cannot be cancelled. What a timer removes when it fires depends on
//! [`ExpiryMode`]:
//!
//! - `Detached` removes the key unconditionally. A key re-SET before an old
//!   timer fires is removed by that old timer, newer value included.
//! - `Tracked` removes the key only if it still holds the value written
//!   together with the timer. Overwrites and deletes disarm it.

use crate::storage::engine::Keyspace;
use crate::storage::StorageEngine;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// What a scheduled expiry removes when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpiryMode {
    /// Remove the key whatever it holds by then
    #[default]
    Detached,
    /// Remove the key only if the write that armed the timer is still current
    Tracked,
}

impl FromStr for ExpiryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "detached" => Ok(ExpiryMode::Detached),
            "tracked" => Ok(ExpiryMode::Tracked),
            other => Err(format!(
                "unknown expiry mode '{}' (expected 'detached' or 'tracked')",
                other
            )),
        }
    }
}

impl fmt::Display for ExpiryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpiryMode::Detached => write!(f, "detached"),
            ExpiryMode::Tracked => write!(f, "tracked"),
        }
    }
}

/// Spawns a task that removes `key` once `ttl` has elapsed.
///
/// Needs a Tokio runtime. Without one no task is spawned and the key is left
/// to lazy expiry and the sweeper.
pub(crate) fn schedule_removal(
    keyspace: Weak<Keyspace>,
    key: Bytes,
    generation: u64,
    ttl: Duration,
    mode: ExpiryMode,
) {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            warn!(
                ttl_ms = ttl.as_millis() as u64,
                "No runtime available, expiry timer not scheduled"
            );
            return;
        }
    };

    handle.spawn(async move {
        tokio::time::sleep(ttl).await;

        // The engine may be gone by now
        let Some(keyspace) = keyspace.upgrade() else {
            return;
        };
        if keyspace.remove_scheduled(&key, generation, mode) {
            trace!(key = ?key, generation, "Expiry timer removed key");
        }
    });
}

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Base interval between sweeps (default: 100ms)
    pub base_interval: Duration,

    /// Minimum interval between sweeps (default: 10ms)
    pub min_interval: Duration,

    /// Maximum interval between sweeps (default: 1s)
    pub max_interval: Duration,

    /// If this fraction of scanned keys are expired, speed up sweeping
    pub speedup_threshold: f64,

    /// If this fraction of scanned keys are expired, slow down sweeping
    pub slowdown_threshold: f64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            speedup_threshold: 0.25,
            slowdown_threshold: 0.01,
        }
    }
}

/// A handle to the running expiry sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Starts the expiry sweeper as a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let interval_ms = config.base_interval.as_millis() as u64;

        tokio::spawn(sweeper_loop(engine, config, shutdown_rx));

        info!(interval_ms, "Background expiry sweeper started");

        Self { shutdown_tx }
    }

    /// Stops the expiry sweeper.
    pub fn stop(&self) {
        if self.shutdown_tx.send(true).is_ok() {
            info!("Background expiry sweeper stopped");
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    engine: Arc<StorageEngine>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut current_interval = config.base_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(current_interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry sweeper received shutdown signal");
                    return;
                }
            }
        }

        let keys_before = engine.len();
        let expired = engine.cleanup_expired();

        if keys_before > 0 {
            let expiry_rate = expired as f64 / keys_before as f64;

            if expiry_rate > config.speedup_threshold {
                current_interval = (current_interval / 2).max(config.min_interval);
                debug!(
                    expired = expired,
                    rate = %format!("{:.2}%", expiry_rate * 100.0),
                    new_interval_ms = current_interval.as_millis() as u64,
                    "High expiry rate, speeding up sweeper"
                );
            } else if expiry_rate < config.slowdown_threshold && expired == 0 {
                current_interval = (current_interval * 2).min(config.max_interval);
                trace!(
                    new_interval_ms = current_interval.as_millis() as u64,
                    "Low expiry rate, slowing down sweeper"
                );
            }
        }

        if expired > 0 {
            debug!(
                expired = expired,
                keys_remaining = engine.len(),
                "Expired keys cleaned up"
            );
        }
    }
}

/// Starts the expiry sweeper with default configuration.
pub fn start_expiry_sweeper(engine: Arc<StorageEngine>) -> ExpirySweeper {
    ExpirySweeper::start(engine, ExpiryConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("detached".parse::<ExpiryMode>(), Ok(ExpiryMode::Detached));
        assert_eq!("TRACKED".parse::<ExpiryMode>(), Ok(ExpiryMode::Tracked));
        assert!("lazy".parse::<ExpiryMode>().is_err());
        assert_eq!(ExpiryMode::Tracked.to_string(), "tracked");
    }

    #[tokio::test]
    async fn test_timer_removes_key_without_access() {
        let engine = StorageEngine::new();
        engine.set(b("temp"), b("v"), Some(Duration::from_millis(30)));
        assert_eq!(engine.len(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(engine.len(), 0);
        assert_eq!(engine.stats().expired, 1);
    }

    // Stale timers are not cancelled in detached mode: the first timer
    // removes the value written after it was armed.
    #[tokio::test]
    async fn test_detached_stale_timer_removes_newer_value() {
        let engine = StorageEngine::with_mode(ExpiryMode::Detached);
        engine.set(b("k"), b("old"), Some(Duration::from_millis(30)));
        engine.set(b("k"), b("new"), Some(Duration::from_secs(60)));

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(engine.get(&b("k")), None);
        assert_eq!(engine.len(), 0);
    }

    #[tokio::test]
    async fn test_detached_stale_timer_removes_key_set_again_after_delete() {
        let engine = StorageEngine::with_mode(ExpiryMode::Detached);
        engine.set(b("k"), b("old"), Some(Duration::from_millis(30)));
        assert!(engine.delete(&b("k")));
        engine.set(b("k"), b("fresh"), None);
        assert!(engine.get_entry(&b("k")).unwrap().expires_at.is_none());

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(engine.get(&b("k")), None);
    }

    #[tokio::test]
    async fn test_tracked_overwrite_disarms_old_timer() {
        let engine = StorageEngine::with_mode(ExpiryMode::Tracked);
        engine.set(b("k"), b("old"), Some(Duration::from_millis(30)));
        engine.set(b("k"), b("new"), Some(Duration::from_secs(60)));

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(engine.get(&b("k")), Some(b("new")));
    }

    #[tokio::test]
    async fn test_tracked_delete_disarms_old_timer() {
        let engine = StorageEngine::with_mode(ExpiryMode::Tracked);
        engine.set(b("k"), b("old"), Some(Duration::from_millis(30)));
        assert!(engine.delete(&b("k")));
        engine.set(b("k"), b("fresh"), None);

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(engine.get(&b("k")), Some(b("fresh")));
    }

    #[tokio::test]
    async fn test_timer_outliving_engine_is_harmless() {
        let engine = StorageEngine::new();
        engine.set(b("k"), b("v"), Some(Duration::from_millis(10)));
        drop(engine);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_sweeper_cleans_expired_keys() {
        let engine = Arc::new(StorageEngine::new());

        // Written off-runtime so no timers are armed; only the sweeper can
        // remove these.
        let writer = Arc::clone(&engine);
        std::thread::spawn(move || {
            for i in 0..10 {
                writer.set(
                    b(&format!("key{}", i)),
                    b("v"),
                    Some(Duration::from_millis(30)),
                );
            }
            writer.set(b("persistent"), b("value"), None);
        })
        .join()
        .unwrap();
        assert_eq!(engine.len(), 11);

        let config = ExpiryConfig {
            base_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let _sweeper = ExpirySweeper::start(Arc::clone(&engine), config);

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(engine.len(), 1);
        assert!(engine.exists(&b("persistent")));
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_drop() {
        let engine = Arc::new(StorageEngine::new());
        let config = ExpiryConfig {
            base_interval: Duration::from_millis(10),
            ..Default::default()
        };

        {
            let _sweeper = ExpirySweeper::start(Arc::clone(&engine), config);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        engine.set(b("k"), b("v"), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.len(), 1);
    }
}

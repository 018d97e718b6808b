//! Background Expiry Sweeper
//!
//! Reads already hide expired entries, so this task only exists to reclaim
//! memory held by keys nobody reads again. It wakes periodically, removes
//! expired entries shard by shard, and idles longer while nothing expires.
//!
//! The sweeper judges each entry by the deadline it carries at sweep time.
//! A key rewritten after being given a TTL is therefore never removed early.

use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Timing for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Delay after a sweep that removed something
    pub interval: Duration,

    /// Longest delay reached while sweeps keep coming back empty
    pub idle_interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            idle_interval: Duration::from_secs(1),
        }
    }
}

/// Handle to the running sweeper; dropping it stops the task.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Spawns the sweeper on the current Tokio runtime.
    pub fn start(engine: Arc<StorageEngine>, config: SweepConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(sweep_loop(engine, config, shutdown_rx));
        info!("Expiry sweeper started");
        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        if !*self.shutdown_tx.borrow() {
            let _ = self.shutdown_tx.send(true);
            debug!("Expiry sweeper stopped");
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweep_loop(
    engine: Arc<StorageEngine>,
    config: SweepConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut delay = config.interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }

        let removed = engine.cleanup_expired();
        if removed > 0 {
            debug!(removed, remaining = engine.len(), "Swept expired keys");
            delay = config.interval;
        } else {
            delay = (delay * 2).min(config.idle_interval);
            trace!(next_sweep_ms = delay.as_millis() as u64, "Nothing to sweep");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn fast() -> SweepConfig {
        SweepConfig {
            interval: Duration::from_millis(10),
            idle_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_sweeper_reclaims_expired_keys() {
        let engine = Arc::new(StorageEngine::new());
        for i in 0..10 {
            engine.set(
                Bytes::from(format!("key{}", i)),
                Bytes::from("value"),
                Some(Duration::from_millis(30)),
            );
        }
        engine.set(Bytes::from("persistent"), Bytes::from("value"), None);
        assert_eq!(engine.len(), 11);

        let _sweeper = ExpirySweeper::start(Arc::clone(&engine), fast());
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Nothing was read, so only the sweeper can have removed them.
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.expired_total(), 10);
    }

    #[tokio::test]
    async fn test_sweeper_keeps_rewritten_key() {
        let engine = Arc::new(StorageEngine::new());
        engine.set(Bytes::from("k"), Bytes::from("old"), Some(Duration::from_millis(20)));
        engine.set(Bytes::from("k"), Bytes::from("new"), None);

        let _sweeper = ExpirySweeper::start(Arc::clone(&engine), fast());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(engine.get(&Bytes::from("k")), Some(Bytes::from("new")));
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_drop() {
        let engine = Arc::new(StorageEngine::new());
        {
            let _sweeper = ExpirySweeper::start(Arc::clone(&engine), fast());
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        engine.set(Bytes::from("key"), Bytes::from("value"), Some(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Still physically present; only a read removes it now.
        assert_eq!(engine.len(), 1);
        assert!(engine.get(&Bytes::from("key")).is_none());
        assert_eq!(engine.len(), 0);
    }
}

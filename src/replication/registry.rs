//! Leader-side replica registry.
//!
//! Every replica that completed `PSYNC` owns an unbounded channel; the
//! connection task serving it drains the channel to the socket. Writes are
//! committed through [`ReplicaRegistry::commit`], which holds the registry
//! lock while it mutates the store, advances the offset and queues the frame,
//! so every replica sees writes in the order they were applied.
//!
//! ```text
//!   SET ──> commit ──┬──> store.set
//!                    ├──> offset += frame.len()
//!                    └──> tx[0..n].send(frame)  ──> replica connection tasks
//! ```

use crate::snapshot::EMPTY_SNAPSHOT;
use crate::storage::StorageEngine;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type ReplicaId = u64;

/// Live replicas of this leader.
#[derive(Debug)]
pub struct ReplicaRegistry {
    replicas: Mutex<HashMap<ReplicaId, mpsc::UnboundedSender<Bytes>>>,
    next_id: AtomicU64,
    /// Payload sent after FULLRESYNC
    snapshot: Bytes,
}

/// A registered replica's end of the propagation channel.
///
/// Dropping it removes the replica from the registry.
#[derive(Debug)]
pub struct ReplicaSubscription {
    pub id: ReplicaId,
    /// Replication id at the moment of registration
    pub replication_id: String,
    /// Offset at the moment of registration; queued frames start after it
    pub offset: u64,
    rx: mpsc::UnboundedReceiver<Bytes>,
    registry: Arc<ReplicaRegistry>,
}

impl ReplicaSubscription {
    /// Next propagated frame, or `None` once the registry dropped this replica.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// A frame that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ReplicaSubscription {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

impl ReplicaRegistry {
    /// Creates a registry serving `snapshot` to new replicas, or the empty
    /// snapshot when none was loaded.
    pub fn new(snapshot: Option<Bytes>) -> Self {
        Self {
            replicas: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            snapshot: snapshot.unwrap_or_else(|| Bytes::from_static(EMPTY_SNAPSHOT)),
        }
    }

    pub fn snapshot(&self) -> Bytes {
        self.snapshot.clone()
    }

    /// Registers a new replica.
    ///
    /// The replication id and offset are read under the registry lock, so the
    /// subscription receives exactly the writes committed after that offset.
    pub fn subscribe(self: &Arc<Self>, storage: &StorageEngine) -> ReplicaSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut replicas = self.replicas.lock().unwrap();
        let replication_id = storage.replication_id().unwrap_or_default();
        let offset = storage.replication_offset();
        replicas.insert(id, tx);
        info!(replica = id, offset, replicas = replicas.len(), "Replica registered");

        ReplicaSubscription {
            id,
            replication_id,
            offset,
            rx,
            registry: Arc::clone(self),
        }
    }

    pub fn unregister(&self, id: ReplicaId) {
        let mut replicas = self.replicas.lock().unwrap();
        if replicas.remove(&id).is_some() {
            info!(replica = id, replicas = replicas.len(), "Replica unregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.replicas.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies a write and propagates `frame` to every registered replica.
    ///
    /// Replicas whose channel is closed are dropped. Never blocks on a replica.
    pub fn commit<F>(&self, storage: &StorageEngine, frame: Bytes, apply: F)
    where
        F: FnOnce(),
    {
        let mut replicas = self.replicas.lock().unwrap();

        apply();

        if let Err(e) = storage.advance_replication_offset(frame.len()) {
            warn!(error = %e, "Failed to advance replication offset");
        }

        let before = replicas.len();
        replicas.retain(|_, tx| tx.send(frame.clone()).is_ok());
        if replicas.len() < before {
            debug!(dropped = before - replicas.len(), "Dropped closed replica channels");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leader_store() -> StorageEngine {
        let storage = StorageEngine::new();
        storage.set_replication_meta("abc", 0);
        storage
    }

    #[tokio::test]
    async fn test_commit_fans_out_in_order() {
        let storage = leader_store();
        let registry = Arc::new(ReplicaRegistry::new(None));
        let mut first = registry.subscribe(&storage);
        let mut second = registry.subscribe(&storage);
        assert_eq!(registry.len(), 2);

        for i in 0..5 {
            let frame = Bytes::from(format!("frame-{}", i));
            registry.commit(&storage, frame, || {
                storage.set(Bytes::from(format!("k{}", i)), Bytes::from("v"), None);
            });
        }

        for sub in [&mut first, &mut second] {
            for i in 0..5 {
                assert_eq!(sub.recv().await, Some(Bytes::from(format!("frame-{}", i))));
            }
        }
        assert_eq!(storage.keys("*").unwrap().len(), 5);
    }

    #[test]
    fn test_commit_advances_offset_by_frame_length() {
        let storage = leader_store();
        let registry = ReplicaRegistry::new(None);

        registry.commit(&storage, Bytes::from_static(b"0123456789"), || {});
        registry.commit(&storage, Bytes::from_static(b"abc"), || {});
        assert_eq!(storage.replication_offset(), 13);
    }

    #[test]
    fn test_subscription_captures_offset() {
        let storage = leader_store();
        let registry = Arc::new(ReplicaRegistry::new(None));
        registry.commit(&storage, Bytes::from_static(b"1234"), || {});

        let sub = registry.subscribe(&storage);
        assert_eq!(sub.replication_id, "abc");
        assert_eq!(sub.offset, 4);
    }

    #[test]
    fn test_drop_unregisters() {
        let storage = leader_store();
        let registry = Arc::new(ReplicaRegistry::new(None));
        let sub = registry.subscribe(&storage);
        assert_eq!(registry.len(), 1);

        drop(sub);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_closed_channel_is_pruned() {
        let storage = leader_store();
        let registry = Arc::new(ReplicaRegistry::new(None));
        let sub = registry.subscribe(&storage);

        // Simulate a channel that died without its subscription unregistering.
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        registry.replicas.lock().unwrap().insert(99, tx);
        assert_eq!(registry.len(), 2);

        registry.commit(&storage, Bytes::from_static(b"x"), || {});
        assert_eq!(registry.len(), 1);
        drop(sub);
    }

    #[test]
    fn test_snapshot_defaults_to_empty() {
        let registry = ReplicaRegistry::new(None);
        assert_eq!(&registry.snapshot()[..], EMPTY_SNAPSHOT);

        let loaded = Bytes::from_static(b"REDIS0011\xfe\x00\x00\x00\x00\xff");
        let registry = ReplicaRegistry::new(Some(loaded.clone()));
        assert_eq!(registry.snapshot(), loaded);
    }
}

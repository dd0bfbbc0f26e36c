//! Snapshot publication
//!
//! Queries clone the current `Arc` and keep reading it for their whole
//! lifetime, so a re-index never changes what an in-flight query sees.
//! Writers serialize on a separate mutex: build off to the side, then swap.
//!
//! Chunks dropped by a publish stay "retired" until no reader holds a
//! snapshot containing them; only then are their ids handed out by
//! [`IndexHandle::reclaim`] for vector deletion.

use super::HierarchicalIndex;
use lodestar_common::models::ChunkId;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

/// Chunks a publish dropped, tied to the snapshot that still had them
struct Retired {
    snapshot: Weak<HierarchicalIndex>,
    chunks: Vec<ChunkId>,
}

pub struct IndexHandle {
    current: RwLock<Arc<HierarchicalIndex>>,
    writer: Mutex<()>,
    retired: Mutex<Vec<Retired>>,
}

impl IndexHandle {
    pub fn new(index: HierarchicalIndex) -> Self {
        Self {
            current: RwLock::new(Arc::new(index)),
            writer: Mutex::new(()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// The live snapshot
    pub async fn snapshot(&self) -> Arc<HierarchicalIndex> {
        self.current.read().await.clone()
    }

    /// Exclusive right to build and publish the next version
    pub async fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    /// Writer lock if nobody holds it
    pub fn try_lock_writer(&self) -> Option<MutexGuard<'_, ()>> {
        self.writer.try_lock().ok()
    }

    /// Swap in a new snapshot; the caller should hold the writer lock
    ///
    /// Chunks of the previous snapshot missing from the new one are retired
    /// rather than forgotten.
    pub async fn publish(&self, index: HierarchicalIndex) -> Arc<HierarchicalIndex> {
        let next = Arc::new(index);
        let previous = {
            let mut guard = self.current.write().await;
            std::mem::replace(&mut *guard, next.clone())
        };

        let live = next.chunk_ids();
        let dropped: Vec<ChunkId> = previous
            .chunk_ids()
            .into_iter()
            .filter(|id| !live.contains(id))
            .collect();
        if !dropped.is_empty() {
            self.retired.lock().await.push(Retired {
                snapshot: Arc::downgrade(&previous),
                chunks: dropped,
            });
        }

        info!(
            previous_version = previous.version(),
            version = next.version(),
            chunks = next.chunk_count(),
            "Index snapshot published"
        );
        next
    }

    /// Number of publishes whose dropped chunks are not reclaimed yet
    pub async fn retired_count(&self) -> usize {
        self.retired.lock().await.len()
    }

    /// Retired chunk ids that no live or held snapshot contains any more
    ///
    /// The caller should hold the writer lock until it has acted on the ids,
    /// so a concurrent publish cannot bring one of them back in between.
    pub async fn reclaim(&self) -> Vec<ChunkId> {
        let mut retired = self.retired.lock().await;
        if retired.is_empty() {
            return Vec::new();
        }

        let (released, pending): (Vec<Retired>, Vec<Retired>) = std::mem::take(&mut *retired)
            .into_iter()
            .partition(|r| r.snapshot.strong_count() == 0);
        *retired = pending;
        if released.is_empty() {
            return Vec::new();
        }

        let live = self.snapshot().await;
        let held: Vec<Arc<HierarchicalIndex>> = retired.iter().filter_map(|r| r.snapshot.upgrade()).collect();
        let reclaimable: BTreeSet<ChunkId> = released
            .into_iter()
            .flat_map(|r| r.chunks)
            .filter(|id| live.chunk_index(id).is_none() && held.iter().all(|h| h.chunk_index(id).is_none()))
            .collect();

        debug!(
            reclaimable = reclaimable.len(),
            still_held = retired.len(),
            "Reclaimed retired chunks"
        );
        reclaimable.into_iter().collect()
    }
}

//! Process-local checkpoint store for tests and embedded hosts.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::flow::FlowId;

use super::{CheckpointStore, StoreTransaction};

#[derive(Default)]
struct Inner {
    checkpoints: HashMap<FlowId, Vec<u8>>,
    deduplication_ids: HashSet<String>,
    /// Every commit fails with a transient storage error while set; used to
    /// exercise crash and retry paths.
    fail_commits: bool,
    /// Per-flow history of persisted suspend sequences, for invariant checks.
    persist_log: Vec<(FlowId, Vec<u8>)>,
    removed: Vec<FlowId>,
}

/// In-memory checkpoint store.
///
/// Clones share the same underlying state, so handing a clone to a second
/// manager instance models a process restart against surviving storage.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent commit fail with a transient storage error.
    pub fn fail_commits(&self, fail: bool) {
        self.lock().fail_commits = fail;
    }

    /// The committed checkpoint blob for a flow, if any.
    pub fn checkpoint_blob(&self, flow_id: FlowId) -> Option<Vec<u8>> {
        self.lock().checkpoints.get(&flow_id).cloned()
    }

    /// Number of committed checkpoints currently stored.
    pub fn checkpoint_count(&self) -> usize {
        self.lock().checkpoints.len()
    }

    /// Ids of flows with a committed checkpoint.
    pub fn stored_flows(&self) -> Vec<FlowId> {
        self.lock().checkpoints.keys().copied().collect()
    }

    /// Every committed checkpoint write (adds and updates), in commit order.
    pub fn persisted_blobs(&self, flow_id: FlowId) -> Vec<Vec<u8>> {
        self.lock()
            .persist_log
            .iter()
            .filter(|(id, _)| *id == flow_id)
            .map(|(_, blob)| blob.clone())
            .collect()
    }

    /// Flows whose checkpoints have been removed, in removal order.
    pub fn removed_flows(&self) -> Vec<FlowId> {
        self.lock().removed.clone()
    }

    /// Whether a deduplication key has been committed as processed.
    pub fn has_deduplication_id(&self, id: &str) -> bool {
        self.lock().deduplication_ids.contains(id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CheckpointStore for InMemoryStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(InMemoryTransaction {
            store: self.clone(),
            staged: Vec::new(),
        })
    }
}

enum Staged {
    Put(FlowId, Vec<u8>),
    Remove(FlowId),
    Dedup(Vec<String>),
}

/// A staged-writes transaction over [`InMemoryStore`].
pub struct InMemoryTransaction {
    store: InMemoryStore,
    staged: Vec<Staged>,
}

impl InMemoryTransaction {
    fn staged_view(&self, flow_id: FlowId) -> Option<Option<Vec<u8>>> {
        // Latest staged operation wins.
        for op in self.staged.iter().rev() {
            match op {
                Staged::Put(id, blob) if *id == flow_id => return Some(Some(blob.clone())),
                Staged::Remove(id) if *id == flow_id => return Some(None),
                _ => {}
            }
        }
        None
    }
}

impl StoreTransaction for InMemoryTransaction {
    async fn add(&mut self, flow_id: FlowId, blob: Vec<u8>) -> Result<()> {
        self.staged.push(Staged::Put(flow_id, blob));
        Ok(())
    }

    async fn update(&mut self, flow_id: FlowId, blob: Vec<u8>) -> Result<()> {
        self.staged.push(Staged::Put(flow_id, blob));
        Ok(())
    }

    async fn remove(&mut self, flow_id: FlowId) -> Result<()> {
        self.staged.push(Staged::Remove(flow_id));
        Ok(())
    }

    async fn get(&mut self, flow_id: FlowId) -> Result<Option<Vec<u8>>> {
        if let Some(view) = self.staged_view(flow_id) {
            return Ok(view);
        }
        Ok(self.store.lock().checkpoints.get(&flow_id).cloned())
    }

    async fn list(&mut self) -> Result<Vec<(FlowId, Vec<u8>)>> {
        let mut all: HashMap<FlowId, Vec<u8>> = self.store.lock().checkpoints.clone();
        for op in &self.staged {
            match op {
                Staged::Put(id, blob) => {
                    all.insert(*id, blob.clone());
                }
                Staged::Remove(id) => {
                    all.remove(id);
                }
                Staged::Dedup(_) => {}
            }
        }
        Ok(all.into_iter().collect())
    }

    async fn record_deduplication_ids(&mut self, ids: &[String]) -> Result<()> {
        self.staged.push(Staged::Dedup(ids.to_vec()));
        Ok(())
    }

    async fn is_duplicate(&mut self, id: &str) -> Result<bool> {
        if self
            .staged
            .iter()
            .any(|op| matches!(op, Staged::Dedup(ids) if ids.iter().any(|i| i == id)))
        {
            return Ok(true);
        }
        Ok(self.store.lock().deduplication_ids.contains(id))
    }

    async fn commit(self) -> Result<()> {
        let mut inner = self.store.lock();
        if inner.fail_commits {
            return Err(Error::storage_transient("injected commit failure"));
        }
        for op in self.staged {
            match op {
                Staged::Put(id, blob) => {
                    inner.persist_log.push((id, blob.clone()));
                    inner.checkpoints.insert(id, blob);
                }
                Staged::Remove(id) => {
                    inner.checkpoints.remove(&id);
                    inner.removed.push(id);
                }
                Staged::Dedup(ids) => inner.deduplication_ids.extend(ids),
            }
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        // Staged operations are simply dropped.
        Ok(())
    }
}

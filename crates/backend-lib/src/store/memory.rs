// ============================
// crates/backend-lib/src/store/memory.rs
// ============================
//! In-memory store implementation.
//!
//! Transactions serialize on the document-tree lock, so commits are
//! atomic and watchers observe changes in commit order. Suitable for a
//! single coordination-layer instance and for tests; a multi-instance
//! deployment swaps in a remote backend behind the same trait.

use super::{
    parent_collection, ChangeEvent, ChangeKind, SnapshotMode, Store, StoreError, Subscription, Txn,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

struct Watcher {
    collection: String,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

struct Inner {
    docs: Mutex<BTreeMap<String, Value>>,
    watchers: DashMap<u64, Watcher>,
    next_watcher_id: AtomicU64,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                docs: Mutex::new(BTreeMap::new()),
                watchers: DashMap::new(),
                next_watcher_id: AtomicU64::new(1),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl MemoryStore {
    pub(crate) fn watcher_count(&self) -> usize {
        self.inner.watchers.len()
    }
}

impl Inner {
    /// Apply a committed write set and notify watchers, in path order.
    /// Caller holds the docs lock, so watchers see commits in order.
    fn apply(&self, docs: &mut BTreeMap<String, Value>, writes: BTreeMap<String, Option<Value>>) {
        for (path, staged) in writes {
            let event = match (docs.get(&path), staged) {
                (None, Some(data)) => {
                    docs.insert(path.clone(), data.clone());
                    Some((ChangeKind::Added, data))
                },
                (Some(prior), Some(data)) => {
                    if *prior == data {
                        None
                    } else {
                        docs.insert(path.clone(), data.clone());
                        Some((ChangeKind::Modified, data))
                    }
                },
                (Some(_), None) => {
                    let last = docs.remove(&path).unwrap_or(Value::Null);
                    Some((ChangeKind::Removed, last))
                },
                (None, None) => None,
            };
            if let Some((kind, data)) = event {
                self.notify(&path, kind, data);
            }
        }
    }

    fn notify(&self, path: &str, kind: ChangeKind, data: Value) {
        let collection = parent_collection(path);
        let doc = super::doc_id(path);
        let mut dead = Vec::new();
        for watcher in self.watchers.iter() {
            if watcher.collection != collection {
                continue;
            }
            let event = ChangeEvent {
                kind,
                doc_id: doc.to_string(),
                data: data.clone(),
            };
            if watcher.tx.send(event).is_err() {
                dead.push(*watcher.key());
            }
        }
        for id in dead {
            self.watchers.remove(&id);
        }
    }

    fn lock_docs(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Value>>, StoreError> {
        self.docs
            .lock()
            .map_err(|_| StoreError::Unavailable("document tree lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, doc: &str) -> Result<Option<Value>, StoreError> {
        let docs = self.inner.lock_docs()?;
        Ok(docs.get(doc).cloned())
    }

    async fn list(
        &self,
        collection: &str,
        limit: usize,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let docs = self.inner.lock_docs()?;
        Ok(Txn::new(&docs).list(collection, limit))
    }

    async fn transaction<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, E> + Send,
        T: Send,
        E: From<StoreError> + Send,
    {
        let mut docs = self.inner.lock_docs().map_err(E::from)?;
        let mut txn = Txn::new(&docs);
        let out = op(&mut txn)?;
        let writes = txn.into_writes();
        self.inner.apply(&mut docs, writes);
        Ok(out)
    }

    fn subscribe(&self, collection: &str, mode: SnapshotMode) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();

        // Snapshot and registration happen under the docs lock so no
        // commit can slip between the replay and the live stream.
        {
            let docs = self
                .inner
                .docs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if mode == SnapshotMode::Initial {
                for (id, data) in Txn::new(&docs).list(collection, usize::MAX) {
                    let _ = tx.send(ChangeEvent {
                        kind: ChangeKind::Added,
                        doc_id: id,
                        data,
                    });
                }
            }
            let id = self.inner.next_watcher_id.fetch_add(1, Ordering::Relaxed);
            self.inner.watchers.insert(
                id,
                Watcher {
                    collection: collection.to_string(),
                    tx,
                },
            );
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            Subscription::new(rx, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.watchers.remove(&id);
                }
            })
        }
    }
}

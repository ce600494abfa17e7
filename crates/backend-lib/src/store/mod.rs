// ============================
// crates/backend-lib/src/store/mod.rs
// ============================
//! Store abstraction: atomic multi-document transactions plus ordered
//! change-event subscriptions.
//!
//! Documents are JSON values addressed by slash-separated paths; the
//! final segment is the document id, everything before it the
//! collection. The transaction boundary is the sole cross-session
//! consistency mechanism in this codebase; nothing is assumed atomic
//! outside of one.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced by a storage backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// The transaction lost a conflict; nothing was committed and the
    /// calling operation is safe to retry.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// What happened to a watched document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One entry in a subscription's ordered change stream
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Document id (final path segment)
    pub doc_id: String,
    /// Current data, or the last known data for `Removed`
    pub data: Value,
}

/// Whether a subscription replays the current collection contents
/// before streaming live changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Every existing document is delivered first as `Added`
    Initial,
    /// Only changes after the subscription was opened
    ChangesOnly,
}

/// A live change stream. Dropping it releases the server-side watcher;
/// a leaked subscription is a leaked watcher.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Next change event; `None` once the stream is closed.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Document id: the final path segment.
pub fn doc_id(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, id)| id)
}

/// Collection holding a document: everything before the final segment.
pub fn parent_collection(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

/// Read-modify-write view handed to a transaction closure.
///
/// Reads see staged writes overlaid on a consistent snapshot; nothing
/// is visible to other callers until the closure returns `Ok` and the
/// whole set commits.
pub struct Txn<'a> {
    base: &'a BTreeMap<String, Value>,
    writes: BTreeMap<String, Option<Value>>,
}

impl<'a> Txn<'a> {
    pub(crate) fn new(base: &'a BTreeMap<String, Value>) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
        }
    }

    pub fn get(&self, doc: &str) -> Option<Value> {
        match self.writes.get(doc) {
            Some(staged) => staged.clone(),
            None => self.base.get(doc).cloned(),
        }
    }

    pub fn set(&mut self, doc: &str, data: Value) {
        self.writes.insert(doc.to_string(), Some(data));
    }

    pub fn delete(&mut self, doc: &str) {
        self.writes.insert(doc.to_string(), None);
    }

    /// Documents of `collection` in id order, staged writes applied,
    /// at most `limit` entries.
    pub fn list(&self, collection: &str, limit: usize) -> Vec<(String, Value)> {
        let mut merged: BTreeMap<&str, &Value> = self
            .base
            .iter()
            .filter(|(path, _)| parent_collection(path) == collection)
            .map(|(path, data)| (path.as_str(), data))
            .collect();
        for (path, staged) in &self.writes {
            if parent_collection(path) != collection {
                continue;
            }
            match staged {
                Some(data) => {
                    merged.insert(path.as_str(), data);
                },
                None => {
                    merged.remove(path.as_str());
                },
            }
        }
        merged
            .into_iter()
            .take(limit)
            .map(|(path, data)| (doc_id(path).to_string(), data.clone()))
            .collect()
    }

    /// Live document count of a collection, staged writes applied.
    pub fn count(&self, collection: &str) -> usize {
        self.list(collection, usize::MAX).len()
    }

    pub(crate) fn into_writes(self) -> BTreeMap<String, Option<Value>> {
        self.writes
    }
}

/// A transactional, multi-document consistency store with a
/// change-notification subscription primitive.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// Read one document.
    async fn get(&self, doc: &str) -> Result<Option<Value>, StoreError>;

    /// Read up to `limit` documents of a collection in id order.
    async fn list(&self, collection: &str, limit: usize)
        -> Result<Vec<(String, Value)>, StoreError>;

    /// Run `op` against an atomic read-modify-write view. All staged
    /// writes commit together when `op` returns `Ok`; on `Err` nothing
    /// is committed or observable.
    async fn transaction<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, E> + Send,
        T: Send,
        E: From<StoreError> + Send;

    /// Open an ordered change stream over one collection.
    fn subscribe(&self, collection: &str, mode: SnapshotMode) -> Subscription;
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::{Document, DocumentChange, DocumentStore, DocumentWatch, StoreError, StoreResult};

#[derive(Debug, Default)]
struct Slot {
    value: Option<Document>,
    watchers: Vec<mpsc::UnboundedSender<DocumentChange>>,
}

impl Slot {
    fn publish(&mut self, change: DocumentChange) {
        self.watchers.retain(|tx| tx.send(change.clone()).is_ok());
    }
}

/// In-process store for tests and single-process loopback sessions.
#[derive(Debug)]
pub struct MemoryStore {
    slots: RwLock<HashMap<String, Slot>>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backend going away; writes and deletes fail until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live watches on a document.
    pub fn watcher_count(&self, collection: &str, document: &str) -> usize {
        let guard = self.slots.read();
        guard
            .get(&key(collection, document))
            .map(|slot| slot.watchers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }
}

fn key(collection: &str, document: &str) -> String {
    format!("{collection}/{document}")
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn set(&self, collection: &str, document: &str, fields: Document) -> StoreResult<()> {
        self.ensure_available()?;
        let mut guard = self.slots.write();
        let slot = guard.entry(key(collection, document)).or_default();
        slot.value = Some(fields.clone());
        slot.publish(DocumentChange::Set { fields });
        Ok(())
    }

    async fn delete(&self, collection: &str, document: &str) -> StoreResult<()> {
        self.ensure_available()?;
        let mut guard = self.slots.write();
        if let Some(slot) = guard.get_mut(&key(collection, document)) {
            if slot.value.take().is_some() {
                slot.publish(DocumentChange::Deleted);
            }
        }
        Ok(())
    }

    async fn get(&self, collection: &str, document: &str) -> StoreResult<Option<Document>> {
        self.ensure_available()?;
        let guard = self.slots.read();
        Ok(guard
            .get(&key(collection, document))
            .and_then(|slot| slot.value.clone()))
    }

    async fn watch(&self, collection: &str, document: &str) -> StoreResult<DocumentWatch> {
        self.ensure_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.slots.write();
        let slot = guard.entry(key(collection, document)).or_default();
        if let Some(fields) = slot.value.clone() {
            let _ = tx.send(DocumentChange::Set { fields });
        }
        slot.watchers.push(tx);
        Ok(DocumentWatch::new(rx, None))
    }
}

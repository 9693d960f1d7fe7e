//! Shared document store used as the out-of-band signaling medium between two peers.
//!
//! A store holds named documents grouped in collections. Writes replace a document
//! wholesale, deletes reset it to empty, and every change is pushed to each open watch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

mod directory;
mod memory;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;

/// Field map of a single document.
pub type Document = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DocumentChange {
    Set { fields: Document },
    Deleted,
}

impl DocumentChange {
    pub fn fields(&self) -> Option<&Document> {
        match self {
            DocumentChange::Set { fields } => Some(fields),
            DocumentChange::Deleted => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unavailable")]
    Unavailable,
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Replace the document's content. Never merges with the previous value.
    async fn set(&self, collection: &str, document: &str, fields: Document) -> StoreResult<()>;

    async fn delete(&self, collection: &str, document: &str) -> StoreResult<()>;

    async fn get(&self, collection: &str, document: &str) -> StoreResult<Option<Document>>;

    /// Open a watch on one document. The current value (if any) is delivered first,
    /// followed by one notification per subsequent write or delete.
    async fn watch(&self, collection: &str, document: &str) -> StoreResult<DocumentWatch>;
}

/// Stream of changes for a single document. Dropping it unsubscribes.
#[derive(Debug)]
pub struct DocumentWatch {
    rx: mpsc::UnboundedReceiver<DocumentChange>,
    poller: Option<JoinHandle<()>>,
}

impl DocumentWatch {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<DocumentChange>,
        poller: Option<JoinHandle<()>>,
    ) -> Self {
        Self { rx, poller }
    }

    /// Wait for the next change. Returns `None` once the store side has gone away.
    pub async fn changed(&mut self) -> Option<DocumentChange> {
        self.rx.recv().await
    }

    pub fn try_changed(&mut self) -> Option<DocumentChange> {
        self.rx.try_recv().ok()
    }
}

impl Drop for DocumentWatch {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

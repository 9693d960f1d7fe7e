use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{Document, DocumentChange, DocumentStore, DocumentWatch, StoreResult};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_COMPACT_THRESHOLD: u64 = 64 * 1024;

/// Store backed by a shared directory so that two processes on one host can signal.
///
/// Each document is a journal (`<root>/<collection>/<document>.jsonl`) of JSON encoded
/// [`DocumentChange`] lines. The last line is the current value. Watches tail the journal,
/// so every write is delivered even when several land between polls.
///
/// A delete, or a write that pushes the journal past the compaction threshold, replaces
/// the file with a fresh one holding a generation header and the latest change. Watches
/// notice the new generation and start over from its first line. A watch that falls more
/// than a whole journal behind sees only the value that survived compaction.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
    poll_interval: Duration,
    compact_threshold: u64,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Journal size in bytes above which a write compacts the document.
    pub fn with_compact_threshold(mut self, bytes: u64) -> Self {
        self.compact_threshold = bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn journal_path(&self, collection: &str, document: &str) -> PathBuf {
        self.root.join(collection).join(format!("{document}.jsonl"))
    }

    async fn append(
        &self,
        collection: &str,
        document: &str,
        change: &DocumentChange,
    ) -> StoreResult<()> {
        let path = self.journal_path(collection, document);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let line = encode_line(&JournalLine::Change(change.clone()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        let len = file.metadata().await?.len();
        tracing::trace!(path = %path.display(), bytes = line.len(), len, "journal append");

        if len > self.compact_threshold {
            compact(&path, change).await?;
        }
        Ok(())
    }
}

/// One line of a journal file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum JournalLine {
    /// First line of a compacted journal.
    Header { generation: String },
    Change(DocumentChange),
}

fn encode_line(line: &JournalLine) -> StoreResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec(line)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Replace the journal at `path` with a new generation holding only `latest`.
async fn compact(path: &Path, latest: &DocumentChange) -> StoreResult<()> {
    let generation = Uuid::new_v4().to_string();
    let mut contents = encode_line(&JournalLine::Header {
        generation: generation.clone(),
    })?;
    contents.extend(encode_line(&JournalLine::Change(latest.clone()))?);

    let staging = path.with_extension(format!("{generation}.tmp"));
    fs::write(&staging, &contents).await?;
    if let Err(err) = fs::rename(&staging, path).await {
        let _ = fs::remove_file(&staging).await;
        return Err(err.into());
    }
    tracing::debug!(path = %path.display(), %generation, "journal compacted");
    Ok(())
}

struct JournalCursor {
    path: PathBuf,
    generation: Option<String>,
    offset: u64,
}

impl JournalCursor {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            generation: None,
            offset: 0,
        }
    }

    /// Read every complete change appended since the last poll.
    async fn poll(&mut self) -> std::io::Result<Vec<DocumentChange>> {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.generation = None;
                self.offset = 0;
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };
        let len = file.metadata().await?.len();
        let mut reader = BufReader::new(file);

        let mut head = Vec::new();
        reader.read_until(b'\n', &mut head).await?;
        let generation = match serde_json::from_slice::<JournalLine>(&head) {
            Ok(JournalLine::Header { generation }) => Some(generation),
            _ => None,
        };
        if generation != self.generation || len < self.offset {
            // journal was compacted underneath us
            self.generation = generation;
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }
        reader.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;

        let Some(last_newline) = buf.iter().rposition(|byte| *byte == b'\n') else {
            return Ok(Vec::new());
        };
        let complete = &buf[..=last_newline];
        self.offset += complete.len() as u64;

        let mut changes = Vec::new();
        for line in complete.split(|byte| *byte == b'\n') {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<JournalLine>(line) {
                Ok(JournalLine::Change(change)) => changes.push(change),
                Ok(JournalLine::Header { .. }) => {}
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %err,
                        "skipping corrupt journal line"
                    );
                }
            }
        }
        Ok(changes)
    }
}

fn current_value(changes: Vec<DocumentChange>) -> Option<Document> {
    match changes.into_iter().last() {
        Some(DocumentChange::Set { fields }) => Some(fields),
        _ => None,
    }
}

#[async_trait]
impl DocumentStore for DirectoryStore {
    async fn set(&self, collection: &str, document: &str, fields: Document) -> StoreResult<()> {
        self.append(collection, document, &DocumentChange::Set { fields })
            .await
    }

    async fn delete(&self, collection: &str, document: &str) -> StoreResult<()> {
        if self.get(collection, document).await?.is_none() {
            return Ok(());
        }
        let path = self.journal_path(collection, document);
        compact(&path, &DocumentChange::Deleted).await
    }

    async fn get(&self, collection: &str, document: &str) -> StoreResult<Option<Document>> {
        let mut cursor = JournalCursor::new(self.journal_path(collection, document));
        Ok(current_value(cursor.poll().await?))
    }

    async fn watch(&self, collection: &str, document: &str) -> StoreResult<DocumentWatch> {
        let path = self.journal_path(collection, document);
        let mut cursor = JournalCursor::new(path.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(fields) = current_value(cursor.poll().await?) {
            let _ = tx.send(DocumentChange::Set { fields });
        }

        let poll_interval = self.poll_interval;
        let poller = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                match cursor.poll().await {
                    Ok(changes) => {
                        for change in changes {
                            if tx.send(change).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "journal poll failed");
                    }
                }
            }
        });
        Ok(DocumentWatch::new(rx, Some(poller)))
    }
}

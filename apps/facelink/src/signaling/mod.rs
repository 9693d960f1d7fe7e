//! Out-of-band exchange of session descriptions and connectivity candidates.
//!
//! Both peers share one collection in a [`DocumentStore`] with four well-known documents.
//! Each role writes its own slots and watches the other side's.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use signal_store::{Document, DocumentChange, DocumentStore, DocumentWatch, StoreError};
use thiserror::Error;

pub const DEFAULT_COLLECTION: &str = "connectionData";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Caller,
    Receiver,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Caller => "caller",
            Role::Receiver => "receiver",
        }
    }

    /// Slot this role publishes its candidates to.
    pub fn candidate_slot(self) -> Slot {
        match self {
            Role::Caller => Slot::CallerCandidate,
            Role::Receiver => Slot::ReceiverCandidate,
        }
    }

    /// Slot carrying the other role's candidates.
    pub fn remote_candidate_slot(self) -> Slot {
        match self {
            Role::Caller => Slot::ReceiverCandidate,
            Role::Receiver => Slot::CallerCandidate,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    CallerOffer,
    ReceiverAnswer,
    CallerCandidate,
    ReceiverCandidate,
}

impl Slot {
    pub const ALL: [Slot; 4] = [
        Slot::CallerOffer,
        Slot::ReceiverAnswer,
        Slot::CallerCandidate,
        Slot::ReceiverCandidate,
    ];

    pub fn document_name(self) -> &'static str {
        match self {
            Slot::CallerOffer => "callerOffer",
            Slot::ReceiverAnswer => "receiverAnswer",
            Slot::CallerCandidate => "callerCandidate",
            Slot::ReceiverCandidate => "receiverCandidate",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.document_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn slot(self) -> Slot {
        match self {
            SdpKind::Offer => Slot::CallerOffer,
            SdpKind::Answer => Slot::ReceiverAnswer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One discovered network path, in the shape stored in the candidate documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectivityCandidate {
    #[serde(rename = "sdp")]
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: u16,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DescriptionDocument {
    sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    Description(SessionDescription),
    Candidate(ConnectivityCandidate),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling store error: {0}")]
    Transport(#[from] StoreError),
    #[error("invalid {slot} document: {reason}")]
    InvalidDocument { slot: Slot, reason: String },
}

/// Typed access to the signaling documents of one session.
#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl SignalingChannel {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            collection: DEFAULT_COLLECTION.to_string(),
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn write_slot(&self, slot: Slot, fields: Document) -> Result<(), SignalingError> {
        self.store
            .set(&self.collection, slot.document_name(), fields)
            .await?;
        tracing::debug!(slot = %slot, "signaling document written");
        Ok(())
    }

    pub async fn delete_slot(&self, slot: Slot) -> Result<(), SignalingError> {
        self.store
            .delete(&self.collection, slot.document_name())
            .await?;
        tracing::debug!(slot = %slot, "signaling document cleared");
        Ok(())
    }

    /// Remove offer and answer left behind by an earlier attempt.
    pub async fn clear_handshake(&self) -> Result<(), SignalingError> {
        self.delete_slot(Slot::CallerOffer).await?;
        self.delete_slot(Slot::ReceiverAnswer).await
    }

    pub async fn write_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), SignalingError> {
        let slot = description.kind.slot();
        let fields = to_document(
            slot,
            &DescriptionDocument {
                sdp: description.sdp.clone(),
            },
        )?;
        self.write_slot(slot, fields).await
    }

    /// Publish a local candidate, replacing whatever the slot held before.
    pub async fn write_candidate(
        &self,
        role: Role,
        candidate: &ConnectivityCandidate,
    ) -> Result<(), SignalingError> {
        let slot = role.candidate_slot();
        self.write_slot(slot, to_document(slot, candidate)?).await
    }

    pub async fn read_slot(&self, slot: Slot) -> Result<Option<SignalMessage>, SignalingError> {
        match self
            .store
            .get(&self.collection, slot.document_name())
            .await?
        {
            Some(fields) => parse_document(slot, fields).map(Some),
            None => Ok(None),
        }
    }

    pub async fn subscribe(&self, slot: Slot) -> Result<SlotSubscription, SignalingError> {
        let watch = self
            .store
            .watch(&self.collection, slot.document_name())
            .await?;
        tracing::debug!(slot = %slot, "subscribed to signaling document");
        Ok(SlotSubscription { slot, watch })
    }
}

/// Live view of one signaling document. Dropping it releases the store watch.
#[derive(Debug)]
pub struct SlotSubscription {
    slot: Slot,
    watch: DocumentWatch,
}

impl SlotSubscription {
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Next usable message. Deletions and unparseable documents are skipped.
    pub async fn next(&mut self) -> Option<SignalMessage> {
        loop {
            match self.watch.changed().await? {
                DocumentChange::Deleted => {
                    tracing::trace!(slot = %self.slot, "signaling document emptied");
                }
                DocumentChange::Set { fields } => match parse_document(self.slot, fields) {
                    Ok(message) => return Some(message),
                    Err(err) => {
                        tracing::warn!(slot = %self.slot, error = %err, "ignoring signaling document");
                    }
                },
            }
        }
    }
}

fn to_document<T: Serialize>(slot: Slot, value: &T) -> Result<Document, SignalingError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(SignalingError::InvalidDocument {
            slot,
            reason: format!("expected an object, got {other}"),
        }),
        Err(err) => Err(SignalingError::InvalidDocument {
            slot,
            reason: err.to_string(),
        }),
    }
}

fn parse_document(slot: Slot, fields: Document) -> Result<SignalMessage, SignalingError> {
    let invalid = |err: serde_json::Error| SignalingError::InvalidDocument {
        slot,
        reason: err.to_string(),
    };
    let value = serde_json::Value::Object(fields);
    match slot {
        Slot::CallerOffer | Slot::ReceiverAnswer => {
            let document: DescriptionDocument = serde_json::from_value(value).map_err(invalid)?;
            let kind = if slot == Slot::CallerOffer {
                SdpKind::Offer
            } else {
                SdpKind::Answer
            };
            Ok(SignalMessage::Description(SessionDescription {
                kind,
                sdp: document.sdp,
            }))
        }
        Slot::CallerCandidate | Slot::ReceiverCandidate => {
            let candidate: ConnectivityCandidate =
                serde_json::from_value(value).map_err(invalid)?;
            Ok(SignalMessage::Candidate(candidate))
        }
    }
}

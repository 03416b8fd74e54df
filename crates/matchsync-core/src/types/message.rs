//! Message records and their local delivery state

use serde::{Deserialize, Serialize};

use super::{LocalId, MatchId, MessageId, UserId};
use crate::backend::{Cursor, Document};
use crate::error::{SyncError, SyncResult};

/// A message as stored remotely.
///
/// Immutable except `is_read`, which only ever flips false → true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(skip)]
    pub id: MessageId,
    pub match_id: MatchId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
    /// Server time (Unix millis). For a pending entry this is the local send
    /// time and is only for display.
    pub timestamp: i64,
    #[serde(default)]
    pub is_read: bool,
    /// Server arrival sequence; breaks timestamp ties
    #[serde(skip)]
    pub sequence: u64,
}

impl Message {
    pub fn from_document(doc: &Document) -> SyncResult<Self> {
        let mut message: Message = serde_json::from_value(doc.data.clone()).map_err(|e| {
            SyncError::Serialization(format!("message {}: {}", doc.id, e))
        })?;
        message.id = MessageId(doc.id.clone());
        message.sequence = doc.sequence;
        Ok(message)
    }

    /// Position in a conversation: timestamp, then arrival sequence.
    pub fn order_key(&self) -> (i64, u64) {
        (self.timestamp, self.sequence)
    }

    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.timestamp, self.sequence)
    }
}

/// Where a locally visible message is in its trip to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Optimistic echo; the write is in flight or queued
    Pending { local_id: LocalId },
    /// Confirmed by the backend
    Sent { remote_id: MessageId },
    /// The write was abandoned; `retry` re-issues it with the same token
    Failed { local_id: LocalId, reason: String },
}

/// One entry of a conversation buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub message: Message,
    pub state: DeliveryState,
}

impl ChatEntry {
    pub fn sent(message: Message) -> Self {
        let remote_id = message.id.clone();
        Self {
            message,
            state: DeliveryState::Sent { remote_id },
        }
    }

    pub fn pending(message: Message, local_id: LocalId) -> Self {
        Self {
            message,
            state: DeliveryState::Pending { local_id },
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.state, DeliveryState::Sent { .. })
    }

    pub fn local_id(&self) -> Option<LocalId> {
        match &self.state {
            DeliveryState::Pending { local_id } | DeliveryState::Failed { local_id, .. } => {
                Some(*local_id)
            }
            DeliveryState::Sent { .. } => None,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.message.id
    }
}

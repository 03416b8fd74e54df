//! Write intents buffered while offline

use serde::{Deserialize, Serialize};

use super::{now_millis, IdempotencyToken, LocalId, MatchId, UserId};

/// What a queued operation does once it reaches the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    SendMessage {
        local_id: LocalId,
        match_id: MatchId,
        sender_id: UserId,
        receiver_id: UserId,
        text: String,
    },
    /// Flip every unread message addressed to `reader_id` and reset its
    /// counter, in one batch
    MarkRead { match_id: MatchId, reader_id: UserId },
    /// Counter-only reset
    ResetUnread { match_id: MatchId, user_id: UserId },
}

impl OperationKind {
    pub fn match_id(&self) -> &MatchId {
        match self {
            OperationKind::SendMessage { match_id, .. }
            | OperationKind::MarkRead { match_id, .. }
            | OperationKind::ResetUnread { match_id, .. } => match_id,
        }
    }

    /// Token for this write. Sends derive it from their local id so that
    /// every attempt of the same send shares it.
    pub fn token(&self) -> IdempotencyToken {
        match self {
            OperationKind::SendMessage { local_id, .. } => local_id.send_token(),
            OperationKind::MarkRead { .. } => IdempotencyToken::generate("read"),
            OperationKind::ResetUnread { .. } => IdempotencyToken::generate("reset"),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::SendMessage { .. } => "send_message",
            OperationKind::MarkRead { .. } => "mark_read",
            OperationKind::ResetUnread { .. } => "reset_unread",
        }
    }
}

/// An idempotent write intent owned by the offline queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub token: IdempotencyToken,
    /// Position in the queue; strictly increasing across the queue's lifetime
    pub order: u64,
    pub enqueued_at: i64,
    pub kind: OperationKind,
}

impl PendingOperation {
    /// Wrap `kind` with its token; `order` is assigned by the queue.
    pub fn new(token: IdempotencyToken, kind: OperationKind) -> Self {
        Self {
            token,
            order: 0,
            enqueued_at: now_millis(),
            kind,
        }
    }
}

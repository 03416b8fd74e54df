//! Outbound notification hook.
//!
//! Delivery mechanics (push tokens, APNs/FCM) live outside this crate; the
//! sync layer only hands over what happened. Dispatch failures are logged by
//! the caller and never undo the write that triggered them.

use async_trait::async_trait;
use tracing::info;

use crate::error::SyncResult;
use crate::types::{Match, MatchId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    NewMatch {
        record: Match,
        recipient: UserId,
    },
    NewMessage {
        match_id: MatchId,
        message_id: MessageId,
        sender_id: UserId,
        recipient: UserId,
        preview: String,
    },
}

impl Notification {
    pub fn recipient(&self) -> &UserId {
        match self {
            Notification::NewMatch { recipient, .. } | Notification::NewMessage { recipient, .. } => {
                recipient
            }
        }
    }
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: Notification) -> SyncResult<()>;
}

/// Dispatcher that only logs.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl NotificationDispatcher for LogNotifier {
    async fn dispatch(&self, notification: Notification) -> SyncResult<()> {
        match &notification {
            Notification::NewMatch { record, recipient } => {
                info!(match_id = %record.id, recipient = %recipient, "Notify: new match");
            }
            Notification::NewMessage {
                match_id,
                message_id,
                recipient,
                ..
            } => {
                info!(match_id = %match_id, message_id = %message_id, recipient = %recipient, "Notify: new message");
            }
        }
        Ok(())
    }
}

/// Truncated message text for notification bodies.
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

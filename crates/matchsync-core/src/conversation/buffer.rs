//! Ordered message buffer for one open conversation.
//!
//! Layout of the visible sequence:
//!
//! ```text
//! [ confirmed entries, by (server timestamp, arrival sequence) ][ pending/failed, send order ]
//! ```
//!
//! Confirmed entries never move once placed. Local entries only leave the
//! tail by being confirmed, at which point they take their server position.
//! The client clock is never used for placement.

use std::collections::HashSet;

use super::ConversationEvent;
use crate::backend::Cursor;
use crate::types::{ChatEntry, DeliveryState, LocalId, Message, MessageId, UserId};

#[derive(Debug, Clone, Default)]
pub struct ConversationBuffer {
    confirmed: Vec<ChatEntry>,
    pending: Vec<ChatEntry>,
}

impl ConversationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.confirmed.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatEntry> {
        self.confirmed.iter().chain(self.pending.iter())
    }

    pub fn entries(&self) -> Vec<ChatEntry> {
        self.iter().cloned().collect()
    }

    pub fn get(&self, index: usize) -> Option<&ChatEntry> {
        self.iter().nth(index)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.iter().any(|e| e.id() == id)
    }

    /// Pagination cursor of the oldest confirmed entry.
    pub fn oldest_cursor(&self) -> Option<Cursor> {
        self.confirmed.first().map(|e| e.message.cursor())
    }

    fn confirmed_position(&self, id: &MessageId) -> Option<usize> {
        self.confirmed.iter().position(|e| e.id() == id)
    }

    fn pending_position(&self, id: &MessageId) -> Option<usize> {
        self.pending.iter().position(|e| e.id() == id)
    }

    fn local_position(&self, local_id: LocalId) -> Option<usize> {
        self.pending
            .iter()
            .position(|e| e.local_id() == Some(local_id))
    }

    fn insertion_point(&self, message: &Message) -> usize {
        let key = message.order_key();
        self.confirmed
            .partition_point(|e| e.message.order_key() <= key)
    }

    /// Merge a message delivered by the backend.
    ///
    /// Returns `None` when nothing visible changed.
    pub fn apply_remote(&mut self, message: Message) -> Option<ConversationEvent> {
        if let Some(index) = self.confirmed_position(&message.id) {
            let existing = &mut self.confirmed[index];
            let mut merged = message;
            merged.is_read |= existing.message.is_read;
            // Position is fixed once confirmed.
            merged.timestamp = existing.message.timestamp;
            merged.sequence = existing.message.sequence;
            if existing.message == merged {
                return None;
            }
            existing.message = merged;
            return Some(ConversationEvent::Updated {
                index,
                entry: existing.clone(),
            });
        }

        let entry = ChatEntry::sent(message);
        let to = self.insertion_point(&entry.message);

        if let Some(pending) = self.pending_position(entry.id()) {
            let from = self.confirmed.len() + pending;
            self.pending.remove(pending);
            self.confirmed.insert(to, entry.clone());
            return Some(if from == to {
                ConversationEvent::Updated { index: to, entry }
            } else {
                ConversationEvent::Moved { from, to, entry }
            });
        }

        let at_end = to == self.confirmed.len() && self.pending.is_empty();
        self.confirmed.insert(to, entry.clone());
        Some(if at_end {
            ConversationEvent::Appended(entry)
        } else {
            ConversationEvent::Inserted { index: to, entry }
        })
    }

    /// Merge an older page at the head, deduplicated by id.
    pub fn merge_older(&mut self, page: Vec<Message>) -> Vec<ConversationEvent> {
        let oldest = self.confirmed.first().map(|e| e.message.order_key());
        let mut seen = HashSet::new();
        let mut head = Vec::new();
        let mut rest = Vec::new();
        for message in page {
            if self.confirmed_position(&message.id).is_some() || !seen.insert(message.id.clone()) {
                continue;
            }
            let older = oldest.map_or(true, |o| message.order_key() < o);
            if older && self.pending_position(&message.id).is_none() {
                head.push(message);
            } else {
                rest.push(message);
            }
        }
        head.sort_by_key(Message::order_key);

        let mut events = Vec::new();
        if !head.is_empty() {
            let entries: Vec<ChatEntry> = head.into_iter().map(ChatEntry::sent).collect();
            let mut merged = entries.clone();
            merged.append(&mut self.confirmed);
            self.confirmed = merged;
            events.push(ConversationEvent::Prepended(entries));
        }
        events.extend(rest.into_iter().filter_map(|m| self.apply_remote(m)));
        events
    }

    /// Add an optimistic entry at the tail.
    pub fn push_pending(&mut self, entry: ChatEntry) -> ConversationEvent {
        self.pending.push(entry.clone());
        ConversationEvent::Appended(entry)
    }

    fn set_local_state(&mut self, local_id: LocalId, state: DeliveryState) -> Option<ConversationEvent> {
        let pending = self.local_position(local_id)?;
        let entry = &mut self.pending[pending];
        if entry.state == state {
            return None;
        }
        entry.state = state;
        Some(ConversationEvent::Updated {
            index: self.confirmed.len() + pending,
            entry: entry.clone(),
        })
    }

    pub fn mark_failed(&mut self, local_id: LocalId, reason: impl Into<String>) -> Option<ConversationEvent> {
        self.set_local_state(
            local_id,
            DeliveryState::Failed {
                local_id,
                reason: reason.into(),
            },
        )
    }

    pub fn mark_pending(&mut self, local_id: LocalId) -> Option<ConversationEvent> {
        self.set_local_state(local_id, DeliveryState::Pending { local_id })
    }

    /// Optimistically flip `isRead` on confirmed messages addressed to `reader`.
    pub fn mark_read_by(&mut self, reader: &UserId) -> Vec<ConversationEvent> {
        let mut events = Vec::new();
        for (index, entry) in self.confirmed.iter_mut().enumerate() {
            if entry.message.receiver_id == *reader && !entry.message.is_read {
                entry.message.is_read = true;
                events.push(ConversationEvent::Updated {
                    index,
                    entry: entry.clone(),
                });
            }
        }
        events
    }

    /// Undo [`mark_read_by`](Self::mark_read_by) for the given messages.
    pub fn restore_unread(&mut self, ids: &[MessageId]) -> Vec<ConversationEvent> {
        let mut events = Vec::new();
        for (index, entry) in self.confirmed.iter_mut().enumerate() {
            if entry.message.is_read && ids.contains(&entry.message.id) {
                entry.message.is_read = false;
                events.push(ConversationEvent::Updated {
                    index,
                    entry: entry.clone(),
                });
            }
        }
        events
    }

    /// The local entry for `local_id`, if it is still unconfirmed.
    pub fn local_entry(&self, local_id: LocalId) -> Option<&ChatEntry> {
        self.local_position(local_id).map(|i| &self.pending[i])
    }
}

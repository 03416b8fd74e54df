//! Per-user, per-match unread counters.
//!
//! Counters live on the match document (`unreadCount.<userId>`) and are only
//! ever changed by server-side primitives: an atomic increment when a
//! message is sent, an atomic set-to-zero when the reader opens the
//! conversation. No client ever reads a counter and writes back a number.

use std::sync::Arc;

use tracing::debug;

use crate::backend::{DocumentStore, FieldWrites, WriteBatch, WriteOp};
use crate::error::SyncResult;
use crate::schema::{self, unread_path};
use crate::types::{IdempotencyToken, Match, MatchId, UserId};

#[derive(Clone)]
pub struct UnreadCounter {
    store: Arc<dyn DocumentStore>,
}

impl UnreadCounter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// `unreadCount[user] += 1` as a write op, for inclusion in a send batch.
    pub fn increment_op(match_id: &MatchId, user: &UserId) -> WriteOp {
        WriteOp::Update {
            collection: schema::MATCHES.to_string(),
            id: match_id.to_string(),
            fields: FieldWrites::new().increment(unread_path(user), 1),
        }
    }

    /// `unreadCount[user] = 0` as a write op.
    pub fn reset_op(match_id: &MatchId, user: &UserId) -> WriteOp {
        WriteOp::Update {
            collection: schema::MATCHES.to_string(),
            id: match_id.to_string(),
            fields: FieldWrites::new().set(unread_path(user), 0),
        }
    }

    pub async fn increment(&self, match_id: &MatchId, user: &UserId) -> SyncResult<()> {
        let batch = WriteBatch::with_key(IdempotencyToken::generate("incr"))
            .op(Self::increment_op(match_id, user));
        self.store.commit(batch).await?;
        debug!(match_id = %match_id, user = %user, "Unread incremented");
        Ok(())
    }

    /// Only the "conversation opened/read" path calls this.
    pub async fn reset(&self, match_id: &MatchId, user: &UserId) -> SyncResult<()> {
        let batch = WriteBatch::with_key(IdempotencyToken::generate("reset"))
            .op(Self::reset_op(match_id, user));
        self.store.commit(batch).await?;
        debug!(match_id = %match_id, user = %user, "Unread reset");
        Ok(())
    }

    /// Σ `unreadCount[user]` over the user's active matches.
    pub async fn total_unread(&self, user: &UserId) -> SyncResult<u64> {
        let docs = self
            .store
            .query(&schema::active_matches(user, None))
            .await?;
        let total = docs
            .iter()
            .filter_map(|doc| Match::from_document(doc).ok())
            .map(|m| u64::from(m.unread_for(user)))
            .sum();
        Ok(total)
    }
}

//! User profile lookups used for match-list decoration and side effects

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::{DocumentStore, FieldWrites, WriteBatch, WriteOp};
use crate::error::SyncResult;
use crate::schema::{self, user_fields};
use crate::types::{IdempotencyToken, UserId};

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    /// `None` when the profile has no display name (or does not exist).
    async fn display_name(&self, user: &UserId) -> SyncResult<Option<String>>;

    async fn increment_match_count(&self, user: &UserId) -> SyncResult<()>;
}

/// Profiles stored in the backend's `users` collection.
pub struct RemoteProfileDirectory {
    store: Arc<dyn DocumentStore>,
}

impl RemoteProfileDirectory {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProfileDirectory for RemoteProfileDirectory {
    async fn display_name(&self, user: &UserId) -> SyncResult<Option<String>> {
        let doc = self.store.get(schema::USERS, user.as_str()).await?;
        Ok(doc.and_then(|d| {
            d.data
                .get(user_fields::DISPLAY_NAME)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        }))
    }

    async fn increment_match_count(&self, user: &UserId) -> SyncResult<()> {
        let batch = WriteBatch::with_key(IdempotencyToken::generate("match-count")).op(
            WriteOp::Update {
                collection: schema::USERS.to_string(),
                id: user.to_string(),
                fields: FieldWrites::new().increment(user_fields::MATCH_COUNT, 1),
            },
        );
        self.store.commit(batch).await?;
        Ok(())
    }
}

//! Match creation, unmatch and hard delete.
//!
//! Uniqueness of the active match per pair is enforced by the backend, not
//! by the read-then-write check alone: creation commits the match together
//! with a `match_pairs/<pairKey>` record whose create precondition fails if
//! the pair already has one. A creator that loses the race re-reads and
//! returns the winner.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use serde_json::Value;

use crate::backend::{DocumentStore, FieldWrites, Predicate, WriteBatch, WriteOp};
use crate::error::{SyncError, SyncResult};
use crate::notifications::{Notification, NotificationDispatcher};
use crate::profiles::ProfileDirectory;
use crate::schema::{self, match_fields, pair_fields, unread_path};
use crate::types::{now_millis, pair_key, IdempotencyToken, Match, MatchId, UserId};

/// Result of [`MatchLifecycleManager::create_match`].
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCreation {
    pub record: Match,
    /// `false` when an active match already existed
    pub created: bool,
    /// Participant names prefetched by the side effects (new matches only)
    pub display_names: HashMap<UserId, String>,
}

pub struct MatchLifecycleManager {
    store: Arc<dyn DocumentStore>,
    profiles: Arc<dyn ProfileDirectory>,
    notifier: Arc<dyn NotificationDispatcher>,
}

enum CreateAttempt {
    Created(MatchId),
    Exists(Match),
    /// Pair key held without an active match behind it
    Conflict,
}

impl MatchLifecycleManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        profiles: Arc<dyn ProfileDirectory>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            store,
            profiles,
            notifier,
        }
    }

    /// The active match between `a` and `b`, in either orientation.
    pub async fn find_active(&self, a: &UserId, b: &UserId) -> SyncResult<Option<Match>> {
        let docs = self.store.query(&schema::active_match_between(a, b)).await?;
        Ok(docs.iter().find_map(|doc| match Match::from_document(doc) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(match_id = %doc.id, error = %e, "Skipping malformed match");
                None
            }
        }))
    }

    pub async fn load(&self, match_id: &MatchId) -> SyncResult<Option<Match>> {
        match self.store.get(schema::MATCHES, match_id.as_str()).await? {
            Some(doc) => Ok(Some(Match::from_document(&doc)?)),
            None => Ok(None),
        }
    }

    /// Create the match for `{a, b}` unless one is already active.
    ///
    /// Side effects (match counters, name prefetch, notifications) are best
    /// effort: their failures are logged and never undo the creation.
    pub async fn create_match(&self, a: &UserId, b: &UserId) -> SyncResult<MatchCreation> {
        if a == b {
            return Err(SyncError::InvalidOperation(format!(
                "cannot match {} with themselves",
                a
            )));
        }
        if let Some(existing) = self.find_active(a, b).await? {
            debug!(match_id = %existing.id, "Match already exists");
            return Ok(MatchCreation {
                record: existing,
                created: false,
                display_names: HashMap::new(),
            });
        }

        let mut healed = false;
        let match_id = loop {
            match self.try_create(a, b).await? {
                CreateAttempt::Created(id) => break id,
                CreateAttempt::Exists(existing) => {
                    info!(match_id = %existing.id, "Concurrent creation won by another writer");
                    return Ok(MatchCreation {
                        record: existing,
                        created: false,
                        display_names: HashMap::new(),
                    });
                }
                CreateAttempt::Conflict if !healed => {
                    self.clear_stale_pair(a, b).await?;
                    healed = true;
                }
                CreateAttempt::Conflict => {
                    return Err(SyncError::AlreadyExists(format!(
                        "pair {} is held without an active match",
                        pair_key(a, b)
                    )));
                }
            }
        };

        let record = match self.load(&match_id).await {
            Ok(Some(record)) => record,
            other => {
                if let Err(e) = other {
                    debug!(match_id = %match_id, error = %e, "Could not re-read new match");
                }
                Match {
                    id: match_id.clone(),
                    user1_id: a.clone(),
                    user2_id: b.clone(),
                    is_active: true,
                    created_at: now_millis(),
                    last_message: None,
                    last_message_timestamp: None,
                    last_message_sender_id: None,
                    unread_count: HashMap::new(),
                    unmatched_by: None,
                    unmatched_at: None,
                }
            }
        };
        info!(match_id = %record.id, user1 = %a, user2 = %b, "Match created");

        let display_names = self.run_side_effects(&record).await;
        Ok(MatchCreation {
            record,
            created: true,
            display_names,
        })
    }

    async fn try_create(&self, a: &UserId, b: &UserId) -> SyncResult<CreateAttempt> {
        let match_id = MatchId::generate();
        let batch = WriteBatch::with_key(IdempotencyToken(format!("create-{}", match_id)))
            .op(WriteOp::Create {
                collection: schema::MATCH_PAIRS.to_string(),
                id: pair_key(a, b),
                fields: FieldWrites::new()
                    .set(pair_fields::MATCH_ID, match_id.as_str())
                    .server_timestamp(pair_fields::CREATED_AT),
            })
            .op(WriteOp::Create {
                collection: schema::MATCHES.to_string(),
                id: match_id.to_string(),
                fields: FieldWrites::new()
                    .set(match_fields::USER1_ID, a.as_str())
                    .set(match_fields::USER2_ID, b.as_str())
                    .set(match_fields::IS_ACTIVE, true)
                    .server_timestamp(match_fields::CREATED_AT)
                    .set(unread_path(a), 0)
                    .set(unread_path(b), 0),
            });

        match self.store.commit(batch).await {
            Ok(_) => Ok(CreateAttempt::Created(match_id)),
            Err(SyncError::AlreadyExists(_)) => match self.find_active(a, b).await? {
                Some(existing) => Ok(CreateAttempt::Exists(existing)),
                None => Ok(CreateAttempt::Conflict),
            },
            Err(e) => Err(e),
        }
    }

    /// Drop a pair key whose match is gone or inactive.
    ///
    /// The delete only applies while the key still names the owner read
    /// here, so a key re-created by another client in between survives.
    async fn clear_stale_pair(&self, a: &UserId, b: &UserId) -> SyncResult<()> {
        let key = pair_key(a, b);
        let Some(pair) = self.store.get(schema::MATCH_PAIRS, &key).await? else {
            return Ok(());
        };
        let owner = pair
            .data
            .get(pair_fields::MATCH_ID)
            .cloned()
            .unwrap_or(Value::Null);
        if let Some(owner) = owner.as_str() {
            if let Some(record) = self.load(&MatchId::from(owner)).await? {
                if record.is_active {
                    return Ok(());
                }
            }
        }
        warn!(pair = %key, owner = %owner, "Clearing stale pair key");
        self.store
            .commit(WriteBatch::new().op(WriteOp::DeleteWhere {
                collection: schema::MATCH_PAIRS.to_string(),
                predicate: Predicate::eq(pair_fields::MATCH_ID, owner),
            }))
            .await?;
        Ok(())
    }

    async fn side_effects_for(&self, record: &Match, user: &UserId) -> Option<String> {
        let (count, name, notified) = futures::join!(
            self.profiles.increment_match_count(user),
            self.profiles.display_name(user),
            self.notifier.dispatch(Notification::NewMatch {
                record: record.clone(),
                recipient: user.clone(),
            }),
        );
        if let Err(e) = count {
            warn!(match_id = %record.id, user = %user, error = %e, "Match count update failed");
        }
        if let Err(e) = notified {
            warn!(match_id = %record.id, user = %user, error = %e, "New match notification failed");
        }
        match name {
            Ok(name) => name,
            Err(e) => {
                warn!(user = %user, error = %e, "Display name prefetch failed");
                None
            }
        }
    }

    async fn run_side_effects(&self, record: &Match) -> HashMap<UserId, String> {
        let participants = [record.user1_id.clone(), record.user2_id.clone()];
        let names = futures::future::join_all(
            participants
                .iter()
                .map(|user| self.side_effects_for(record, user)),
        )
        .await;
        participants
            .into_iter()
            .zip(names)
            .filter_map(|(user, name)| name.map(|n| (user, n)))
            .collect()
    }

    /// Soft delete: deactivate and record who unmatched. Messages are kept.
    ///
    /// A missing or already inactive match is a no-op.
    pub async fn unmatch(&self, match_id: &MatchId, by: &UserId) -> SyncResult<()> {
        let Some(record) = self.load(match_id).await? else {
            debug!(match_id = %match_id, "Unmatch of missing match ignored");
            return Ok(());
        };
        if !record.involves(by) {
            return Err(SyncError::Permission(format!(
                "{} is not a participant of {}",
                by, match_id
            )));
        }
        if !record.is_active {
            debug!(match_id = %match_id, "Match already inactive");
            return Ok(());
        }

        let batch = WriteBatch::with_key(IdempotencyToken::generate("unmatch"))
            .op(WriteOp::Update {
                collection: schema::MATCHES.to_string(),
                id: match_id.to_string(),
                fields: FieldWrites::new()
                    .set(match_fields::IS_ACTIVE, false)
                    .set(match_fields::UNMATCHED_BY, by.as_str())
                    .server_timestamp(match_fields::UNMATCHED_AT),
            })
            .op(release_pair_key(match_id));

        match self.store.commit(batch).await {
            Ok(_) => {
                info!(match_id = %match_id, by = %by, "Unmatched");
                Ok(())
            }
            Err(e) if e.is_benign() => {
                debug!(match_id = %match_id, "Match vanished during unmatch");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Hard delete the match, its messages and its pair key.
    ///
    /// Returns whether a match was found.
    pub async fn delete_match(&self, match_id: &MatchId) -> SyncResult<bool> {
        let Some(doc) = self.store.get(schema::MATCHES, match_id.as_str()).await? else {
            return Ok(false);
        };
        if let Err(e) = Match::from_document(&doc) {
            warn!(match_id = %match_id, error = %e, "Deleting malformed match");
        }
        let batch = WriteBatch::with_key(IdempotencyToken::generate("delete"))
            .op(WriteOp::DeleteWhere {
                collection: schema::MESSAGES.to_string(),
                predicate: schema::conversation(match_id),
            })
            .op(WriteOp::Delete {
                collection: schema::MATCHES.to_string(),
                id: match_id.to_string(),
            })
            .op(release_pair_key(match_id));
        self.store.commit(batch).await?;
        warn!(match_id = %match_id, "Match hard-deleted");
        Ok(true)
    }
}

/// Delete the pair key only if `match_id` still holds it.
fn release_pair_key(match_id: &MatchId) -> WriteOp {
    WriteOp::DeleteWhere {
        collection: schema::MATCH_PAIRS.to_string(),
        predicate: Predicate::eq(pair_fields::MATCH_ID, match_id.as_str()),
    }
}

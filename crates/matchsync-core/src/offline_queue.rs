//! Durable FIFO of write intents issued while disconnected.
//!
//! Operations are persisted in redb (see [`Storage`]) so they survive an app
//! restart, and replayed strictly in enqueue order once the connection
//! returns. Every operation carries an idempotency token that the backend
//! dedups on, so a replay after a lost acknowledgement is harmless.
//!
//! Outcome of each replayed operation:
//!
//! | result                  | queue action        | event       |
//! |-------------------------|---------------------|-------------|
//! | ok / duplicate          | remove              | `Applied`   |
//! | transient / timeout     | keep, stop flushing | `Deferred`  |
//! | not found (benign)      | remove              | `Discarded` |
//! | anything else (terminal)| remove              | `Dropped`   |

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backend::{DocumentStore, FieldWrites, WriteBatch, WriteOp};
use crate::error::{ErrorKind, SyncResult};
use crate::schema::{self, match_fields, message_fields};
use crate::storage::Storage;
use crate::types::{IdempotencyToken, OperationKind, PendingOperation};
use crate::unread::UnreadCounter;

/// Something that can apply a queued operation remotely.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operation: &PendingOperation) -> SyncResult<()>;
}

/// Applies operations against the backend, one atomic batch each.
pub struct RemoteOperationExecutor {
    store: Arc<dyn DocumentStore>,
}

impl RemoteOperationExecutor {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// The batch an operation commits.
    ///
    /// Shared by the online paths, so an online commit and a replay from the
    /// queue are the same write as far as the backend can tell.
    pub fn batch_for(token: &IdempotencyToken, kind: &OperationKind) -> WriteBatch {
        let batch = WriteBatch::with_key(token.clone());
        match kind {
            OperationKind::SendMessage {
                match_id,
                sender_id,
                receiver_id,
                text,
                ..
            } => batch
                .op(WriteOp::Create {
                    collection: schema::MESSAGES.to_string(),
                    id: token.message_id().to_string(),
                    fields: FieldWrites::new()
                        .set(message_fields::MATCH_ID, match_id.as_str())
                        .set(message_fields::SENDER_ID, sender_id.as_str())
                        .set(message_fields::RECEIVER_ID, receiver_id.as_str())
                        .set(message_fields::TEXT, text.as_str())
                        .set(message_fields::IS_READ, false)
                        .server_timestamp(message_fields::TIMESTAMP),
                })
                .op(WriteOp::Update {
                    collection: schema::MATCHES.to_string(),
                    id: match_id.to_string(),
                    fields: FieldWrites::new()
                        .set(match_fields::LAST_MESSAGE, text.as_str())
                        .server_timestamp(match_fields::LAST_MESSAGE_TIMESTAMP)
                        .set(match_fields::LAST_MESSAGE_SENDER_ID, sender_id.as_str()),
                })
                .op(UnreadCounter::increment_op(match_id, receiver_id)),
            OperationKind::MarkRead {
                match_id,
                reader_id,
            } => batch
                .op(WriteOp::UpdateWhere {
                    collection: schema::MESSAGES.to_string(),
                    predicate: schema::unread_addressed_to(match_id, reader_id),
                    fields: FieldWrites::new().set(message_fields::IS_READ, true),
                })
                .op(UnreadCounter::reset_op(match_id, reader_id)),
            OperationKind::ResetUnread { match_id, user_id } => {
                batch.op(UnreadCounter::reset_op(match_id, user_id))
            }
        }
    }
}

#[async_trait]
impl OperationExecutor for RemoteOperationExecutor {
    async fn execute(&self, operation: &PendingOperation) -> SyncResult<()> {
        let batch = Self::batch_for(&operation.token, &operation.kind);
        let outcome = self.store.commit(batch).await?;
        debug!(token = %operation.token, ?outcome, "Operation committed");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued {
        operation: PendingOperation,
    },
    Applied {
        operation: PendingOperation,
    },
    /// Left in the queue after a retryable failure
    Deferred {
        operation: PendingOperation,
        reason: String,
    },
    /// Abandoned after a terminal failure
    Dropped {
        operation: PendingOperation,
        kind: ErrorKind,
        reason: String,
    },
    /// Target no longer exists; removed without error
    Discarded {
        operation: PendingOperation,
        reason: String,
    },
}

/// Result of one [`OfflineOperationQueue::process_pending_operations`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub dropped: usize,
    pub discarded: usize,
    /// Still queued when the flush stopped
    pub remaining: usize,
}

pub struct OfflineOperationQueue {
    storage: Storage,
    executor: Arc<dyn OperationExecutor>,
    events: broadcast::Sender<QueueEvent>,
    enqueue_lock: Mutex<()>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl OfflineOperationQueue {
    pub fn new(storage: Storage, executor: Arc<dyn OperationExecutor>, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            storage,
            executor,
            events,
            enqueue_lock: Mutex::new(()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Queue `kind` under its own token.
    pub fn enqueue(&self, kind: OperationKind) -> SyncResult<PendingOperation> {
        self.enqueue_operation(PendingOperation::new(kind.token(), kind))
    }

    /// Queue an operation. A token already present is a no-op that returns
    /// the existing entry.
    pub fn enqueue_operation(&self, operation: PendingOperation) -> SyncResult<PendingOperation> {
        let _guard = self.enqueue_lock.lock();
        if let Some(existing) = self
            .storage
            .list_pending()?
            .into_iter()
            .find(|op| op.token == operation.token)
        {
            debug!(token = %existing.token, "Operation already queued");
            return Ok(existing);
        }
        let stored = self.storage.append_pending(&operation)?;
        info!(
            token = %stored.token,
            order = stored.order,
            op = stored.kind.label(),
            match_id = %stored.kind.match_id(),
            "Operation queued"
        );
        let _ = self.events.send(QueueEvent::Enqueued {
            operation: stored.clone(),
        });
        Ok(stored)
    }

    pub fn pending(&self) -> SyncResult<Vec<PendingOperation>> {
        self.storage.list_pending()
    }

    pub fn len(&self) -> SyncResult<usize> {
        Ok(self.storage.list_pending()?.len())
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.storage.first_pending()?.is_none())
    }

    /// Abandon everything queued. Returns how many operations were removed.
    pub fn clear(&self) -> SyncResult<usize> {
        let _guard = self.enqueue_lock.lock();
        let removed = self.storage.clear_pending()?;
        if removed > 0 {
            warn!(removed, "Offline queue cleared");
        }
        Ok(removed)
    }

    /// Replay queued operations strictly FIFO, awaiting each before the next.
    ///
    /// Stops at the first retryable failure so later operations never
    /// overtake an earlier one. Concurrent calls run one after another.
    pub async fn process_pending_operations(&self) -> SyncResult<FlushReport> {
        let _flush = self.flush_lock.lock().await;
        let mut report = FlushReport::default();

        while let Some(operation) = self.storage.first_pending()? {
            match self.executor.execute(&operation).await {
                Ok(()) => {
                    self.storage.remove_pending(operation.order)?;
                    report.applied += 1;
                    debug!(token = %operation.token, op = operation.kind.label(), "Queued operation applied");
                    let _ = self.events.send(QueueEvent::Applied { operation });
                }
                Err(e) if e.is_retryable() => {
                    info!(token = %operation.token, error = %e, "Queued operation deferred");
                    let _ = self.events.send(QueueEvent::Deferred {
                        operation,
                        reason: e.to_string(),
                    });
                    break;
                }
                Err(e) if e.is_benign() => {
                    self.storage.remove_pending(operation.order)?;
                    report.discarded += 1;
                    debug!(token = %operation.token, error = %e, "Queued operation discarded");
                    let _ = self.events.send(QueueEvent::Discarded {
                        operation,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    self.storage.remove_pending(operation.order)?;
                    report.dropped += 1;
                    warn!(token = %operation.token, op = operation.kind.label(), error = %e, "Queued operation dropped");
                    let _ = self.events.send(QueueEvent::Dropped {
                        operation,
                        kind: e.kind(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.remaining = self.storage.list_pending()?.len();
        if report != FlushReport::default() {
            info!(
                applied = report.applied,
                dropped = report.dropped,
                discarded = report.discarded,
                remaining = report.remaining,
                "Offline queue flushed"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::error::SyncError;
    use crate::types::{LocalId, MatchId, UserId};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Records execution order and answers from a script (default: Ok).
    #[derive(Default)]
    struct ScriptedExecutor {
        script: Mutex<VecDeque<Option<SyncError>>>,
        executed: Mutex<Vec<IdempotencyToken>>,
    }

    impl ScriptedExecutor {
        fn then_fail(&self, err: SyncError) {
            self.script.lock().push_back(Some(err));
        }

        fn then_ok(&self) {
            self.script.lock().push_back(None);
        }
    }

    #[async_trait]
    impl OperationExecutor for ScriptedExecutor {
        async fn execute(&self, operation: &PendingOperation) -> SyncResult<()> {
            self.executed.lock().push(operation.token.clone());
            match self.script.lock().pop_front().flatten() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn send(text: &str) -> OperationKind {
        OperationKind::SendMessage {
            local_id: LocalId::new(),
            match_id: MatchId::from("m1"),
            sender_id: UserId::from("a"),
            receiver_id: UserId::from("b"),
            text: text.to_string(),
        }
    }

    fn queue_with(executor: Arc<ScriptedExecutor>) -> OfflineOperationQueue {
        OfflineOperationQueue::new(Storage::in_memory().unwrap(), executor, 64)
    }

    #[tokio::test]
    async fn test_flush_is_fifo() {
        let executor = Arc::new(ScriptedExecutor::default());
        let queue = queue_with(executor.clone());
        let tokens: Vec<_> = (0..5)
            .map(|i| queue.enqueue(send(&format!("m{}", i))).unwrap().token)
            .collect();

        let report = queue.process_pending_operations().await.unwrap();
        assert_eq!(report.applied, 5);
        assert_eq!(report.remaining, 0);
        assert_eq!(*executor.executed.lock(), tokens);
    }

    #[tokio::test]
    async fn test_undecodable_record_does_not_jam_flush() {
        let executor = Arc::new(ScriptedExecutor::default());
        let storage = Storage::in_memory().unwrap();
        let queue = OfflineOperationQueue::new(storage.clone(), executor.clone(), 64);
        let corrupted = queue.enqueue(send("lost")).unwrap();
        let kept = queue.enqueue(send("kept")).unwrap();
        storage.put_raw_pending(corrupted.order, &[0xff, 0xff]).unwrap();

        let report = queue.process_pending_operations().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(*executor.executed.lock(), vec![kept.token]);
    }

    #[tokio::test]
    async fn test_duplicate_token_is_not_queued_twice() {
        let queue = queue_with(Arc::new(ScriptedExecutor::default()));
        let kind = send("hi");
        let first = queue.enqueue(kind.clone()).unwrap();
        let second = queue.enqueue(kind).unwrap();
        assert_eq!(first, second);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_stops_flush_in_order() {
        let executor = Arc::new(ScriptedExecutor::default());
        executor.then_ok();
        executor.then_fail(SyncError::TransientNetwork("offline".into()));
        let queue = queue_with(executor.clone());
        for i in 0..3 {
            queue.enqueue(send(&format!("m{}", i))).unwrap();
        }
        let mut events = queue.subscribe();

        let report = queue.process_pending_operations().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.remaining, 2);
        // Third operation was never attempted.
        assert_eq!(executor.executed.lock().len(), 2);

        assert!(matches!(events.recv().await.unwrap(), QueueEvent::Applied { .. }));
        assert!(matches!(events.recv().await.unwrap(), QueueEvent::Deferred { .. }));

        let report = queue.process_pending_operations().await.unwrap();
        assert_eq!(report.applied, 2);
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_terminal_failure_drops_and_continues() {
        let executor = Arc::new(ScriptedExecutor::default());
        executor.then_fail(SyncError::Permission("nope".into()));
        executor.then_fail(SyncError::NotFound("gone".into()));
        let queue = queue_with(executor);
        let dropped = queue.enqueue(send("a")).unwrap();
        queue.enqueue(send("b")).unwrap();
        queue.enqueue(send("c")).unwrap();
        let mut events = queue.subscribe();

        let report = queue.process_pending_operations().await.unwrap();
        assert_eq!(
            report,
            FlushReport {
                applied: 1,
                dropped: 1,
                discarded: 1,
                remaining: 0
            }
        );
        match events.recv().await.unwrap() {
            QueueEvent::Dropped {
                operation, kind, ..
            } => {
                assert_eq!(operation.token, dropped.token);
                assert_eq!(kind, ErrorKind::Permission);
            }
            other => panic!("expected Dropped, got {:?}", other),
        }
        assert!(matches!(events.recv().await.unwrap(), QueueEvent::Discarded { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_flushes_apply_each_operation_once() {
        let executor = Arc::new(ScriptedExecutor::default());
        let queue = Arc::new(queue_with(executor.clone()));
        for i in 0..10 {
            queue.enqueue(send(&format!("m{}", i))).unwrap();
        }

        let a = tokio::spawn({
            let queue = queue.clone();
            async move { queue.process_pending_operations().await.unwrap() }
        });
        let b = tokio::spawn({
            let queue = queue.clone();
            async move { queue.process_pending_operations().await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a.applied + b.applied, 10);
        assert_eq!(executor.executed.lock().len(), 10);
    }

    #[tokio::test]
    async fn test_remote_replay_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.insert_raw(
            schema::MATCHES,
            "m1",
            json!({"user1Id": "a", "user2Id": "b", "isActive": true, "createdAt": 1}),
        );
        let executor = RemoteOperationExecutor::new(Arc::new(backend.connect()));
        let kind = send("hello");
        let op = PendingOperation::new(kind.token(), kind);

        executor.execute(&op).await.unwrap();
        let after_once = (
            backend.documents(schema::MESSAGES),
            backend.document(schema::MATCHES, "m1"),
        );
        executor.execute(&op).await.unwrap();
        let after_twice = (
            backend.documents(schema::MESSAGES),
            backend.document(schema::MATCHES, "m1"),
        );
        assert_eq!(after_once, after_twice);
        assert_eq!(after_once.0.len(), 1);
        let m = after_once.1.unwrap();
        assert_eq!(m.data["unreadCount"]["b"], json!(1));
        assert_eq!(m.data["lastMessage"], json!("hello"));
    }

    #[tokio::test]
    async fn test_send_to_deleted_match_is_discarded() {
        let backend = MemoryBackend::new();
        let executor = Arc::new(RemoteOperationExecutor::new(Arc::new(backend.connect())));
        let queue = OfflineOperationQueue::new(Storage::in_memory().unwrap(), executor, 16);
        queue.enqueue(send("into the void")).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), queue.process_pending_operations())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.discarded, 1);
        assert!(backend.documents(schema::MESSAGES).is_empty());
    }
}

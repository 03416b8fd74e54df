//! Per-match live message streams, pagination and the send pipeline.
//!
//! Each open conversation owns a [`ConversationBuffer`] and a private event
//! channel. Closing a conversation removes both under the state lock, so
//! nothing from it can reach a conversation opened afterwards.
//!
//! Sends are echoed immediately as `Pending` entries. The write itself is
//! the same atomic batch whether it is committed online or replayed by the
//! [`OfflineOperationQueue`]: message create, match preview update and the
//! receiver's unread increment, all under the send's idempotency token.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{Cursor, Document, DocumentChange, DocumentStore, ListenEvent, Listener};
use crate::config::SyncConfig;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::notifications::{preview, Notification, NotificationDispatcher};
use crate::offline_queue::{OfflineOperationQueue, QueueEvent, RemoteOperationExecutor};
use crate::schema;
use crate::types::{
    now_millis, ChatEntry, ConnectionState, DeliveryState, IdempotencyToken, LocalId, MatchId,
    Message, MessageId, OperationKind, PendingOperation, UserId,
};

mod buffer;

pub use buffer::ConversationBuffer;

const PREVIEW_CHARS: usize = 80;

/// Incremental change to an open conversation.
///
/// Indices refer to the conversation's visible sequence (confirmed entries
/// followed by local ones) after the change, except `Moved::from`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    Appended(ChatEntry),
    Inserted { index: usize, entry: ChatEntry },
    Updated { index: usize, entry: ChatEntry },
    /// A local entry was confirmed and took its server position
    Moved {
        /// Position before the change; remove here, then insert at `to`
        from: usize,
        to: usize,
        entry: ChatEntry,
    },
    /// An older page was merged at the head
    Prepended(Vec<ChatEntry>),
    /// The live subscription dropped; delivered entries stay valid
    Interrupted { reason: String },
    Resumed,
}

/// Handle returned by [`ConversationSync::open`].
///
/// Yields `None` once the conversation is closed or replaced.
pub struct ConversationStream {
    pub match_id: MatchId,
    /// Entries at the moment the stream was handed out, oldest first
    pub initial: Vec<ChatEntry>,
    pub is_live: bool,
    events: mpsc::UnboundedReceiver<ConversationEvent>,
}

impl ConversationStream {
    pub async fn next(&mut self) -> Option<ConversationEvent> {
        self.events.recv().await
    }

    pub fn try_next(&mut self) -> Option<ConversationEvent> {
        self.events.try_recv().ok()
    }
}

struct OpenConversation {
    /// Identity of the `open` call
    session: u64,
    /// Identity of the current listener
    generation: u64,
    buffer: ConversationBuffer,
    sender: Option<mpsc::UnboundedSender<ConversationEvent>>,
    listener_task: Option<JoinHandle<()>>,
    is_live: bool,
}

impl OpenConversation {
    fn new(id: u64) -> Self {
        Self {
            session: id,
            generation: id,
            buffer: ConversationBuffer::new(),
            sender: None,
            listener_task: None,
            is_live: false,
        }
    }

    fn emit(&self, event: ConversationEvent) {
        if let Some(tx) = &self.sender {
            let _ = tx.send(event);
        }
    }

    fn emit_all(&self, events: impl IntoIterator<Item = ConversationEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    fn release(&mut self) {
        if let Some(task) = self.listener_task.take() {
            task.abort();
        }
        self.sender = None;
        self.is_live = false;
    }
}

#[derive(Default)]
struct SyncState {
    next_id: u64,
    open: HashMap<MatchId, OpenConversation>,
    /// Abandoned sends, kept so `retry` can re-issue them
    failed: HashMap<LocalId, OperationKind>,
}

impl SyncState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

enum Submitted {
    Committed,
    Queued,
}

fn decode_messages(docs: impl IntoIterator<Item = Document>) -> Vec<Message> {
    docs.into_iter()
        .filter_map(|doc| match Message::from_document(&doc) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(message_id = %doc.id, error = %e, "Skipping malformed message");
                None
            }
        })
        .collect()
}

/// The optimistic copy of a send, addressed by its future remote id.
fn local_echo(kind: &OperationKind) -> Option<(LocalId, Message)> {
    match kind {
        OperationKind::SendMessage {
            local_id,
            match_id,
            sender_id,
            receiver_id,
            text,
        } => Some((
            *local_id,
            Message {
                id: local_id.send_token().message_id(),
                match_id: match_id.clone(),
                sender_id: sender_id.clone(),
                receiver_id: receiver_id.clone(),
                text: text.clone(),
                timestamp: now_millis(),
                is_read: false,
                sequence: 0,
            },
        )),
        _ => None,
    }
}

struct SyncInner {
    store: Arc<dyn DocumentStore>,
    queue: Arc<OfflineOperationQueue>,
    connectivity: watch::Receiver<ConnectionState>,
    notifier: Arc<dyn NotificationDispatcher>,
    config: SyncConfig,
    state: Mutex<SyncState>,
}

impl SyncInner {
    fn with_open<R>(&self, match_id: &MatchId, f: impl FnOnce(&mut OpenConversation) -> R) -> Option<R> {
        let mut state = self.state.lock();
        state.open.get_mut(match_id).map(f)
    }

    async fn listen_window(&self, match_id: &MatchId) -> SyncResult<Listener> {
        let query = schema::recent_messages(match_id, self.config.message_page_size);
        let timeout = self.config.listen_timeout();
        match tokio::time::timeout(timeout, self.store.listen(query)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::timeout(format!("conversation {}", match_id), timeout)),
        }
    }

    /// Merge a listener's snapshot and start draining it.
    ///
    /// Returns `false` if the conversation was closed or re-subscribed meanwhile.
    fn attach(self: &Arc<Self>, match_id: &MatchId, generation: u64, listener: Listener) -> bool {
        let mut state = self.state.lock();
        let Some(open) = state
            .open
            .get_mut(match_id)
            .filter(|o| o.generation == generation)
        else {
            return false;
        };
        let window = decode_messages(listener.initial.iter().cloned());
        for message in window.into_iter().rev() {
            if let Some(event) = open.buffer.apply_remote(message) {
                open.emit(event);
            }
        }
        let resumed = open.sender.is_some();
        open.is_live = true;
        open.listener_task = Some(tokio::spawn(self.clone().run_listener(
            match_id.clone(),
            generation,
            listener,
        )));
        if resumed {
            open.emit(ConversationEvent::Resumed);
        }
        true
    }

    async fn run_listener(self: Arc<Self>, match_id: MatchId, generation: u64, mut listener: Listener) {
        while let Some(event) = listener.next().await {
            match event {
                ListenEvent::Changes(changes) => {
                    let docs = changes.into_iter().filter_map(|change| match change {
                        DocumentChange::Added(doc) | DocumentChange::Modified(doc) => Some(doc),
                        // Leaving the live window is not a deletion.
                        DocumentChange::Removed { .. } => None,
                    });
                    let messages = decode_messages(docs);
                    let mut state = self.state.lock();
                    let Some(open) = state
                        .open
                        .get_mut(&match_id)
                        .filter(|o| o.generation == generation)
                    else {
                        return;
                    };
                    for message in messages {
                        if let Some(event) = open.buffer.apply_remote(message) {
                            open.emit(event);
                        }
                    }
                }
                ListenEvent::Error(e) => {
                    self.interrupt(&match_id, generation, e.to_string());
                    return;
                }
            }
        }
        self.interrupt(&match_id, generation, "listener closed".to_string());
    }

    fn interrupt(&self, match_id: &MatchId, generation: u64, reason: String) {
        let mut state = self.state.lock();
        if let Some(open) = state
            .open
            .get_mut(match_id)
            .filter(|o| o.generation == generation)
        {
            warn!(match_id = %match_id, reason = %reason, "Conversation subscription dropped");
            open.is_live = false;
            open.listener_task = None;
            open.emit(ConversationEvent::Interrupted { reason });
        }
    }

    fn is_connected(&self) -> bool {
        self.connectivity.borrow().is_connected
    }

    /// Commit online, or queue when offline or when commit hits a
    /// retryable failure.
    async fn submit(&self, kind: &OperationKind, token: IdempotencyToken) -> SyncResult<Submitted> {
        let operation = PendingOperation::new(token.clone(), kind.clone());
        if !self.is_connected() {
            self.queue.enqueue_operation(operation)?;
            return Ok(Submitted::Queued);
        }
        if !self.queue.is_empty()? {
            // Earlier operations are still waiting; stay behind them.
            self.queue.enqueue_operation(operation)?;
            self.queue.process_pending_operations().await?;
            return Ok(Submitted::Queued);
        }
        match self
            .store
            .commit(RemoteOperationExecutor::batch_for(&token, kind))
            .await
        {
            Ok(outcome) => {
                debug!(token = %token, op = kind.label(), ?outcome, "Committed online");
                Ok(Submitted::Committed)
            }
            Err(e) if e.is_retryable() => {
                info!(token = %token, error = %e, "Commit failed, queued for replay");
                self.queue.enqueue_operation(operation)?;
                Ok(Submitted::Queued)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch the confirmed copy of a send and merge it if the conversation is open.
    async fn confirm_send(&self, match_id: &MatchId, token: &IdempotencyToken) -> Option<Message> {
        let id = token.message_id();
        let doc = match self.store.get(schema::MESSAGES, id.as_str()).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return None,
            Err(e) => {
                debug!(message_id = %id, error = %e, "Confirmation fetch failed, waiting for listener");
                return None;
            }
        };
        let message = Message::from_document(&doc).ok()?;
        self.with_open(match_id, |open| {
            if let Some(event) = open.buffer.apply_remote(message.clone()) {
                open.emit(event);
            }
        });
        Some(message)
    }

    fn fail_send(&self, local_id: LocalId, kind: OperationKind, reason: String) {
        let mut state = self.state.lock();
        if let Some(open) = state.open.get_mut(kind.match_id()) {
            if let Some(event) = open.buffer.mark_failed(local_id, reason.clone()) {
                open.emit(event);
            }
        }
        warn!(local_id = %local_id, reason = %reason, "Send failed");
        state.failed.insert(local_id, kind);
    }

    async fn notify_new_message(&self, kind: &OperationKind, token: &IdempotencyToken) {
        let OperationKind::SendMessage {
            match_id,
            sender_id,
            receiver_id,
            text,
            ..
        } = kind
        else {
            return;
        };
        let notification = Notification::NewMessage {
            match_id: match_id.clone(),
            message_id: token.message_id(),
            sender_id: sender_id.clone(),
            recipient: receiver_id.clone(),
            preview: preview(text, PREVIEW_CHARS),
        };
        if let Err(e) = self.notifier.dispatch(notification).await {
            warn!(match_id = %match_id, error = %e, "New message notification failed");
        }
    }

    async fn deliver(&self, local_id: LocalId, kind: OperationKind, echo: Message) -> SyncResult<ChatEntry> {
        let token = local_id.send_token();
        match self.submit(&kind, token.clone()).await {
            Ok(Submitted::Committed) => {
                self.state.lock().failed.remove(&local_id);
                let confirmed = self.confirm_send(kind.match_id(), &token).await;
                self.notify_new_message(&kind, &token).await;
                Ok(match confirmed {
                    Some(message) => ChatEntry::sent(message),
                    None => ChatEntry {
                        message: echo,
                        state: DeliveryState::Sent {
                            remote_id: token.message_id(),
                        },
                    },
                })
            }
            Ok(Submitted::Queued) => Ok(ChatEntry::pending(echo, local_id)),
            Err(e) => {
                self.fail_send(local_id, kind, e.to_string());
                Err(e)
            }
        }
    }

    async fn on_queue_event(&self, event: QueueEvent) {
        match event {
            QueueEvent::Applied { operation } => {
                if let OperationKind::SendMessage {
                    local_id, match_id, ..
                } = &operation.kind
                {
                    self.state.lock().failed.remove(local_id);
                    self.confirm_send(match_id, &operation.token).await;
                    self.notify_new_message(&operation.kind, &operation.token).await;
                }
            }
            QueueEvent::Dropped {
                operation, reason, ..
            }
            | QueueEvent::Discarded { operation, reason } => {
                if let OperationKind::SendMessage { local_id, .. } = &operation.kind {
                    self.fail_send(*local_id, operation.kind.clone(), reason);
                }
            }
            QueueEvent::Enqueued { .. } | QueueEvent::Deferred { .. } => {}
        }
    }
}

async fn run_queue_events(inner: Arc<SyncInner>, mut events: broadcast::Receiver<QueueEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => inner.on_queue_event(event).await,
            Err(RecvError::Lagged(missed)) => warn!(missed, "Conversation sync missed queue events"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Live conversations for one device.
pub struct ConversationSync {
    inner: Arc<SyncInner>,
    queue_task: JoinHandle<()>,
}

impl ConversationSync {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        queue: Arc<OfflineOperationQueue>,
        connectivity: watch::Receiver<ConnectionState>,
        notifier: Arc<dyn NotificationDispatcher>,
        config: SyncConfig,
    ) -> Self {
        let queue_events = queue.subscribe();
        let inner = Arc::new(SyncInner {
            store,
            queue,
            connectivity,
            notifier,
            config,
            state: Mutex::new(SyncState::default()),
        });
        let queue_task = tokio::spawn(run_queue_events(inner.clone(), queue_events));
        Self { inner, queue_task }
    }

    /// Subscribe to the most recent page of `match_id`.
    ///
    /// Re-opening an open conversation releases the old subscription and
    /// ends its stream first. A transient failure yields a not-live stream
    /// that [`reestablish`](Self::reestablish) later fills.
    pub async fn open(&self, match_id: &MatchId) -> SyncResult<ConversationStream> {
        let generation = {
            let mut state = self.inner.state.lock();
            if let Some(mut previous) = state.open.remove(match_id) {
                previous.release();
                debug!(match_id = %match_id, "Replacing open conversation");
            }
            let id = state.next_id();
            state.open.insert(match_id.clone(), OpenConversation::new(id));
            id
        };
        info!(match_id = %match_id, "Opening conversation");

        match self.inner.listen_window(match_id).await {
            Ok(listener) => {
                self.inner.attach(match_id, generation, listener);
            }
            Err(e) if e.kind() == ErrorKind::TransientNetwork => {
                warn!(match_id = %match_id, error = %e, "Conversation opened without live subscription");
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                if state.open.get(match_id).map(|o| o.session) == Some(generation) {
                    state.open.remove(match_id);
                }
                return Err(e);
            }
        }

        let mut state = self.inner.state.lock();
        let Some(open) = state
            .open
            .get_mut(match_id)
            .filter(|o| o.session == generation)
        else {
            return Err(SyncError::InvalidOperation(format!(
                "conversation {} closed while opening",
                match_id
            )));
        };
        let (tx, rx) = mpsc::unbounded_channel();
        open.sender = Some(tx);
        Ok(ConversationStream {
            match_id: match_id.clone(),
            initial: open.buffer.entries(),
            is_live: open.is_live,
            events: rx,
        })
    }

    /// Release the subscription. Returns whether the conversation was open.
    pub fn close(&self, match_id: &MatchId) -> bool {
        let mut state = self.inner.state.lock();
        match state.open.remove(match_id) {
            Some(mut open) => {
                open.release();
                info!(match_id = %match_id, "Conversation closed");
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self, match_id: &MatchId) -> bool {
        self.inner.state.lock().open.contains_key(match_id)
    }

    pub fn is_live(&self, match_id: &MatchId) -> bool {
        self.inner
            .state
            .lock()
            .open
            .get(match_id)
            .map_or(false, |o| o.is_live)
    }

    pub fn open_conversations(&self) -> Vec<MatchId> {
        self.inner.state.lock().open.keys().cloned().collect()
    }

    /// Current entries of an open conversation, oldest first.
    pub fn entries(&self, match_id: &MatchId) -> Option<Vec<ChatEntry>> {
        self.inner.with_open(match_id, |open| open.buffer.entries())
    }

    /// Fetch the page immediately older than `before` (or than the oldest
    /// delivered entry) and merge it at the head.
    ///
    /// Returns how many entries were added.
    pub async fn load_older(&self, match_id: &MatchId, before: Option<Cursor>) -> SyncResult<usize> {
        let (session, cursor) = self
            .inner
            .with_open(match_id, |open| {
                (open.session, before.or_else(|| open.buffer.oldest_cursor()))
            })
            .ok_or_else(|| {
                SyncError::InvalidOperation(format!("conversation {} is not open", match_id))
            })?;
        let Some(cursor) = cursor else {
            return Ok(0);
        };

        let query = schema::older_messages(match_id, cursor, self.inner.config.message_page_size);
        let page = decode_messages(self.inner.store.query(&query).await?);

        let added = self.inner.with_open(match_id, |open| {
            if open.session != session {
                return 0;
            }
            let before = open.buffer.len();
            let events = open.buffer.merge_older(page);
            open.emit_all(events);
            open.buffer.len() - before
        });
        let added = added.unwrap_or(0);
        debug!(match_id = %match_id, added, "Loaded older messages");
        Ok(added)
    }

    /// Send a message.
    ///
    /// The returned entry is `Sent` when committed online and `Pending` when
    /// queued; queued outcomes arrive later as stream events. A terminal
    /// failure marks the entry `Failed` and is returned.
    pub async fn send(
        &self,
        match_id: &MatchId,
        sender_id: &UserId,
        receiver_id: &UserId,
        text: impl Into<String>,
    ) -> SyncResult<ChatEntry> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(SyncError::InvalidOperation("empty message".to_string()));
        }
        let kind = OperationKind::SendMessage {
            local_id: LocalId::new(),
            match_id: match_id.clone(),
            sender_id: sender_id.clone(),
            receiver_id: receiver_id.clone(),
            text,
        };
        let Some((local_id, echo)) = local_echo(&kind) else {
            return Err(SyncError::InvalidOperation("not a send".to_string()));
        };
        self.inner.with_open(match_id, |open| {
            let event = open.buffer.push_pending(ChatEntry::pending(echo.clone(), local_id));
            open.emit(event);
        });
        debug!(match_id = %match_id, local_id = %local_id, "Sending message");
        self.inner.deliver(local_id, kind, echo).await
    }

    /// Re-issue a failed send under its original token.
    pub async fn retry(&self, match_id: &MatchId, local_id: LocalId) -> SyncResult<ChatEntry> {
        let kind = {
            let mut state = self.inner.state.lock();
            let kind = state
                .failed
                .get(&local_id)
                .filter(|k| k.match_id() == match_id)
                .cloned()
                .ok_or_else(|| {
                    SyncError::InvalidOperation(format!("no failed send {}", local_id))
                })?;
            state.failed.remove(&local_id);
            if let Some(open) = state.open.get_mut(match_id) {
                if let Some(event) = open.buffer.mark_pending(local_id) {
                    open.emit(event);
                }
            }
            kind
        };
        let echo = self
            .inner
            .with_open(match_id, |open| {
                open.buffer.local_entry(local_id).map(|e| e.message.clone())
            })
            .flatten()
            .or_else(|| local_echo(&kind).map(|(_, message)| message))
            .ok_or_else(|| SyncError::InvalidOperation("not a send".to_string()))?;
        info!(match_id = %match_id, local_id = %local_id, "Retrying send");
        self.inner.deliver(local_id, kind, echo).await
    }

    /// Mark everything addressed to `reader_id` as read and zero their
    /// counter, as one batch.
    ///
    /// The local flip is undone if the batch fails terminally.
    pub async fn mark_read(&self, match_id: &MatchId, reader_id: &UserId) -> SyncResult<()> {
        let flipped = self
            .inner
            .with_open(match_id, |open| {
                let events = open.buffer.mark_read_by(reader_id);
                let flipped: Vec<MessageId> = events
                    .iter()
                    .filter_map(|event| match event {
                        ConversationEvent::Updated { entry, .. } => Some(entry.id().clone()),
                        _ => None,
                    })
                    .collect();
                open.emit_all(events);
                flipped
            })
            .unwrap_or_default();
        let kind = OperationKind::MarkRead {
            match_id: match_id.clone(),
            reader_id: reader_id.clone(),
        };

        let result = self.submit_benign(kind).await;
        if let Err(e) = &result {
            if !flipped.is_empty() {
                warn!(match_id = %match_id, error = %e, reverted = flipped.len(), "Mark read failed, restoring unread state");
                self.inner.with_open(match_id, |open| {
                    let events = open.buffer.restore_unread(&flipped);
                    open.emit_all(events);
                });
            }
        }
        result
    }

    /// Zero `user_id`'s counter without touching message read state.
    pub async fn reset_unread(&self, match_id: &MatchId, user_id: &UserId) -> SyncResult<()> {
        let kind = OperationKind::ResetUnread {
            match_id: match_id.clone(),
            user_id: user_id.clone(),
        };
        self.submit_benign(kind).await
    }

    async fn submit_benign(&self, kind: OperationKind) -> SyncResult<()> {
        match self.inner.submit(&kind, kind.token()).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_benign() => {
                debug!(match_id = %kind.match_id(), error = %e, "Match gone, nothing to update");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Local sends that were abandoned and can be retried.
    pub fn failed_sends(&self) -> Vec<LocalId> {
        self.inner.state.lock().failed.keys().copied().collect()
    }

    /// Re-open dropped subscriptions, merging each fresh window by id.
    ///
    /// Returns how many conversations went live again.
    pub async fn reestablish(&self) -> SyncResult<usize> {
        let targets: Vec<MatchId> = {
            let state = self.inner.state.lock();
            state
                .open
                .iter()
                .filter(|(_, o)| !o.is_live)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut restored = 0;
        for match_id in targets {
            let generation = {
                let mut state = self.inner.state.lock();
                let id = state.next_id();
                match state.open.get_mut(&match_id) {
                    Some(open) if !open.is_live => {
                        open.generation = id;
                        id
                    }
                    _ => continue,
                }
            };
            match self.inner.listen_window(&match_id).await {
                Ok(listener) => {
                    if self.inner.attach(&match_id, generation, listener) {
                        info!(match_id = %match_id, "Conversation subscription re-established");
                        restored += 1;
                    }
                }
                Err(e) if e.is_retryable() => {
                    debug!(match_id = %match_id, error = %e, "Conversation still unreachable");
                }
                Err(e) => {
                    warn!(match_id = %match_id, error = %e, "Could not re-establish conversation");
                }
            }
        }
        Ok(restored)
    }
}

impl Drop for ConversationSync {
    fn drop(&mut self) {
        self.queue_task.abort();
        let mut state = self.inner.state.lock();
        for open in state.open.values_mut() {
            open.release();
        }
        state.open.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FieldWrites, MemoryBackend, MemoryConnection, WriteBatch, WriteOp};
    use crate::notifications::LogNotifier;
    use crate::storage::Storage;
    use crate::types::{ConnectionQuality, ConnectionType};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        backend: MemoryBackend,
        conn: MemoryConnection,
        online: watch::Sender<ConnectionState>,
        queue: Arc<OfflineOperationQueue>,
        sync: ConversationSync,
    }

    fn harness() -> Harness {
        let backend = MemoryBackend::new();
        backend.insert_raw(
            schema::MATCHES,
            "m1",
            json!({"user1Id": "a", "user2Id": "b", "isActive": true, "createdAt": 1}),
        );
        backend.insert_raw(
            schema::MATCHES,
            "m2",
            json!({"user1Id": "a", "user2Id": "c", "isActive": true, "createdAt": 2}),
        );
        let conn = backend.connect();
        let store: Arc<dyn DocumentStore> = Arc::new(conn.clone());
        let queue = Arc::new(OfflineOperationQueue::new(
            Storage::in_memory().unwrap(),
            Arc::new(RemoteOperationExecutor::new(store.clone())),
            64,
        ));
        let (online, rx) = watch::channel(ConnectionState::connected(
            ConnectionType::Wifi,
            ConnectionQuality::Excellent,
        ));
        let config = SyncConfig {
            message_page_size: 3,
            ..SyncConfig::default()
        };
        let sync = ConversationSync::new(store, queue.clone(), rx, Arc::new(LogNotifier), config);
        Harness {
            backend,
            conn,
            online,
            queue,
            sync,
        }
    }

    fn go_offline(h: &Harness) {
        h.conn.set_online(false);
        h.online.send_replace(ConnectionState::disconnected());
    }

    fn go_online(h: &Harness) {
        h.conn.set_online(true);
        h.online.send_replace(ConnectionState::connected(
            ConnectionType::Wifi,
            ConnectionQuality::Excellent,
        ));
    }

    async fn next(stream: &mut ConversationStream) -> ConversationEvent {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("event in time")
            .expect("stream open")
    }

    fn a() -> UserId {
        UserId::from("a")
    }

    fn b() -> UserId {
        UserId::from("b")
    }

    fn m1() -> MatchId {
        MatchId::from("m1")
    }

    #[tokio::test]
    async fn test_online_send_is_sent_and_counts_unread() {
        let h = harness();
        let mut stream = h.sync.open(&m1()).await.unwrap();
        assert!(stream.initial.is_empty());
        assert!(stream.is_live);

        let entry = h.sync.send(&m1(), &a(), &b(), "hello").await.unwrap();
        assert!(entry.is_confirmed());

        assert!(matches!(next(&mut stream).await, ConversationEvent::Appended(e) if !e.is_confirmed()));
        assert!(matches!(next(&mut stream).await, ConversationEvent::Updated { index: 0, entry } if entry.is_confirmed()));

        let m = h.backend.document(schema::MATCHES, "m1").unwrap();
        assert_eq!(m.data["unreadCount"]["b"], json!(1));
        assert_eq!(m.data["lastMessage"], json!("hello"));
        assert_eq!(m.data["lastMessageSenderId"], json!("a"));
        assert_eq!(h.sync.entries(&m1()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_send_is_queued_then_confirmed() {
        let h = harness();
        let mut stream = h.sync.open(&m1()).await.unwrap();
        go_offline(&h);
        assert!(matches!(next(&mut stream).await, ConversationEvent::Interrupted { .. }));

        let entry = h.sync.send(&m1(), &a(), &b(), "later").await.unwrap();
        assert!(matches!(entry.state, DeliveryState::Pending { .. }));
        assert!(matches!(next(&mut stream).await, ConversationEvent::Appended(_)));
        assert_eq!(h.queue.len().unwrap(), 1);
        assert!(h.backend.documents(schema::MESSAGES).is_empty());

        go_online(&h);
        let report = h.queue.process_pending_operations().await.unwrap();
        assert_eq!(report.applied, 1);

        assert!(matches!(next(&mut stream).await, ConversationEvent::Updated { entry, .. } if entry.is_confirmed()));
        assert_eq!(h.backend.documents(schema::MESSAGES).len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_failure_marks_failed_and_retry_reuses_token() {
        let h = harness();
        let mut stream = h.sync.open(&m1()).await.unwrap();
        h.backend.deny_writes(schema::MESSAGES);

        let err = h.sync.send(&m1(), &a(), &b(), "nope").await.unwrap_err();
        assert!(matches!(err, SyncError::Permission(_)));
        let _ = next(&mut stream).await;
        let local_id = match next(&mut stream).await {
            ConversationEvent::Updated { entry, .. } => match entry.state {
                DeliveryState::Failed { local_id, .. } => local_id,
                other => panic!("expected Failed, got {:?}", other),
            },
            other => panic!("expected Updated, got {:?}", other),
        };
        assert_eq!(h.sync.failed_sends(), vec![local_id]);

        h.backend.allow_all();
        let entry = h.sync.retry(&m1(), local_id).await.unwrap();
        assert!(entry.is_confirmed());
        assert_eq!(entry.id(), &local_id.send_token().message_id());
        assert!(h.sync.failed_sends().is_empty());
        assert!(h.sync.retry(&m1(), local_id).await.is_err());
    }

    #[tokio::test]
    async fn test_switching_conversations_isolates_streams() {
        let h = harness();
        let mut first = h.sync.open(&m1()).await.unwrap();
        assert!(h.sync.close(&m1()));
        let mut second = h.sync.open(&MatchId::from("m2")).await.unwrap();

        h.conn
            .commit(RemoteOperationExecutor::batch_for(
                &LocalId::new().send_token(),
                &OperationKind::SendMessage {
                    local_id: LocalId::new(),
                    match_id: m1(),
                    sender_id: b(),
                    receiver_id: a(),
                    text: "for m1".to_string(),
                },
            ))
            .await
            .unwrap();

        // Old stream ended; new stream saw nothing.
        assert!(first.next().await.is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(second.try_next().is_none());
        assert_eq!(h.sync.open_conversations(), vec![MatchId::from("m2")]);
    }

    #[tokio::test]
    async fn test_reopen_replaces_stream() {
        let h = harness();
        let mut first = h.sync.open(&m1()).await.unwrap();
        let _second = h.sync.open(&m1()).await.unwrap();
        assert!(first.next().await.is_none());
        tokio::task::yield_now().await;
        assert_eq!(h.backend.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_load_older_prepends_page() {
        let h = harness();
        for i in 0..5 {
            h.sync
                .send(&m1(), &a(), &b(), format!("msg {}", i))
                .await
                .unwrap();
        }
        let stream = h.sync.open(&m1()).await.unwrap();
        let texts: Vec<_> = stream.initial.iter().map(|e| e.message.text.clone()).collect();
        assert_eq!(texts, vec!["msg 2", "msg 3", "msg 4"]);

        assert_eq!(h.sync.load_older(&m1(), None).await.unwrap(), 2);
        assert_eq!(h.sync.load_older(&m1(), None).await.unwrap(), 0);
        let texts: Vec<_> = h
            .sync
            .entries(&m1())
            .unwrap()
            .iter()
            .map(|e| e.message.text.clone())
            .collect();
        assert_eq!(texts, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
    }

    #[tokio::test]
    async fn test_mark_read_flips_messages_and_resets_counter() {
        let h = harness();
        h.sync.send(&m1(), &a(), &b(), "one").await.unwrap();
        h.sync.send(&m1(), &a(), &b(), "two").await.unwrap();
        h.sync.send(&m1(), &b(), &a(), "reply").await.unwrap();

        h.sync.mark_read(&m1(), &b()).await.unwrap();
        let m = h.backend.document(schema::MATCHES, "m1").unwrap();
        assert_eq!(m.data["unreadCount"]["b"], json!(0));
        assert_eq!(m.data["unreadCount"]["a"], json!(1));
        let unread: Vec<_> = h
            .backend
            .documents(schema::MESSAGES)
            .into_iter()
            .filter(|d| d.data["isRead"] == json!(false))
            .collect();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].data["receiverId"], json!("a"));
    }

    #[tokio::test]
    async fn test_failed_mark_read_restores_unread_entries() {
        let h = harness();
        h.sync.send(&m1(), &a(), &b(), "one").await.unwrap();
        h.sync.send(&m1(), &a(), &b(), "two").await.unwrap();
        let mut stream = h.sync.open(&m1()).await.unwrap();
        assert_eq!(stream.initial.len(), 2);
        h.backend.deny_writes(schema::MESSAGES);

        let err = h.sync.mark_read(&m1(), &b()).await.unwrap_err();
        assert!(matches!(err, SyncError::Permission(_)));

        let mut read_states = Vec::new();
        for _ in 0..4 {
            match next(&mut stream).await {
                ConversationEvent::Updated { entry, .. } => read_states.push(entry.message.is_read),
                other => panic!("expected Updated, got {:?}", other),
            }
        }
        assert_eq!(read_states, vec![true, true, false, false]);
        assert!(h
            .sync
            .entries(&m1())
            .unwrap()
            .iter()
            .all(|e| !e.message.is_read));
    }

    #[tokio::test]
    async fn test_mark_read_on_missing_match_is_benign() {
        let h = harness();
        h.sync
            .mark_read(&MatchId::from("gone"), &b())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reestablish_merges_missed_messages() {
        let h = harness();
        let mut stream = h.sync.open(&m1()).await.unwrap();
        go_offline(&h);
        assert!(matches!(next(&mut stream).await, ConversationEvent::Interrupted { .. }));
        assert!(!h.sync.is_live(&m1()));

        // The partner writes while we are away.
        let other = h.backend.connect();
        other
            .commit(WriteBatch::new().op(WriteOp::Create {
                collection: schema::MESSAGES.to_string(),
                id: "from-b".to_string(),
                fields: FieldWrites::new()
                    .set("matchId", "m1")
                    .set("senderId", "b")
                    .set("receiverId", "a")
                    .set("text", "missed you")
                    .server_timestamp("timestamp"),
            }))
            .await
            .unwrap();

        go_online(&h);
        assert_eq!(h.sync.reestablish().await.unwrap(), 1);
        assert!(matches!(next(&mut stream).await, ConversationEvent::Appended(e) if e.message.text == "missed you"));
        assert!(matches!(next(&mut stream).await, ConversationEvent::Resumed));
        assert_eq!(h.sync.reestablish().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let h = harness();
        assert!(matches!(
            h.sync.send(&m1(), &a(), &b(), "   ").await,
            Err(SyncError::InvalidOperation(_))
        ));
    }
}

//! In-process reference backend.
//!
//! Implements the full [`DocumentStore`] contract under a single lock:
//! predicates (including disjunctions) are evaluated on the "server" side,
//! batches are all-or-nothing, and every committed batch produces one
//! consistent diff per affected listener.
//!
//! Each device talks to the shared backend through its own
//! [`MemoryConnection`], which can be taken offline independently. An
//! offline connection fails every call with `TransientNetwork` and loses
//! its listeners, which is what a real client SDK does when the socket drops.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::value::{remove_path, set_path};
use super::{
    compare_values, get_path, CommitOutcome, Direction, Document, DocumentChange, DocumentStore,
    FieldValue, FieldWrites, ListenEvent, Listener, ListenerRegistration, Query, WriteBatch,
    WriteOp,
};
use crate::error::{SyncError, SyncResult};
use crate::types::now_millis;

#[derive(Debug, Clone)]
struct StoredDoc {
    data: Value,
    sequence: u64,
    revision: u64,
}

type Collection = BTreeMap<String, StoredDoc>;

struct ListenerEntry {
    connection: u64,
    query: Query,
    /// id → revision last pushed to this listener
    known: HashMap<String, u64>,
    tx: mpsc::UnboundedSender<ListenEvent>,
}

#[derive(Default)]
struct BackendState {
    collections: HashMap<String, Collection>,
    next_sequence: u64,
    last_timestamp: i64,
    applied_keys: HashSet<String>,
    listeners: HashMap<u64, ListenerEntry>,
    next_listener_id: u64,
    next_connection_id: u64,
    offline: HashSet<u64>,
    denied_reads: HashSet<String>,
    denied_writes: HashSet<String>,
    /// Number of upcoming commits to apply and then report as failed
    lost_acks: u32,
    /// Number of upcoming commits to reject without applying
    rejected_commits: u32,
    applied_commits: u64,
}

/// Shared in-memory document store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Mutex<BackendState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new device connection (initially online).
    pub fn connect(&self) -> MemoryConnection {
        let mut state = self.shared.lock();
        state.next_connection_id += 1;
        MemoryConnection {
            shared: self.shared.clone(),
            id: state.next_connection_id,
        }
    }

    /// Write a document verbatim, bypassing the write path.
    ///
    /// Used to plant records that other clients (or older app versions)
    /// could have written, including malformed ones.
    pub fn insert_raw(&self, collection: &str, id: &str, data: Value) {
        let mut state = self.shared.lock();
        let sequence = state.bump_sequence();
        let docs = state.collections.entry(collection.to_string()).or_default();
        let seq = docs.get(id).map_or(sequence, |d| d.sequence);
        docs.insert(
            id.to_string(),
            StoredDoc {
                data,
                sequence: seq,
                revision: sequence,
            },
        );
        state.notify_listeners();
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        let state = self.shared.lock();
        state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|d| to_document(id, d))
    }

    /// All documents of a collection in arrival order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        let state = self.shared.lock();
        let mut docs: Vec<Document> = state
            .collections
            .get(collection)
            .map(|c| c.iter().map(|(id, d)| to_document(id, d)).collect())
            .unwrap_or_default();
        docs.sort_by_key(|d| d.sequence);
        docs
    }

    pub fn listener_count(&self) -> usize {
        self.shared.lock().listeners.len()
    }

    /// Number of batches that changed state (duplicates excluded).
    pub fn applied_commits(&self) -> u64 {
        self.shared.lock().applied_commits
    }

    /// Reject every read and listen on `collection` with `Permission`.
    pub fn deny_reads(&self, collection: &str) {
        self.shared.lock().denied_reads.insert(collection.to_string());
    }

    /// Reject every batch touching `collection` with `Permission`.
    pub fn deny_writes(&self, collection: &str) {
        self.shared.lock().denied_writes.insert(collection.to_string());
    }

    pub fn allow_all(&self) {
        let mut state = self.shared.lock();
        state.denied_reads.clear();
        state.denied_writes.clear();
    }

    /// Apply the next `n` commits but report them as transient failures,
    /// as if the acknowledgement was lost on the way back.
    pub fn lose_next_acks(&self, n: u32) {
        self.shared.lock().lost_acks = n;
    }

    /// Reject the next `n` commits with a transient failure.
    pub fn reject_next_commits(&self, n: u32) {
        self.shared.lock().rejected_commits = n;
    }
}

/// One device's view of the [`MemoryBackend`].
#[derive(Clone)]
pub struct MemoryConnection {
    shared: Arc<Mutex<BackendState>>,
    id: u64,
}

impl MemoryConnection {
    /// Simulate losing or regaining the network.
    ///
    /// Going offline kills this connection's listeners with a
    /// `TransientNetwork` error.
    pub fn set_online(&self, online: bool) {
        let mut state = self.shared.lock();
        if online {
            state.offline.remove(&self.id);
            debug!(connection = self.id, "Memory connection online");
            return;
        }
        state.offline.insert(self.id);
        let dropped: Vec<u64> = state
            .listeners
            .iter()
            .filter(|(_, l)| l.connection == self.id)
            .map(|(id, _)| *id)
            .collect();
        for id in dropped {
            if let Some(listener) = state.listeners.remove(&id) {
                let _ = listener.tx.send(ListenEvent::Error(SyncError::TransientNetwork(
                    "connection lost".to_string(),
                )));
            }
        }
        debug!(connection = self.id, "Memory connection offline");
    }

    pub fn is_online(&self) -> bool {
        !self.shared.lock().offline.contains(&self.id)
    }

    pub fn backend(&self) -> MemoryBackend {
        MemoryBackend {
            shared: self.shared.clone(),
        }
    }

    fn check_online(&self, state: &BackendState) -> SyncResult<()> {
        if state.offline.contains(&self.id) {
            return Err(SyncError::TransientNetwork("backend unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryConnection {
    async fn get(&self, collection: &str, id: &str) -> SyncResult<Option<Document>> {
        let state = self.shared.lock();
        self.check_online(&state)?;
        state.check_read(collection)?;
        Ok(state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|d| to_document(id, d)))
    }

    async fn query(&self, query: &Query) -> SyncResult<Vec<Document>> {
        let state = self.shared.lock();
        self.check_online(&state)?;
        state.check_read(&query.collection)?;
        Ok(state.evaluate(query))
    }

    async fn commit(&self, batch: WriteBatch) -> SyncResult<CommitOutcome> {
        let mut state = self.shared.lock();
        self.check_online(&state)?;
        if state.rejected_commits > 0 {
            state.rejected_commits -= 1;
            return Err(SyncError::TransientNetwork("commit rejected".to_string()));
        }
        let outcome = state.commit(batch)?;
        if state.lost_acks > 0 && matches!(outcome, CommitOutcome::Applied { .. }) {
            state.lost_acks -= 1;
            return Err(SyncError::TransientNetwork(
                "acknowledgement lost".to_string(),
            ));
        }
        Ok(outcome)
    }

    async fn listen(&self, query: Query) -> SyncResult<Listener> {
        let mut state = self.shared.lock();
        self.check_online(&state)?;
        state.check_read(&query.collection)?;

        let initial = state.evaluate(&query);
        let known = initial.iter().map(|d| (d.id.clone(), d.revision)).collect();
        let (tx, rx) = mpsc::unbounded_channel();
        state.next_listener_id += 1;
        let listener_id = state.next_listener_id;
        state.listeners.insert(
            listener_id,
            ListenerEntry {
                connection: self.id,
                query,
                known,
                tx,
            },
        );
        trace!(listener_id, connection = self.id, "Listener registered");

        let weak: Weak<Mutex<BackendState>> = Arc::downgrade(&self.shared);
        let registration = ListenerRegistration::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.lock().listeners.remove(&listener_id);
            }
        });
        Ok(Listener::new(initial, rx, registration))
    }
}

impl BackendState {
    fn bump_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    /// Server clock: wall time, never running backwards.
    fn server_time(&mut self) -> i64 {
        let now = now_millis().max(self.last_timestamp);
        self.last_timestamp = now;
        now
    }

    fn check_read(&self, collection: &str) -> SyncResult<()> {
        if self.denied_reads.contains(collection) {
            return Err(SyncError::Permission(format!("read of {} denied", collection)));
        }
        Ok(())
    }

    fn commit(&mut self, batch: WriteBatch) -> SyncResult<CommitOutcome> {
        if let Some(key) = &batch.idempotency_key {
            if self.applied_keys.contains(key.as_str()) {
                debug!(key = %key, "Duplicate batch ignored");
                return Ok(CommitOutcome::Duplicate);
            }
        }
        if let Some(op) = batch
            .ops
            .iter()
            .find(|op| self.denied_writes.contains(op.collection()))
        {
            return Err(SyncError::Permission(format!(
                "write to {} denied",
                op.collection()
            )));
        }

        let server_time = self.server_time();
        // Stage on a copy so a failing op leaves no partial effects.
        let mut staged = self.collections.clone();
        let mut sequence = self.next_sequence;
        for op in &batch.ops {
            apply_op(&mut staged, op, server_time, &mut sequence)?;
        }
        self.collections = staged;
        self.next_sequence = sequence;
        if let Some(key) = batch.idempotency_key {
            self.applied_keys.insert(key.0);
        }
        self.applied_commits += 1;
        self.notify_listeners();
        Ok(CommitOutcome::Applied { server_time })
    }

    fn evaluate(&self, query: &Query) -> Vec<Document> {
        let Some(docs) = self.collections.get(&query.collection) else {
            return Vec::new();
        };
        let mut results: Vec<Document> = docs
            .iter()
            .filter(|(_, d)| query.predicate.matches(&d.data))
            .map(|(id, d)| to_document(id, d))
            .collect();

        let direction = query
            .order
            .as_ref()
            .map_or(Direction::Ascending, |o| o.direction);
        let sort_key = |doc: &Document| {
            query
                .order
                .as_ref()
                .map_or(Value::Null, |o| o.key_of(&doc.data))
        };
        let position = |key: &Value, seq: u64, other_key: &Value, other_seq: u64| {
            let ord = compare_values(key, other_key).then(seq.cmp(&other_seq));
            match direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            }
        };

        results.sort_by(|a, b| position(&sort_key(a), a.sequence, &sort_key(b), b.sequence));

        if let Some(cursor) = &query.start_after {
            results.retain(|d| {
                position(&sort_key(d), d.sequence, &cursor.key, cursor.sequence).is_gt()
            });
        }
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        results
    }

    fn notify_listeners(&mut self) {
        let mut dead = Vec::new();
        let ids: Vec<u64> = self.listeners.keys().copied().collect();
        for id in ids {
            let Some(query) = self.listeners.get(&id).map(|l| l.query.clone()) else {
                continue;
            };
            let results = self.evaluate(&query);
            let Some(listener) = self.listeners.get_mut(&id) else {
                continue;
            };

            let mut changes = Vec::new();
            let mut seen = HashSet::new();
            for doc in results {
                seen.insert(doc.id.clone());
                match listener.known.get(&doc.id) {
                    None => {
                        listener.known.insert(doc.id.clone(), doc.revision);
                        changes.push(DocumentChange::Added(doc));
                    }
                    Some(rev) if *rev != doc.revision => {
                        listener.known.insert(doc.id.clone(), doc.revision);
                        changes.push(DocumentChange::Modified(doc));
                    }
                    Some(_) => {}
                }
            }
            let removed: Vec<String> = listener
                .known
                .keys()
                .filter(|k| !seen.contains(*k))
                .cloned()
                .collect();
            for removed_id in removed {
                listener.known.remove(&removed_id);
                changes.push(DocumentChange::Removed { id: removed_id });
            }

            if !changes.is_empty() && listener.tx.send(ListenEvent::Changes(changes)).is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            self.listeners.remove(&id);
        }
    }
}

fn to_document(id: &str, stored: &StoredDoc) -> Document {
    Document {
        id: id.to_string(),
        data: stored.data.clone(),
        sequence: stored.sequence,
        revision: stored.revision,
    }
}

fn apply_op(
    collections: &mut HashMap<String, Collection>,
    op: &WriteOp,
    server_time: i64,
    sequence: &mut u64,
) -> SyncResult<()> {
    let mut next = || {
        *sequence += 1;
        *sequence
    };
    match op {
        WriteOp::Create {
            collection,
            id,
            fields,
        } => {
            let docs = collections.entry(collection.clone()).or_default();
            if docs.contains_key(id) {
                return Err(SyncError::AlreadyExists(format!("{}/{}", collection, id)));
            }
            let mut data = Value::Object(Map::new());
            apply_writes(&mut data, fields, server_time);
            let seq = next();
            docs.insert(
                id.clone(),
                StoredDoc {
                    data,
                    sequence: seq,
                    revision: seq,
                },
            );
        }
        WriteOp::Set {
            collection,
            id,
            fields,
        } => {
            let docs = collections.entry(collection.clone()).or_default();
            let mut data = Value::Object(Map::new());
            apply_writes(&mut data, fields, server_time);
            let seq = next();
            let created = docs.get(id).map_or(seq, |d| d.sequence);
            docs.insert(
                id.clone(),
                StoredDoc {
                    data,
                    sequence: created,
                    revision: seq,
                },
            );
        }
        WriteOp::Update {
            collection,
            id,
            fields,
        } => {
            let doc = collections
                .get_mut(collection)
                .and_then(|docs| docs.get_mut(id))
                .ok_or_else(|| SyncError::NotFound(format!("{}/{}", collection, id)))?;
            apply_writes(&mut doc.data, fields, server_time);
            doc.revision = next();
        }
        WriteOp::UpdateWhere {
            collection,
            predicate,
            fields,
        } => {
            if let Some(docs) = collections.get_mut(collection) {
                for doc in docs.values_mut().filter(|d| predicate.matches(&d.data)) {
                    apply_writes(&mut doc.data, fields, server_time);
                    doc.revision = next();
                }
            }
        }
        WriteOp::Delete { collection, id } => {
            if let Some(docs) = collections.get_mut(collection) {
                docs.remove(id);
            }
        }
        WriteOp::DeleteWhere {
            collection,
            predicate,
        } => {
            if let Some(docs) = collections.get_mut(collection) {
                docs.retain(|_, d| !predicate.matches(&d.data));
            }
        }
    }
    Ok(())
}

fn apply_writes(data: &mut Value, fields: &FieldWrites, server_time: i64) {
    for (path, value) in fields.iter() {
        match value {
            FieldValue::Value(v) => set_path(data, path, v.clone()),
            FieldValue::Increment(by) => {
                let current = get_path(data, path).and_then(Value::as_i64).unwrap_or(0);
                set_path(data, path, Value::from(current + by));
            }
            FieldValue::ServerTimestamp => set_path(data, path, Value::from(server_time)),
            FieldValue::Delete => remove_path(data, path),
        }
    }
}

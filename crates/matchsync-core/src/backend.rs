//! Remote document store contract.
//!
//! The sync layer never talks to a concrete database. It needs a backend
//! that can:
//!
//! - evaluate equality filters combined as a disjunction of conjunctions,
//!   sorted and limited, as **one** query;
//! - apply a batch of writes atomically, including atomic numeric
//!   increments and server-assigned timestamps;
//! - push incremental diffs of a query's result set to live listeners.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  DocumentStore (trait)                                         │
//! │  ├── get / query       one-shot reads                          │
//! │  ├── commit            atomic WriteBatch, idempotency key      │
//! │  └── listen            initial snapshot + DocumentChange diffs │
//! ├────────────────────────────────────────────────────────────────┤
//! │  MemoryBackend         in-process reference implementation     │
//! │  └── MemoryConnection  one per device, independent reachability│
//! └────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{SyncError, SyncResult};
use crate::types::IdempotencyToken;

mod memory;
mod value;

pub use memory::{MemoryBackend, MemoryConnection};
pub(crate) use value::{compare_values, get_path};

/// A stored document plus server metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
    /// Server arrival sequence, assigned once at creation
    pub sequence: u64,
    /// Bumped by the server on every write to this document
    pub revision: u64,
}

impl Document {
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        get_path(&self.data, path)
    }
}

/// Path to a (possibly nested) field, e.g. `unreadCount.<userId>`.
///
/// Segments are kept separate so ids containing dots stay addressable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Split a dotted path into segments.
    pub fn parse(dotted: &str) -> Self {
        Self(dotted.split('.').map(str::to_string).collect())
    }

    /// Append one raw segment (not split on dots).
    pub fn child(mut self, segment: impl Into<String>) -> Self {
        self.0.push(segment.into());
        self
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for FieldPath {
    fn from(dotted: &str) -> Self {
        Self::parse(dotted)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub value: Value,
}

/// Disjunction of conjunctions of equality filters.
///
/// An empty predicate matches every document. The whole predicate is shipped
/// to the backend as one query; it is never split into per-branch queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    any_of: Vec<Vec<FieldFilter>>,
}

impl Predicate {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::all().and_eq(field, value)
    }

    /// Add an equality filter to every branch.
    pub fn and_eq(mut self, field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        let filter = FieldFilter {
            field: field.into(),
            value: value.into(),
        };
        if self.any_of.is_empty() {
            self.any_of.push(Vec::new());
        }
        for branch in &mut self.any_of {
            branch.push(filter.clone());
        }
        self
    }

    /// Union with another predicate.
    pub fn or(mut self, other: Predicate) -> Self {
        if self.any_of.is_empty() || other.any_of.is_empty() {
            return Self::all();
        }
        self.any_of.extend(other.any_of);
        self
    }

    pub fn branches(&self) -> &[Vec<FieldFilter>] {
        &self.any_of
    }

    pub fn matches(&self, data: &Value) -> bool {
        if self.any_of.is_empty() {
            return true;
        }
        self.any_of.iter().any(|branch| {
            branch
                .iter()
                .all(|f| get_path(data, &f.field).map_or(f.value.is_null(), |v| *v == f.value))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Sort specification.
///
/// The sort key of a document is the first non-null of `fields`, so
/// `lastMessageTimestamp ?? createdAt` is one `OrderBy`. Ties are broken by
/// server arrival sequence, in the same direction.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub fields: Vec<FieldPath>,
    pub direction: Direction,
}

impl OrderBy {
    pub fn ascending(field: impl Into<FieldPath>) -> Self {
        Self {
            fields: vec![field.into()],
            direction: Direction::Ascending,
        }
    }

    pub fn descending(field: impl Into<FieldPath>) -> Self {
        Self {
            fields: vec![field.into()],
            direction: Direction::Descending,
        }
    }

    pub fn coalesce(fields: &[&str], direction: Direction) -> Self {
        Self {
            fields: fields.iter().map(|f| FieldPath::parse(f)).collect(),
            direction,
        }
    }

    pub fn key_of(&self, data: &Value) -> Value {
        self.fields
            .iter()
            .filter_map(|f| get_path(data, f))
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Pagination position: a sort key plus the arrival sequence that breaks ties.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub key: Value,
    pub sequence: u64,
}

impl Cursor {
    pub fn new(key: impl Into<Value>, sequence: u64) -> Self {
        Self {
            key: key.into(),
            sequence,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub predicate: Predicate,
    pub order: Option<OrderBy>,
    pub limit: Option<usize>,
    /// Only documents strictly after this position in sort order
    pub start_after: Option<Cursor>,
}

impl Query {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            predicate: Predicate::all(),
            order: None,
            limit: None,
            start_after: None,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, cursor: Cursor) -> Self {
        self.start_after = Some(cursor);
        self
    }
}

/// What to write into one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    /// Server-side atomic add (missing field counts as 0)
    Increment(i64),
    /// Replaced by the commit's server time (Unix millis)
    ServerTimestamp,
    Delete,
}

/// Ordered list of field writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldWrites(Vec<(FieldPath, FieldValue)>);

impl FieldWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        self.0.push((path.into(), FieldValue::Value(value.into())));
        self
    }

    pub fn increment(mut self, path: impl Into<FieldPath>, by: i64) -> Self {
        self.0.push((path.into(), FieldValue::Increment(by)));
        self
    }

    pub fn server_timestamp(mut self, path: impl Into<FieldPath>) -> Self {
        self.0.push((path.into(), FieldValue::ServerTimestamp));
        self
    }

    pub fn delete(mut self, path: impl Into<FieldPath>) -> Self {
        self.0.push((path.into(), FieldValue::Delete));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &(FieldPath, FieldValue)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Fails the whole batch with `AlreadyExists` if the document exists
    Create {
        collection: String,
        id: String,
        fields: FieldWrites,
    },
    /// Replace the document's data
    Set {
        collection: String,
        id: String,
        fields: FieldWrites,
    },
    /// Fails the whole batch with `NotFound` if the document is missing
    Update {
        collection: String,
        id: String,
        fields: FieldWrites,
    },
    /// Update every document matching the predicate, evaluated server-side
    UpdateWhere {
        collection: String,
        predicate: Predicate,
        fields: FieldWrites,
    },
    Delete {
        collection: String,
        id: String,
    },
    DeleteWhere {
        collection: String,
        predicate: Predicate,
    },
}

impl WriteOp {
    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Create { collection, .. }
            | WriteOp::Set { collection, .. }
            | WriteOp::Update { collection, .. }
            | WriteOp::UpdateWhere { collection, .. }
            | WriteOp::Delete { collection, .. }
            | WriteOp::DeleteWhere { collection, .. } => collection,
        }
    }
}

/// All-or-nothing group of writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub idempotency_key: Option<IdempotencyToken>,
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: IdempotencyToken) -> Self {
        Self {
            idempotency_key: Some(key),
            ops: Vec::new(),
        }
    }

    pub fn op(mut self, op: WriteOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied { server_time: i64 },
    /// The idempotency key was already applied; nothing changed
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    Added(Document),
    Modified(Document),
    Removed { id: String },
}

#[derive(Debug)]
pub enum ListenEvent {
    Changes(Vec<DocumentChange>),
    /// The listener is dead after this event
    Error(SyncError),
}

/// Unregisters a listener when dropped.
pub struct ListenerRegistration {
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerRegistration {
    pub fn new(on_drop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_drop: Some(Box::new(on_drop)),
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

/// A live query subscription.
pub struct Listener {
    /// Result set at registration time
    pub initial: Vec<Document>,
    events: mpsc::UnboundedReceiver<ListenEvent>,
    _registration: ListenerRegistration,
}

impl Listener {
    pub fn new(
        initial: Vec<Document>,
        events: mpsc::UnboundedReceiver<ListenEvent>,
        registration: ListenerRegistration,
    ) -> Self {
        Self {
            initial,
            events,
            _registration: registration,
        }
    }

    /// Next pushed event; `None` once the backend has closed the listener.
    pub async fn next(&mut self) -> Option<ListenEvent> {
        self.events.recv().await
    }
}

/// The black-box backend required by the sync layer.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> SyncResult<Option<Document>>;

    async fn query(&self, query: &Query) -> SyncResult<Vec<Document>>;

    async fn commit(&self, batch: WriteBatch) -> SyncResult<CommitOutcome>;

    /// Register a live listener. Suspends only until the initial snapshot is
    /// available; later changes are pushed.
    async fn listen(&self, query: Query) -> SyncResult<Listener>;
}

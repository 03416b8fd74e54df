//! Local persistence using redb.
//!
//! The only durable client state is the offline operation queue: write
//! intents must survive an app restart between going offline and
//! reconnecting. Everything else is rebuilt from the backend.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::warn;

use crate::error::SyncError;
use crate::types::PendingOperation;

/// Queued operations (key: enqueue order, value: postcard PendingOperation)
const PENDING_OPERATIONS_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("pending_operations");

/// Queue bookkeeping (key: name, value: counter)
const QUEUE_META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("queue_meta");

const NEXT_ORDER_KEY: &str = "next_order";

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Open (or create) the database file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        Self::init(db)
    }

    /// A database that lives only as long as this handle.
    pub fn in_memory() -> Result<Self, SyncError> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, SyncError> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PENDING_OPERATIONS_TABLE)?;
            let _ = write_txn.open_table(QUEUE_META_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pending Operation Queue
    // ═══════════════════════════════════════════════════════════════════════

    /// Append an operation, assigning it the next enqueue order.
    ///
    /// Returns the stored operation (with `order` filled in).
    pub fn append_pending(&self, op: &PendingOperation) -> Result<PendingOperation, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let stored = {
            let mut meta = write_txn.open_table(QUEUE_META_TABLE)?;
            let order = meta.get(NEXT_ORDER_KEY)?.map(|v| v.value()).unwrap_or(1);
            meta.insert(NEXT_ORDER_KEY, order + 1)?;

            let mut stored = op.clone();
            stored.order = order;
            let data = postcard::to_allocvec(&stored)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            let mut table = write_txn.open_table(PENDING_OPERATIONS_TABLE)?;
            table.insert(order, data.as_slice())?;
            stored
        };
        write_txn.commit()?;
        Ok(stored)
    }

    /// All decodable queued operations in enqueue order.
    ///
    /// Undecodable records are skipped with a warning.
    pub fn list_pending(&self) -> Result<Vec<PendingOperation>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PENDING_OPERATIONS_TABLE)?;

        let mut ops = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            match postcard::from_bytes::<PendingOperation>(value.value()) {
                Ok(op) => ops.push(op),
                Err(e) => warn!(order = key.value(), error = %e, "Skipping undecodable queued operation"),
            }
        }
        Ok(ops)
    }

    /// Oldest decodable queued operation, if any.
    ///
    /// Undecodable records ahead of it are deleted so they cannot block
    /// the queue.
    pub fn first_pending(&self) -> Result<Option<PendingOperation>, SyncError> {
        let db = self.db.read();
        let mut corrupt = Vec::new();
        let found = {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(PENDING_OPERATIONS_TABLE)?;
            let mut found = None;
            for entry in table.iter()? {
                let (key, value) = entry?;
                match postcard::from_bytes::<PendingOperation>(value.value()) {
                    Ok(op) => {
                        found = Some(op);
                        break;
                    }
                    Err(e) => {
                        warn!(order = key.value(), error = %e, "Dropping undecodable queued operation");
                        corrupt.push(key.value());
                    }
                }
            }
            found
        };

        if !corrupt.is_empty() {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(PENDING_OPERATIONS_TABLE)?;
                for order in &corrupt {
                    table.remove(*order)?;
                }
            }
            write_txn.commit()?;
        }
        Ok(found)
    }

    /// Remove an operation by enqueue order.
    ///
    /// Returns `Ok(())` even if it was already gone.
    pub fn remove_pending(&self, order: u64) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING_OPERATIONS_TABLE)?;
            table.remove(order)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Drop every queued record, decodable or not. Returns how many were removed.
    pub fn clear_pending(&self) -> Result<usize, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(PENDING_OPERATIONS_TABLE)?;
            let orders = table
                .iter()?
                .map(|entry| entry.map(|(key, _)| key.value()))
                .collect::<Result<Vec<u64>, _>>()?;
            for order in &orders {
                table.remove(*order)?;
            }
            orders.len()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Overwrite the record at `order` with raw bytes.
    #[cfg(test)]
    pub(crate) fn put_raw_pending(&self, order: u64, bytes: &[u8]) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING_OPERATIONS_TABLE)?;
            table.insert(order, bytes)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

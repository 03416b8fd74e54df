//! Matchsync Core Library
//!
//! Real-time match and conversation sync for a dating client, on top of an
//! eventually-consistent document store.
//!
//! ## Overview
//!
//! A client keeps a live, ordered list of the signed-in user's active
//! matches and a live window of each open conversation. Writes made while
//! offline are echoed locally and persisted in a durable FIFO queue that is
//! replayed, exactly once per operation, when the connection comes back.
//!
//! ## Core Principles
//!
//! - **Single owner**: every cache has one owner; components talk through
//!   channels, never shared locks
//! - **Idempotent writes**: every write carries a token, so replays are safe
//! - **Server order**: messages are ordered by server timestamp and arrival
//!   sequence, never by client clocks
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use matchsync_core::{ManualReachability, MemoryBackend, Reachability, SyncClient, UserId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!     let reachability = Arc::new(ManualReachability::new(Reachability::wifi()));
//!     let client = SyncClient::builder(UserId::from("alice"), Arc::new(backend.connect()), reachability)
//!         .build()?;
//!
//!     let created = client.create_match(&UserId::from("bob")).await?;
//!     let mut matches = client.start().await?;
//!     client.send(&created.record.id, "hi!").await?;
//!
//!     matches.changed().await?;
//!     for record in &matches.borrow().matches {
//!         println!("{} unread", record.unread_for(client.user()));
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod connectivity;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod match_store;
pub mod notifications;
pub mod offline_queue;
pub mod profiles;
pub mod schema;
pub mod storage;
pub mod types;
pub mod unread;

// Re-exports
pub use backend::{DocumentStore, MemoryBackend, MemoryConnection};
pub use config::{LatencyThresholds, SyncConfig};
pub use connectivity::{
    ConnectivityEvent, ConnectivityMonitor, ConnectivityProbe, LatencyProbe, ManualReachability,
    Reachability, ReachabilityProvider,
};
pub use conversation::{ConversationBuffer, ConversationEvent, ConversationStream, ConversationSync};
pub use engine::{ResyncReport, SyncClient, SyncClientBuilder};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use lifecycle::{MatchCreation, MatchLifecycleManager};
pub use match_store::{LoadOutcome, MatchList, MatchStore};
pub use notifications::{LogNotifier, Notification, NotificationDispatcher};
pub use offline_queue::{
    FlushReport, OfflineOperationQueue, OperationExecutor, QueueEvent, RemoteOperationExecutor,
};
pub use profiles::{ProfileDirectory, RemoteProfileDirectory};
pub use storage::Storage;
pub use types::*;
pub use unread::UnreadCounter;

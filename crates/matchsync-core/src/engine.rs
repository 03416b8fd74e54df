//! SyncClient - the entry point for one signed-in device
//!
//! SyncClient builds every component against a single [`DocumentStore`]
//! and wires them together:
//! - connectivity transitions drive offline queue flushing
//! - a restored connection re-establishes dropped match and conversation
//!   subscriptions
//! - the signed-in user is filled in for the user-scoped calls
//!
//! # Example
//!
//! ```ignore
//! use matchsync_core::{ManualReachability, Reachability, SyncClient, UserId};
//!
//! let reachability = Arc::new(ManualReachability::new(Reachability::wifi()));
//! let client = SyncClient::builder(UserId::from("alice"), store, reachability)
//!     .data_dir("~/.matchsync/alice")
//!     .build()?;
//!
//! let mut matches = client.start().await?;
//! let mut chat = client.open(&match_id).await?;
//! client.send(&match_id, "hey!").await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::DocumentStore;
use crate::config::SyncConfig;
use crate::connectivity::{
    ConnectivityEvent, ConnectivityMonitor, ConnectivityProbe, LatencyProbe, ReachabilityProvider,
};
use crate::conversation::{ConversationStream, ConversationSync};
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::{MatchCreation, MatchLifecycleManager};
use crate::match_store::{MatchList, MatchStore};
use crate::notifications::{LogNotifier, NotificationDispatcher};
use crate::offline_queue::{FlushReport, OfflineOperationQueue, RemoteOperationExecutor};
use crate::profiles::{ProfileDirectory, RemoteProfileDirectory};
use crate::storage::Storage;
use crate::types::{ChatEntry, ConnectionState, MatchId, UserId};
use crate::unread::UnreadCounter;

/// File name of the durable queue inside the data directory
pub const QUEUE_DB_FILE: &str = "queue.redb";

/// What one reconnect pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub flush: FlushReport,
    /// Whether the match list subscription was re-opened
    pub matches_restored: bool,
    /// Conversations that went live again
    pub conversations_restored: usize,
}

/// Builder for [`SyncClient`].
pub struct SyncClientBuilder {
    user: UserId,
    store: Arc<dyn DocumentStore>,
    reachability: Arc<dyn ReachabilityProvider>,
    config: SyncConfig,
    data_dir: Option<PathBuf>,
    profiles: Option<Arc<dyn ProfileDirectory>>,
    notifier: Option<Arc<dyn NotificationDispatcher>>,
    latency_probe: Option<Arc<dyn LatencyProbe>>,
    connectivity_probe: Option<Arc<dyn ConnectivityProbe>>,
}

impl SyncClientBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist the offline queue under `dir`. Without it the queue lives in
    /// memory and is lost on exit.
    pub fn data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.data_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn profiles(mut self, profiles: Arc<dyn ProfileDirectory>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn latency_probe(mut self, probe: Arc<dyn LatencyProbe>) -> Self {
        self.latency_probe = Some(probe);
        self
    }

    pub fn connectivity_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.connectivity_probe = Some(probe);
        self
    }

    /// Construct every component and start the coordinator.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> SyncResult<SyncClient> {
        self.config.validate()?;

        let storage = match &self.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Storage::new(dir.join(QUEUE_DB_FILE))?
            }
            None => Storage::in_memory()?,
        };
        let profiles = self
            .profiles
            .unwrap_or_else(|| Arc::new(RemoteProfileDirectory::new(self.store.clone())));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        let executor = Arc::new(RemoteOperationExecutor::new(self.store.clone()));
        let queue = Arc::new(OfflineOperationQueue::new(
            storage,
            executor,
            self.config.event_capacity,
        ));

        let mut monitor = ConnectivityMonitor::builder(self.reachability).config(self.config.clone());
        if let Some(probe) = self.latency_probe {
            monitor = monitor.latency_probe(probe);
        }
        if let Some(probe) = self.connectivity_probe {
            monitor = monitor.connectivity_probe(probe);
        }
        let connectivity = monitor.start();
        // Subscribed before anything can transition
        let connectivity_events = connectivity.subscribe();

        let conversations = Arc::new(ConversationSync::new(
            self.store.clone(),
            queue.clone(),
            connectivity.state_receiver(),
            notifier.clone(),
            self.config.clone(),
        ));
        let matches = Arc::new(MatchStore::new(
            self.store.clone(),
            profiles.clone(),
            self.config.clone(),
        ));
        let lifecycle = MatchLifecycleManager::new(self.store.clone(), profiles, notifier);
        let unread = UnreadCounter::new(self.store);

        let coordinator = Coordinator {
            queue: queue.clone(),
            matches: matches.clone(),
            conversations: conversations.clone(),
        };
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(coordinator.clone().run(
            connectivity.is_connected(),
            connectivity_events,
            shutdown.clone(),
        ));

        info!(
            user = %self.user,
            durable = self.data_dir.is_some(),
            connected = connectivity.is_connected(),
            "Sync client started"
        );

        Ok(SyncClient {
            user: self.user,
            config: self.config,
            data_dir: self.data_dir,
            queue,
            connectivity,
            matches,
            conversations,
            lifecycle,
            unread,
            coordinator,
            shutdown,
            task,
        })
    }
}

/// Reactions to connectivity events.
#[derive(Clone)]
struct Coordinator {
    queue: Arc<OfflineOperationQueue>,
    matches: Arc<MatchStore>,
    conversations: Arc<ConversationSync>,
}

impl Coordinator {
    async fn run(
        self,
        connected_at_start: bool,
        mut events: broadcast::Receiver<ConnectivityEvent>,
        shutdown: CancellationToken,
    ) {
        // Anything persisted by a previous run goes out first
        if connected_at_start {
            self.flush().await;
        }

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ConnectivityEvent::ConnectionRestored { offline_for }) => {
                    info!(offline_ms = offline_for.as_millis() as u64, "Connection restored, resyncing");
                    self.resync().await;
                }
                Ok(ConnectivityEvent::ConnectionLost { online_for }) => {
                    info!(online_ms = online_for.as_millis() as u64, "Connection lost");
                }
                Ok(ConnectivityEvent::Transition { state, .. }) => {
                    debug!(state = %state, "Connectivity transition");
                }
                Err(RecvError::Lagged(skipped)) => {
                    // A restore may have been among the skipped events
                    warn!(skipped, "Coordinator lagged behind connectivity events");
                    self.resync().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Coordinator stopped");
    }

    async fn flush(&self) -> FlushReport {
        match self.queue.process_pending_operations().await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Offline queue flush failed");
                FlushReport::default()
            }
        }
    }

    /// Flush first so re-opened windows already contain the replayed writes.
    async fn resync(&self) -> ResyncReport {
        let flush = self.flush().await;
        let matches_restored = match self.matches.reestablish().await {
            Ok(restored) => restored,
            Err(e) => {
                warn!(error = %e, "Match subscription not re-established");
                false
            }
        };
        let conversations_restored = match self.conversations.reestablish().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Conversations not re-established");
                0
            }
        };
        ResyncReport {
            flush,
            matches_restored,
            conversations_restored,
        }
    }
}

/// The sync layer for one signed-in user on one device.
pub struct SyncClient {
    /// Signed-in user; sender of every message and reader of every mark-read
    user: UserId,
    config: SyncConfig,
    /// Directory of the durable queue, if any
    data_dir: Option<PathBuf>,
    queue: Arc<OfflineOperationQueue>,
    connectivity: ConnectivityMonitor,
    matches: Arc<MatchStore>,
    conversations: Arc<ConversationSync>,
    lifecycle: MatchLifecycleManager,
    unread: UnreadCounter,
    coordinator: Coordinator,
    /// Stops the coordinator
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncClient {
    pub fn builder(
        user: UserId,
        store: Arc<dyn DocumentStore>,
        reachability: Arc<dyn ReachabilityProvider>,
    ) -> SyncClientBuilder {
        SyncClientBuilder {
            user,
            store,
            reachability,
            config: SyncConfig::default(),
            data_dir: None,
            profiles: None,
            notifier: None,
            latency_probe: None,
            connectivity_probe: None,
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn matches(&self) -> &MatchStore {
        &self.matches
    }

    pub fn conversations(&self) -> &ConversationSync {
        &self.conversations
    }

    pub fn lifecycle(&self) -> &MatchLifecycleManager {
        &self.lifecycle
    }

    pub fn unread(&self) -> &UnreadCounter {
        &self.unread
    }

    pub fn queue(&self) -> &OfflineOperationQueue {
        &self.queue
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connectivity.state_receiver()
    }

    /// Subscribe to the signed-in user's match list.
    pub async fn start(&self) -> SyncResult<watch::Receiver<MatchList>> {
        self.matches.subscribe(&self.user).await
    }

    pub async fn open(&self, match_id: &MatchId) -> SyncResult<ConversationStream> {
        self.conversations.open(match_id).await
    }

    pub fn close(&self, match_id: &MatchId) -> bool {
        self.conversations.close(match_id)
    }

    /// Send `text` to the other participant of `match_id`.
    pub async fn send(&self, match_id: &MatchId, text: impl Into<String>) -> SyncResult<ChatEntry> {
        let receiver = self.partner_in(match_id).await?;
        self.conversations
            .send(match_id, &self.user, &receiver, text)
            .await
    }

    /// Mark the conversation read for the signed-in user.
    pub async fn mark_read(&self, match_id: &MatchId) -> SyncResult<()> {
        self.conversations.mark_read(match_id, &self.user).await
    }

    pub async fn create_match(&self, partner: &UserId) -> SyncResult<MatchCreation> {
        self.lifecycle.create_match(&self.user, partner).await
    }

    pub async fn unmatch(&self, match_id: &MatchId) -> SyncResult<()> {
        self.lifecycle.unmatch(match_id, &self.user).await
    }

    pub async fn total_unread(&self) -> SyncResult<u64> {
        self.unread.total_unread(&self.user).await
    }

    /// Flush the queue and re-establish dropped subscriptions now.
    ///
    /// The coordinator does this on every restored connection.
    pub async fn resync(&self) -> ResyncReport {
        self.coordinator.resync().await
    }

    /// Wait up to the configured connect timeout for a connection.
    pub async fn wait_for_connection(&self) -> SyncResult<()> {
        self.connectivity
            .wait_for_connection(self.config.connect_timeout())
            .await
    }

    pub async fn wait_for_connection_within(&self, timeout: Duration) -> SyncResult<()> {
        self.connectivity.wait_for_connection(timeout).await
    }

    /// Stop reacting to connectivity and release the match subscription.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.connectivity.stop();
        self.matches.unsubscribe();
        for match_id in self.conversations.open_conversations() {
            self.conversations.close(&match_id);
        }
        info!(user = %self.user, "Sync client stopped");
    }

    /// The match list entry for `match_id`, or the backend copy when it is
    /// not in the live list.
    async fn partner_in(&self, match_id: &MatchId) -> SyncResult<UserId> {
        let cached = self
            .matches
            .current()
            .get(match_id)
            .and_then(|m| m.partner_of(&self.user).cloned());
        if let Some(partner) = cached {
            return Ok(partner);
        }
        let record = self
            .lifecycle
            .load(match_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("match {}", match_id)))?;
        record.partner_of(&self.user).cloned().ok_or_else(|| {
            SyncError::Permission(format!("{} is not part of match {}", self.user, match_id))
        })
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}

//! Live cache of the current user's active matches.
//!
//! One composed subscription feeds the cache: "user is either participant
//! AND the match is active", evaluated by the backend as a single
//! disjunctive query. The cache has one owner (`StoreState` behind a
//! mutex that is never held across an await); listener tasks, reloads and
//! profile lookups all merge back through it.
//!
//! Every subscription carries a generation number. Releasing a subscription
//! bumps the generation, so a task that is still draining an old listener
//! can never publish into the new list.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Document, DocumentChange, DocumentStore, ListenEvent, Listener};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::profiles::ProfileDirectory;
use crate::schema;
use crate::types::{Match, MatchId, UserId};

/// Snapshot published to observers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchList {
    pub user: Option<UserId>,
    /// Most recent activity first
    pub matches: Vec<Match>,
    pub partner_names: HashMap<UserId, String>,
    /// Whether a live subscription is currently feeding this list
    pub is_live: bool,
}

impl MatchList {
    pub fn partner_name(&self, record: &Match) -> Option<&str> {
        let user = self.user.as_ref()?;
        let partner = record.partner_of(user)?;
        self.partner_names.get(partner).map(String::as_str)
    }

    pub fn get(&self, id: &MatchId) -> Option<&Match> {
        self.matches.iter().find(|m| m.id == *id)
    }
}

/// Result of [`MatchStore::reload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied,
    /// A newer load (or subscription change) made this one obsolete
    Superseded,
}

#[derive(Default)]
struct StoreState {
    user: Option<UserId>,
    generation: u64,
    entries: HashMap<MatchId, Match>,
    /// Highest backend revision applied per document, kept after removal
    revisions: HashMap<MatchId, u64>,
    partner_names: HashMap<UserId, String>,
    resolving: HashSet<UserId>,
    is_live: bool,
    listener_task: Option<JoinHandle<()>>,
    load_cancel: Option<CancellationToken>,
    load_generation: u64,
}

impl StoreState {
    /// Stop delivery from the current subscription. Returns the new generation.
    fn release(&mut self) -> u64 {
        self.generation += 1;
        if let Some(task) = self.listener_task.take() {
            task.abort();
        }
        if let Some(cancel) = self.load_cancel.take() {
            cancel.cancel();
        }
        self.resolving.clear();
        self.is_live = false;
        self.generation
    }
}

enum Decoded {
    Keep(Match),
    /// Valid record that no longer belongs in the list
    Evict,
    Malformed,
}

fn decode(user: &UserId, doc: &Document) -> Decoded {
    match Match::from_document(doc) {
        Ok(record) if record.is_active && record.involves(user) => Decoded::Keep(record),
        Ok(_) => Decoded::Evict,
        Err(e) => {
            warn!(match_id = %doc.id, error = %e, "Skipping malformed match");
            Decoded::Malformed
        }
    }
}

fn sorted(entries: &HashMap<MatchId, Match>) -> Vec<Match> {
    let mut matches: Vec<Match> = entries.values().cloned().collect();
    matches.sort_by(|a, b| {
        b.activity_at()
            .cmp(&a.activity_at())
            .then_with(|| a.id.cmp(&b.id))
    });
    matches
}

struct StoreInner {
    store: Arc<dyn DocumentStore>,
    profiles: Arc<dyn ProfileDirectory>,
    config: SyncConfig,
    state: Mutex<StoreState>,
    output: watch::Sender<MatchList>,
}

impl StoreInner {
    fn publish(&self, state: &StoreState) {
        self.output.send_replace(MatchList {
            user: state.user.clone(),
            matches: sorted(&state.entries),
            partner_names: state.partner_names.clone(),
            is_live: state.is_live,
        });
    }

    /// Partners with no known name and no lookup in flight; marks them in flight.
    fn claim_missing_names(state: &mut StoreState) -> Vec<UserId> {
        let Some(user) = state.user.clone() else {
            return Vec::new();
        };
        let mut missing = Vec::new();
        for record in state.entries.values() {
            if let Some(partner) = record.partner_of(&user) {
                if !state.partner_names.contains_key(partner) && !state.resolving.contains(partner)
                {
                    missing.push(partner.clone());
                }
            }
        }
        for partner in &missing {
            state.resolving.insert(partner.clone());
        }
        missing
    }

    /// Apply a query result set.
    ///
    /// A snapshot that starts a subscription replaces the cache. A reload
    /// landing while the listener is live is merged per document, and only
    /// where its revision is newer than what the listener already applied.
    fn apply_snapshot(self: &Arc<Self>, generation: u64, docs: &[Document], live: bool) -> bool {
        let missing = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return false;
            }
            let Some(user) = state.user.clone() else {
                return false;
            };
            if state.is_live && !live {
                let mut stale = 0usize;
                for doc in docs {
                    let id = MatchId(doc.id.clone());
                    if state.revisions.get(&id).is_some_and(|seen| *seen >= doc.revision) {
                        stale += 1;
                        continue;
                    }
                    state.revisions.insert(id.clone(), doc.revision);
                    match decode(&user, doc) {
                        Decoded::Keep(record) => {
                            state.entries.insert(id, record);
                        }
                        Decoded::Evict => {
                            state.entries.remove(&id);
                        }
                        Decoded::Malformed => {}
                    }
                }
                if stale > 0 {
                    debug!(stale, "Reload kept newer live records");
                }
            } else {
                let mut entries = HashMap::new();
                let mut revisions = HashMap::new();
                for doc in docs {
                    revisions.insert(MatchId(doc.id.clone()), doc.revision);
                    if let Decoded::Keep(record) = decode(&user, doc) {
                        entries.insert(record.id.clone(), record);
                    }
                }
                state.entries = entries;
                state.revisions = revisions;
            }
            if live {
                state.is_live = true;
            }
            self.publish(&state);
            Self::claim_missing_names(&mut state)
        };
        self.resolve_names(generation, missing);
        true
    }

    fn apply_changes(self: &Arc<Self>, generation: u64, changes: Vec<DocumentChange>) -> bool {
        let missing = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return false;
            }
            let Some(user) = state.user.clone() else {
                return false;
            };
            for change in changes {
                match change {
                    DocumentChange::Added(doc) | DocumentChange::Modified(doc) => {
                        let seen = state.revisions.entry(MatchId(doc.id.clone())).or_default();
                        *seen = (*seen).max(doc.revision);
                        match decode(&user, &doc) {
                            Decoded::Keep(record) => {
                                debug!(match_id = %record.id, "Match updated");
                                state.entries.insert(record.id.clone(), record);
                            }
                            Decoded::Evict => {
                                if state.entries.remove(&MatchId(doc.id.clone())).is_some() {
                                    debug!(match_id = %doc.id, "Match left the list");
                                }
                            }
                            Decoded::Malformed => {}
                        }
                    }
                    DocumentChange::Removed { id } => {
                        state.entries.remove(&MatchId(id));
                    }
                }
            }
            self.publish(&state);
            Self::claim_missing_names(&mut state)
        };
        self.resolve_names(generation, missing);
        true
    }

    fn mark_not_live(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        state.is_live = false;
        state.listener_task = None;
        self.publish(&state);
    }

    fn apply_name(&self, generation: u64, partner: UserId, name: Option<String>) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        state.resolving.remove(&partner);
        if let Some(name) = name {
            state.partner_names.insert(partner, name);
            self.publish(&state);
        }
    }

    /// Look up display names in parallel, bounded by `profile_fanout`.
    fn resolve_names(self: &Arc<Self>, generation: u64, partners: Vec<UserId>) {
        if partners.is_empty() {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(inner.config.profile_fanout));
            let mut tasks = JoinSet::new();
            for partner in partners {
                let semaphore = semaphore.clone();
                let profiles = inner.profiles.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let name = profiles.display_name(&partner).await;
                    (partner, name)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((partner, Ok(name))) => inner.apply_name(generation, partner, name),
                    Ok((partner, Err(e))) => {
                        warn!(user = %partner, error = %e, "Partner profile lookup failed");
                        inner.apply_name(generation, partner, None);
                    }
                    Err(e) => warn!(error = %e, "Profile lookup task failed"),
                }
            }
        });
    }

    async fn run_listener(self: Arc<Self>, generation: u64, mut listener: Listener) {
        while let Some(event) = listener.next().await {
            match event {
                ListenEvent::Changes(changes) => {
                    if !self.apply_changes(generation, changes) {
                        return;
                    }
                }
                ListenEvent::Error(e) => {
                    warn!(error = %e, "Match subscription dropped, keeping last known list");
                    self.mark_not_live(generation);
                    return;
                }
            }
        }
        self.mark_not_live(generation);
    }
}

/// Live, ordered list of the current user's active matches.
pub struct MatchStore {
    inner: Arc<StoreInner>,
}

impl MatchStore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        profiles: Arc<dyn ProfileDirectory>,
        config: SyncConfig,
    ) -> Self {
        let (output, _) = watch::channel(MatchList::default());
        Self {
            inner: Arc::new(StoreInner {
                store,
                profiles,
                config,
                state: Mutex::new(StoreState::default()),
                output,
            }),
        }
    }

    pub fn watch(&self) -> watch::Receiver<MatchList> {
        self.inner.output.subscribe()
    }

    pub fn current(&self) -> MatchList {
        self.inner.output.borrow().clone()
    }

    pub fn is_live(&self) -> bool {
        self.inner.state.lock().is_live
    }

    /// Start the live subscription for `user`, releasing any previous one first.
    ///
    /// A transient failure leaves the store not-live (waiting for
    /// [`reestablish`](Self::reestablish)) and is not returned. Terminal
    /// failures and the listen timeout are.
    pub async fn subscribe(&self, user: &UserId) -> SyncResult<watch::Receiver<MatchList>> {
        let generation = {
            let mut state = self.inner.state.lock();
            let generation = state.release();
            if state.user.as_ref() != Some(user) {
                state.entries.clear();
                state.revisions.clear();
                state.partner_names.clear();
                state.user = Some(user.clone());
            }
            self.inner.publish(&state);
            generation
        };
        info!(user = %user, generation, "Subscribing to matches");

        let query = schema::active_matches(user, self.inner.config.match_list_limit);
        let timeout = self.inner.config.listen_timeout();
        let listener = match tokio::time::timeout(timeout, self.inner.store.listen(query)).await {
            Ok(Ok(listener)) => listener,
            Ok(Err(e)) if e.is_retryable() => {
                warn!(user = %user, error = %e, "Match subscription unavailable, will re-establish");
                return Ok(self.watch());
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(SyncError::timeout("match subscription", timeout)),
        };

        if !self.inner.apply_snapshot(generation, &listener.initial, true) {
            debug!(generation, "Subscription superseded before its snapshot landed");
            return Ok(self.watch());
        }
        let task = tokio::spawn(self.inner.clone().run_listener(generation, listener));
        let mut state = self.inner.state.lock();
        if state.generation == generation {
            state.listener_task = Some(task);
        } else {
            task.abort();
        }
        Ok(self.watch())
    }

    /// Same query as [`subscribe`](Self::subscribe), without a subscription.
    pub async fn fetch_once(&self, user: &UserId) -> SyncResult<Vec<Match>> {
        let query = schema::active_matches(user, self.inner.config.match_list_limit);
        let docs = self.inner.store.query(&query).await?;
        let entries: HashMap<MatchId, Match> = docs
            .iter()
            .filter_map(|doc| match decode(user, doc) {
                Decoded::Keep(record) => Some((record.id.clone(), record)),
                _ => None,
            })
            .collect();
        Ok(sorted(&entries))
    }

    /// One-shot refresh of the current user's list.
    ///
    /// Cancels any load still in flight; on error the last known list stays.
    pub async fn reload(&self) -> SyncResult<LoadOutcome> {
        let (user, generation, load_generation, cancel) = {
            let mut state = self.inner.state.lock();
            let Some(user) = state.user.clone() else {
                return Err(SyncError::InvalidOperation(
                    "reload before subscribe".to_string(),
                ));
            };
            if let Some(previous) = state.load_cancel.take() {
                previous.cancel();
            }
            let cancel = CancellationToken::new();
            state.load_cancel = Some(cancel.clone());
            state.load_generation += 1;
            (user, state.generation, state.load_generation, cancel)
        };

        let query = schema::active_matches(&user, self.inner.config.match_list_limit);
        let docs = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(user = %user, "Match list load cancelled");
                return Ok(LoadOutcome::Superseded);
            }
            result = self.inner.store.query(&query) => result?,
        };

        {
            let mut state = self.inner.state.lock();
            if state.load_generation != load_generation {
                return Ok(LoadOutcome::Superseded);
            }
            state.load_cancel = None;
        }
        if self.inner.apply_snapshot(generation, &docs, false) {
            Ok(LoadOutcome::Applied)
        } else {
            Ok(LoadOutcome::Superseded)
        }
    }

    /// Re-open a dropped subscription for the current user.
    ///
    /// Returns whether a new subscription was attempted.
    pub async fn reestablish(&self) -> SyncResult<bool> {
        let user = {
            let state = self.inner.state.lock();
            match (&state.user, state.is_live) {
                (Some(user), false) => user.clone(),
                _ => return Ok(false),
            }
        };
        info!(user = %user, "Re-establishing match subscription");
        self.subscribe(&user).await?;
        Ok(true)
    }

    pub fn unsubscribe(&self) {
        let mut state = self.inner.state.lock();
        state.release();
        state.user = None;
        self.inner.publish(&state);
        debug!("Match subscription released");
    }
}

impl Drop for MatchStore {
    fn drop(&mut self) {
        self.inner.state.lock().release();
    }
}

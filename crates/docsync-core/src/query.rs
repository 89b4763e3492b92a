// ── Query / subscription layer ──
//
// The read side. Consumers subscribe to a QueryKey and get a watch
// channel of fetch state (absent/fetching/fresh/stale plus the last
// fetch error); entity values themselves are read from the store's
// snapshot channels, so every consumer of a key sees the same data.
//
// A background fetch starts when a key has no data, when its data has
// aged past the staleness threshold, or when a local write or push
// event touches it. At most one fetch per key is ever in flight --
// concurrent subscribers share it. Fetch results enter the store
// tagged `ChangeOrigin::Fetch`, which this layer ignores for
// invalidation purposes; otherwise every fetch would schedule the next.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::model::{EntityId, EntityKey, EntityKind};
use crate::mutation::MutationCoordinator;
use crate::store::{ChangeOrigin, ChangeSet, EntityStore};

// ── QueryKey ────────────────────────────────────────────────────────

/// Addressable read queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Chats,
    Chat(EntityId),
    Document { chat: EntityId, id: EntityId },
    Documents(EntityId),
    Messages(EntityId),
    Charts(EntityId),
}

impl QueryKey {
    /// Whether a change to `key` affects this query's result set.
    fn covers(&self, key: &EntityKey) -> bool {
        match self {
            Self::Chats => key.kind == EntityKind::Chat,
            Self::Chat(id) => key.kind == EntityKind::Chat && key.id == *id,
            Self::Document { id, .. } => key.kind == EntityKind::Document && key.id == *id,
            Self::Documents(chat) => {
                key.kind == EntityKind::Document && key.parent.as_ref() == Some(chat)
            }
            Self::Messages(chat) => {
                key.kind == EntityKind::Message && key.parent.as_ref() == Some(chat)
            }
            Self::Charts(chat) => {
                key.kind == EntityKind::Chart && key.parent.as_ref() == Some(chat)
            }
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chats => write!(f, "chats"),
            Self::Chat(id) => write!(f, "chat:{id}"),
            Self::Document { chat, id } => write!(f, "document:{chat}/{id}"),
            Self::Documents(chat) => write!(f, "documents:{chat}"),
            Self::Messages(chat) => write!(f, "messages:{chat}"),
            Self::Charts(chat) => write!(f, "charts:{chat}"),
        }
    }
}

// ── Fetch state ─────────────────────────────────────────────────────

/// Per-key fetch lifecycle: `Absent -> Fetching -> Fresh -> Stale ->
/// Fresh ...`. `Fetching` only appears while there is no value yet; a
/// refresh of existing data shows `Stale` + `is_fetching`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    Absent,
    Fetching,
    Fresh,
    Stale,
}

/// What a subscriber sees. A failed refresh keeps the previous value in
/// the store and reports the error here, so consumers are never forced
/// to blank out on a transient failure.
#[derive(Debug, Clone)]
pub struct QueryState {
    pub phase: FetchPhase,
    pub is_fetching: bool,
    pub error: Option<SyncError>,
}

impl QueryState {
    fn initial() -> Self {
        Self {
            phase: FetchPhase::Absent,
            is_fetching: false,
            error: None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self.phase, FetchPhase::Absent | FetchPhase::Stale)
    }
}

// ── Fetcher ─────────────────────────────────────────────────────────

/// The seam to the remote API. The production implementation wraps the
/// HTTP client and lands results in the store via `apply_*_list`;
/// tests substitute stubs.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, key: &QueryKey, store: &EntityStore) -> Result<(), SyncError>;
}

// ── QueryCache ──────────────────────────────────────────────────────

struct QueryEntry {
    state: watch::Sender<QueryState>,
    subscribers: AtomicUsize,
    inflight: std::sync::Mutex<Option<JoinHandle<()>>>,
    fetched_at: std::sync::Mutex<Option<Instant>>,
}

impl QueryEntry {
    fn new() -> Self {
        let (state, _) = watch::channel(QueryState::initial());
        Self {
            state,
            subscribers: AtomicUsize::new(0),
            inflight: std::sync::Mutex::new(None),
            fetched_at: std::sync::Mutex::new(None),
        }
    }

    fn update<F: FnOnce(&mut QueryState)>(&self, f: F) {
        self.state.send_modify(f);
    }
}

struct CacheInner {
    store: Arc<EntityStore>,
    mutations: Arc<MutationCoordinator>,
    fetcher: Arc<dyn Fetcher>,
    entries: DashMap<QueryKey, Arc<QueryEntry>>,
    stale_after: Duration,
}

/// Read-side cache front. Cheaply cloneable.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    pub fn new(
        store: Arc<EntityStore>,
        mutations: Arc<MutationCoordinator>,
        fetcher: Arc<dyn Fetcher>,
        stale_after: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                mutations,
                fetcher,
                entries: DashMap::new(),
                stale_after,
            }),
        }
    }

    /// Bind to a query. Returns immediately with the current state and
    /// kicks off a background fetch if the key needs one.
    pub fn subscribe(&self, key: QueryKey) -> QueryHandle {
        let entry = self.entry(&key);
        entry.subscribers.fetch_add(1, Ordering::AcqRel);
        let rx = entry.state.subscribe();
        self.ensure_fresh(&key, &entry);
        QueryHandle { key, entry, rx }
    }

    /// Force a refetch regardless of age (no-op if one is in flight).
    pub fn refresh(&self, key: &QueryKey) {
        let entry = self.entry(key);
        self.start_fetch(key, &entry);
    }

    /// Watch the store's change feed and invalidate overlapping
    /// queries. Runs until cancelled.
    pub fn spawn_invalidation_task(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        let mut changes = cache.inner.store.changes();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    result = changes.recv() => match result {
                        Ok(change) => cache.apply_change(&change),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "invalidation feed lagged, marking all queries stale");
                            cache.mark_all_stale();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    // ── Internals ────────────────────────────────────────────────────

    fn entry(&self, key: &QueryKey) -> Arc<QueryEntry> {
        Arc::clone(
            self.inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(QueryEntry::new()))
                .value(),
        )
    }

    fn ensure_fresh(&self, key: &QueryKey, entry: &Arc<QueryEntry>) {
        let expired = !entry
            .fetched_at
            .lock()
            .ok()
            .and_then(|stamp| *stamp)
            .is_some_and(|at| at.elapsed() < self.inner.stale_after);

        let needs_fetch = match entry.state.borrow().phase {
            FetchPhase::Absent | FetchPhase::Stale => true,
            FetchPhase::Fresh => expired,
            FetchPhase::Fetching => false,
        };

        if needs_fetch {
            self.start_fetch(key, entry);
        }
    }

    /// Spawn the fetch for a key unless one is already in flight --
    /// concurrent subscribers share a single request.
    fn start_fetch(&self, key: &QueryKey, entry: &Arc<QueryEntry>) {
        let Ok(mut inflight) = entry.inflight.lock() else {
            return;
        };
        if inflight.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        entry.update(|state| {
            state.is_fetching = true;
            if state.phase == FetchPhase::Absent {
                state.phase = FetchPhase::Fetching;
            }
        });

        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        let entry_task = Arc::clone(entry);
        *inflight = Some(tokio::spawn(async move {
            match inner.fetcher.fetch(&key, &inner.store).await {
                Ok(()) => {
                    if let Ok(mut stamp) = entry_task.fetched_at.lock() {
                        *stamp = Some(Instant::now());
                    }
                    entry_task.update(|state| {
                        state.phase = FetchPhase::Fresh;
                        state.is_fetching = false;
                        state.error = None;
                    });
                }
                Err(err) => {
                    tracing::debug!(query = %key, error = %err, "background fetch failed");
                    entry_task.update(|state| {
                        state.is_fetching = false;
                        state.error = Some(err);
                        state.phase = match state.phase {
                            // No previous value to fall back on
                            FetchPhase::Fetching => FetchPhase::Absent,
                            // Keep serving the last good value
                            FetchPhase::Fresh | FetchPhase::Stale => FetchPhase::Stale,
                            FetchPhase::Absent => FetchPhase::Absent,
                        };
                    });
                }
            }
        }));
    }

    fn apply_change(&self, change: &ChangeSet) {
        if change.origin == ChangeOrigin::Fetch {
            return;
        }

        for entry_ref in &self.inner.entries {
            let (key, entry) = (entry_ref.key(), entry_ref.value());
            if !change.keys.iter().any(|k| key.covers(k)) {
                continue;
            }

            entry.update(|state| {
                if state.phase == FetchPhase::Fresh {
                    state.phase = FetchPhase::Stale;
                }
            });

            // While a local write on an overlapping key is still in
            // flight, a refetch could overwrite its speculative value
            // with stale server state. The write's resolution emits
            // another change, which lands here again.
            let write_in_flight = change
                .keys
                .iter()
                .any(|k| key.covers(k) && self.inner.mutations.is_pending(k));
            if write_in_flight {
                continue;
            }

            if entry.subscribers.load(Ordering::Acquire) > 0 {
                let key = key.clone();
                let entry = Arc::clone(entry);
                self.start_fetch(&key, &entry);
            }
        }
    }

    fn mark_all_stale(&self) {
        for entry_ref in &self.inner.entries {
            entry_ref.value().update(|state| {
                if state.phase == FetchPhase::Fresh {
                    state.phase = FetchPhase::Stale;
                }
            });
        }
    }
}

// ── QueryHandle ─────────────────────────────────────────────────────

/// A live binding to one query. Dropping the last handle for a key
/// aborts that key's pending background fetch (best effort -- a
/// request already on the wire is simply discarded on arrival). It
/// never cancels a write.
pub struct QueryHandle {
    key: QueryKey,
    entry: Arc<QueryEntry>,
    rx: watch::Receiver<QueryState>,
}

impl QueryHandle {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Current fetch state.
    pub fn state(&self) -> QueryState {
        self.rx.borrow().clone()
    }

    /// Wait for the next state change. Returns `None` if the cache has
    /// been dropped.
    pub async fn changed(&mut self) -> Option<QueryState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        let previous = self.entry.subscribers.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            if let Ok(mut inflight) = self.entry.inflight.lock() {
                if let Some(handle) = inflight.take() {
                    if !handle.is_finished() {
                        handle.abort();
                        self.entry.update(|state| {
                            state.is_fetching = false;
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;

    use crate::model::Chat;

    use super::*;

    fn chat(id: &str, title: &str) -> Chat {
        let now = Utc::now();
        Chat {
            id: EntityId::from(id),
            title: title.into(),
            starred: false,
            created_at: now,
            updated_at: now,
        }
    }

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    impl CountingFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(&self, key: &QueryKey, store: &EntityStore) -> Result<(), SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if matches!(key, QueryKey::Chats) {
                store.apply_chat_list(vec![chat("1", "fetched")]);
            }
            Ok(())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl Fetcher for FailingFetcher {
        async fn fetch(&self, _key: &QueryKey, _store: &EntityStore) -> Result<(), SyncError> {
            Err(SyncError::Network {
                message: "unreachable".into(),
            })
        }
    }

    fn setup(fetcher: Arc<dyn Fetcher>, stale_after: Duration) -> (Arc<EntityStore>, QueryCache) {
        let store = Arc::new(EntityStore::new());
        let mutations = Arc::new(MutationCoordinator::new(Arc::clone(&store)));
        let cache = QueryCache::new(Arc::clone(&store), mutations, fetcher, stale_after);
        (store, cache)
    }

    async fn settle(handle: &mut QueryHandle) {
        while handle.state().is_fetching || handle.state().phase == FetchPhase::Fetching {
            handle.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn concurrent_subscribers_share_one_fetch() {
        let fetcher = CountingFetcher::new();
        let (store, cache) = setup(fetcher.clone(), Duration::from_secs(60));

        let mut first = cache.subscribe(QueryKey::Chats);
        let _second = cache.subscribe(QueryKey::Chats);
        settle(&mut first).await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.chat_count(), 1);
        assert_eq!(first.state().phase, FetchPhase::Fresh);
    }

    #[tokio::test]
    async fn fresh_data_is_not_refetched_within_threshold() {
        let fetcher = CountingFetcher::new();
        let (_store, cache) = setup(fetcher.clone(), Duration::from_secs(60));

        let mut first = cache.subscribe(QueryKey::Chats);
        settle(&mut first).await;
        drop(first);

        let mut second = cache.subscribe(QueryKey::Chats);
        settle(&mut second).await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_previous_value_and_reports_error() {
        let fetcher = CountingFetcher::new();
        let (store, cache) = setup(fetcher.clone(), Duration::from_secs(60));

        let mut handle = cache.subscribe(QueryKey::Chats);
        settle(&mut handle).await;
        assert_eq!(store.chat_count(), 1);
        drop(handle);

        // Swap in a failing fetcher by building a second cache over the
        // same store, then force a refresh.
        let mutations = Arc::new(MutationCoordinator::new(Arc::clone(&store)));
        let failing = QueryCache::new(
            Arc::clone(&store),
            mutations,
            Arc::new(FailingFetcher),
            Duration::ZERO,
        );
        let mut handle = failing.subscribe(QueryKey::Chats);
        while handle.state().error.is_none() {
            handle.changed().await.unwrap();
        }

        let state = handle.state();
        assert!(matches!(state.error, Some(SyncError::Network { .. })));
        // The earlier data is still served
        assert_eq!(store.chat_count(), 1);
    }

    #[tokio::test]
    async fn mutation_change_triggers_refetch_for_live_queries() {
        let fetcher = CountingFetcher::new();
        let (store, cache) = setup(fetcher.clone(), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let _watcher = cache.spawn_invalidation_task(cancel.clone());

        let mut handle = cache.subscribe(QueryKey::Chats);
        settle(&mut handle).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        // A push-originated change lands on a chat key.
        store.put(chat("2", "from push"), ChangeOrigin::Push);

        while fetcher.calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        settle(&mut handle).await;
        assert_eq!(handle.state().phase, FetchPhase::Fresh);

        cancel.cancel();
    }

    #[tokio::test]
    async fn fetch_origin_changes_do_not_invalidate() {
        let fetcher = CountingFetcher::new();
        let (store, cache) = setup(fetcher.clone(), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let _watcher = cache.spawn_invalidation_task(cancel.clone());

        let mut handle = cache.subscribe(QueryKey::Chats);
        settle(&mut handle).await;

        store.apply_chat_list(vec![chat("1", "fetched again")]);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(
            fetcher.calls.load(Ordering::SeqCst),
            1,
            "a fetch landing must not schedule the next fetch"
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn queries_without_subscribers_go_stale_quietly() {
        let fetcher = CountingFetcher::new();
        let (store, cache) = setup(fetcher.clone(), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let _watcher = cache.spawn_invalidation_task(cancel.clone());

        let mut handle = cache.subscribe(QueryKey::Chats);
        settle(&mut handle).await;
        drop(handle);

        store.put(chat("2", "from push"), ChangeOrigin::Push);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(
            fetcher.calls.load(Ordering::SeqCst),
            1,
            "no subscriber, no background traffic"
        );
        cancel.cancel();
    }
}

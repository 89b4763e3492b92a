// ── Optimistic mutation coordination ──
//
// Every write follows the same shape: apply a speculative value to the
// store immediately, call the server, then either replace the entry
// with the server's authoritative result or restore the pre-write
// snapshot. Responses may arrive in any order, so resolution is gated
// by an ownership check against a per-key index of the newest pending
// write: a resolution that lost its slot writes nothing.
//
// Concurrent writes to one key follow a supersede policy. The newer
// write snapshots the current (already speculative) value and takes
// over the index slot; the older write's eventual commit or rollback
// becomes a no-op. Queueing writes would add latency without improving
// consistency, and rejecting them would surface spurious errors on
// fast double-edits.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::error::SyncError;
use crate::model::EntityKey;
use crate::store::{ChangeOrigin, EntityStore, StoreEntity};

/// Resolution outcome of an in-flight write. A write is pending exactly
/// while it holds its key's index slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug)]
struct PendingRecord {
    mutation_id: u64,
}

/// Coordinates optimistic writes against the [`EntityStore`].
///
/// Owns the pending-write index exclusively; nothing else decides when
/// a snapshot may be restored.
pub struct MutationCoordinator {
    store: Arc<EntityStore>,
    pending: DashMap<EntityKey, PendingRecord>,
    next_id: AtomicU64,
}

impl MutationCoordinator {
    pub fn new(store: Arc<EntityStore>) -> Self {
        Self {
            store,
            pending: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of writes currently awaiting a server response.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether a write on `key` is awaiting a server response.
    pub fn is_pending(&self, key: &EntityKey) -> bool {
        self.pending.contains_key(key)
    }

    /// A server-confirmed removal outranks any in-flight write on `key`:
    /// the write's later resolution will neither restore a snapshot nor
    /// re-insert the entity. Called by the event bridge when a deletion
    /// arrives over the push channel.
    pub fn supersede(&self, key: &EntityKey) {
        if self.pending.remove(key).is_some() {
            tracing::debug!(%key, "pending write superseded by confirmed removal");
        }
    }

    /// Run an optimistic write.
    ///
    /// `patch` computes the speculative value from the current cached
    /// one (which may itself be speculative); it is applied before
    /// `remote` starts, so consumers see the change with no round-trip.
    /// On success the server's value replaces the speculative one --
    /// fields the client cannot predict (ids, timestamps) always come
    /// from the response. On failure the pre-write snapshot is restored
    /// and the error surfaced; retrying is the caller's decision.
    pub async fn mutate<T, P, F, Fut>(
        &self,
        key: EntityKey,
        patch: P,
        remote: F,
    ) -> Result<Arc<T>, SyncError>
    where
        T: StoreEntity,
        P: FnOnce(Option<Arc<T>>) -> T,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let snapshot = self.store.get::<T>(&key);
        let optimistic = patch(snapshot.clone());
        debug_assert_eq!(optimistic.key(), key, "patch must not change the key");

        self.store.put(optimistic, ChangeOrigin::Mutation);
        let mutation_id = self.begin(&key);

        match remote().await {
            Ok(confirmed) => {
                let confirmed = Arc::new(confirmed);
                if self.resolve(&key, mutation_id, MutationStatus::Committed) {
                    let server_key = confirmed.key();
                    let value = (*confirmed).clone();
                    if server_key == key {
                        self.store.put(value, ChangeOrigin::Mutation);
                    } else {
                        // A confirmed create: the server id replaces the
                        // local placeholder in a single change cycle.
                        self.store.transaction(ChangeOrigin::Mutation, |txn| {
                            txn.remove(key.clone());
                            txn.put(value);
                        });
                    }
                }
                Ok(confirmed)
            }
            Err(err) => {
                if self.resolve(&key, mutation_id, MutationStatus::RolledBack) {
                    match &snapshot {
                        Some(previous) => {
                            self.store.put((**previous).clone(), ChangeOrigin::Mutation);
                        }
                        None => self.store.remove(&key, ChangeOrigin::Mutation),
                    }
                }
                Err(err)
            }
        }
    }

    /// Run an optimistic delete. The entry disappears immediately and
    /// reappears only if the server rejects the removal.
    pub async fn delete<T, F, Fut>(&self, key: EntityKey, remote: F) -> Result<(), SyncError>
    where
        T: StoreEntity,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), SyncError>>,
    {
        let snapshot = self.store.get::<T>(&key);
        self.store.remove(&key, ChangeOrigin::Mutation);
        let mutation_id = self.begin(&key);

        match remote().await {
            Ok(()) => {
                self.resolve(&key, mutation_id, MutationStatus::Committed);
                Ok(())
            }
            Err(err) => {
                if self.resolve(&key, mutation_id, MutationStatus::RolledBack) {
                    if let Some(previous) = snapshot {
                        self.store.put((*previous).clone(), ChangeOrigin::Mutation);
                    }
                }
                Err(err)
            }
        }
    }

    // ── Pending index ────────────────────────────────────────────────

    /// Register a new pending write, taking the key's slot from any
    /// older in-flight write.
    fn begin(&self, key: &EntityKey) -> u64 {
        let mutation_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self
            .pending
            .insert(key.clone(), PendingRecord { mutation_id });
        if let Some(older) = previous {
            tracing::debug!(
                %key,
                mutation_id,
                superseded = older.mutation_id,
                "newer write took over the key"
            );
        }
        mutation_id
    }

    /// Release the slot if this write still owns it. Returns whether it
    /// did -- a `false` means the store must not be touched.
    fn resolve(&self, key: &EntityKey, mutation_id: u64, status: MutationStatus) -> bool {
        let owned = self
            .pending
            .remove_if(key, |_, record| record.mutation_id == mutation_id)
            .is_some();
        tracing::debug!(%key, mutation_id, ?status, owned, "write resolved");
        owned
    }
}

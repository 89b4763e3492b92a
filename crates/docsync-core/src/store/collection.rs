// ── Generic reactive entity collection ──
//
// Lock-free concurrent storage for a single entity kind with push-based
// change notification via `watch` channels. Mutations are *quiet*:
// callers batch any number of upserts/removes and then `flush()` once,
// so subscribers see exactly one snapshot per logical change.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::model::EntityId;

/// Snapshot ordering for a collection, fixed at construction.
type SortFn<T> = fn(&Arc<T>, &Arc<T>) -> Ordering;

#[derive(Clone)]
struct Entry<T> {
    parent: Option<EntityId>,
    value: Arc<T>,
}

/// A reactive collection for a single entity kind.
///
/// Uses `DashMap` for O(1) concurrent lookups and `watch` channels for
/// change notification. Child entities (documents, messages, charts)
/// additionally index under their owning chat id.
pub(crate) struct Collection<T: Clone + Send + Sync + 'static> {
    /// Primary storage: entity id -> entry.
    by_id: DashMap<EntityId, Entry<T>>,

    /// Secondary index: owning chat id -> child entity ids.
    children: DashMap<EntityId, HashSet<EntityId>>,

    /// Version counter, bumped on every flushed change cycle.
    version: watch::Sender<u64>,

    /// Full snapshot, rebuilt on flush, ordered by `order`.
    snapshot: watch::Sender<Arc<Vec<Arc<T>>>>,

    order: SortFn<T>,
}

impl<T: Clone + Send + Sync + 'static> Collection<T> {
    pub(crate) fn new(order: SortFn<T>) -> Self {
        let (version, _) = watch::channel(0u64);
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));

        Self {
            by_id: DashMap::new(),
            children: DashMap::new(),
            version,
            snapshot,
            order,
        }
    }

    /// Insert or update an entity. Returns `true` if the id was new.
    ///
    /// Quiet -- subscribers are not notified until [`flush`](Self::flush).
    pub(crate) fn upsert(&self, parent: Option<EntityId>, id: EntityId, value: T) -> bool {
        // Re-parenting: drop the id from the old parent's child set.
        if let Some(existing) = self.by_id.get(&id) {
            if existing.parent != parent {
                if let Some(old_parent) = existing.parent.clone() {
                    drop(existing);
                    if let Some(mut set) = self.children.get_mut(&old_parent) {
                        set.remove(&id);
                    }
                }
            }
        }

        if let Some(parent_id) = &parent {
            self.children
                .entry(parent_id.clone())
                .or_default()
                .insert(id.clone());
        }

        self.by_id
            .insert(
                id,
                Entry {
                    parent,
                    value: Arc::new(value),
                },
            )
            .is_none()
    }

    /// Remove an entity by id. Returns the removed value if it existed.
    ///
    /// Quiet -- subscribers are not notified until [`flush`](Self::flush).
    pub(crate) fn remove(&self, id: &EntityId) -> Option<Arc<T>> {
        let (_, entry) = self.by_id.remove(id)?;
        if let Some(parent) = &entry.parent {
            if let Some(mut set) = self.children.get_mut(parent) {
                set.remove(id);
            }
        }
        Some(entry.value)
    }

    pub(crate) fn get(&self, id: &EntityId) -> Option<Arc<T>> {
        self.by_id.get(id).map(|r| Arc::clone(&r.value))
    }

    /// All children of a chat, in snapshot order.
    pub(crate) fn children_of(&self, parent: &EntityId) -> Vec<Arc<T>> {
        let ids: Vec<EntityId> = match self.children.get(parent) {
            Some(set) => set.iter().cloned().collect(),
            None => return Vec::new(),
        };
        let mut values: Vec<Arc<T>> = ids.iter().filter_map(|id| self.get(id)).collect();
        values.sort_by(|a, b| (self.order)(a, b));
        values
    }

    /// Get the current snapshot (cheap `Arc` clone).
    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to snapshot changes via a `watch::Receiver`.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<T>>>> {
        self.snapshot.subscribe()
    }

    /// Return all current entity ids in the collection.
    pub(crate) fn ids(&self) -> Vec<EntityId> {
        self.by_id.iter().map(|r| r.key().clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Rebuild the snapshot and notify subscribers. Call once per
    /// logical change cycle, after any number of quiet mutations.
    pub(crate) fn flush(&self) {
        let mut values: Vec<Arc<T>> = self
            .by_id
            .iter()
            .map(|r| Arc::clone(&r.value))
            .collect();
        values.sort_by(|a, b| (self.order)(a, b));
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
        self.version.send_modify(|v| *v += 1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn by_value(a: &Arc<String>, b: &Arc<String>) -> Ordering {
        a.cmp(b)
    }

    fn col() -> Collection<String> {
        Collection::new(by_value)
    }

    #[test]
    fn upsert_returns_true_for_new_id() {
        let c = col();
        assert!(c.upsert(None, EntityId::from("1"), "hello".into()));
        assert!(!c.upsert(None, EntityId::from("1"), "world".into()));
    }

    #[test]
    fn get_reflects_latest_upsert() {
        let c = col();
        c.upsert(None, EntityId::from("1"), "hello".into());
        c.upsert(None, EntityId::from("1"), "world".into());
        assert_eq!(*c.get(&EntityId::from("1")).unwrap(), "world");
    }

    #[test]
    fn remove_cleans_up_child_index() {
        let c = col();
        let parent = EntityId::from("chat-1");
        c.upsert(Some(parent.clone()), EntityId::from("m-1"), "a".into());

        let removed = c.remove(&EntityId::from("m-1"));
        assert_eq!(*removed.unwrap(), "a");
        assert!(c.get(&EntityId::from("m-1")).is_none());
        assert!(c.children_of(&parent).is_empty());
    }

    #[test]
    fn children_of_returns_only_that_parent() {
        let c = col();
        let p1 = EntityId::from("chat-1");
        let p2 = EntityId::from("chat-2");
        c.upsert(Some(p1.clone()), EntityId::from("m-1"), "a".into());
        c.upsert(Some(p1.clone()), EntityId::from("m-2"), "b".into());
        c.upsert(Some(p2), EntityId::from("m-3"), "c".into());

        let kids = c.children_of(&p1);
        assert_eq!(kids.len(), 2);
        assert_eq!(*kids[0], "a");
        assert_eq!(*kids[1], "b");
    }

    #[test]
    fn snapshot_updates_only_on_flush() {
        let c = col();
        c.upsert(None, EntityId::from("1"), "x".into());
        assert!(c.snapshot().is_empty());

        c.flush();
        assert_eq!(c.snapshot().len(), 1);
    }

    #[test]
    fn snapshot_is_sorted() {
        let c = col();
        c.upsert(None, EntityId::from("1"), "zebra".into());
        c.upsert(None, EntityId::from("2"), "apple".into());
        c.flush();

        let snap = c.snapshot();
        assert_eq!(*snap[0], "apple");
        assert_eq!(*snap[1], "zebra");
    }

    #[test]
    fn flush_notifies_subscribers_once() {
        let c = col();
        let mut rx = c.subscribe();
        assert!(!rx.has_changed().unwrap());

        c.upsert(None, EntityId::from("1"), "x".into());
        c.upsert(None, EntityId::from("2"), "y".into());
        c.flush();

        assert!(rx.has_changed().unwrap());
        let snap = rx.borrow_and_update().clone();
        assert_eq!(snap.len(), 2);
        assert!(!rx.has_changed().unwrap());
    }
}

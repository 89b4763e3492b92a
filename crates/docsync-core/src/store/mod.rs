// ── Central reactive entity store ──
//
// The single shared mutable resource of the sync engine. Every writer
// (mutation path, event bridge, query fetches) routes through
// `put`/`remove`/`transaction`; readers consume wait-free snapshots.
// A transaction applies all of its operations before broadcasting one
// ChangeSet, so subscribers never observe half of a batch.

mod collection;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::model::{Chat, Chart, Document, EntityId, EntityKey, EntityKind, Message};
use crate::stream::EntityStream;
use collection::Collection;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

// ── Change notification ─────────────────────────────────────────────

/// Which write path produced a change. The query layer refetches on
/// `Mutation` and `Push` changes, but not on data landing from its own
/// fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Fetch,
    Mutation,
    Push,
}

/// One notification cycle: every key touched by a batch, in apply order.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub revision: u64,
    pub origin: ChangeOrigin,
    pub keys: Vec<EntityKey>,
}

// ── Batched operations ──────────────────────────────────────────────

/// A single operation inside a transaction. Heterogeneous so one batch
/// can span entity kinds (e.g. a new message plus its chat's bumped
/// `updated_at`).
pub enum TxnOp {
    PutChat(Chat),
    PutDocument(Document),
    PutMessage(Message),
    PutChart(Chart),
    Remove(EntityKey),
}

/// Batch builder handed to [`EntityStore::transaction`] closures.
/// Within a batch, the last write to a key wins.
pub struct Txn {
    ops: Vec<TxnOp>,
}

impl Txn {
    pub fn put<T: StoreEntity>(&mut self, entity: T) {
        self.ops.push(entity.into_op());
    }

    pub fn remove(&mut self, key: EntityKey) {
        self.ops.push(TxnOp::Remove(key));
    }
}

// ── StoreEntity ─────────────────────────────────────────────────────

/// Entities the store can hold. Gives generic callers (the mutation
/// path) typed access without a type-erased value representation.
pub trait StoreEntity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn key(&self) -> EntityKey;

    fn get_from(store: &EntityStore, key: &EntityKey) -> Option<Arc<Self>>;

    fn into_op(self) -> TxnOp;
}

impl StoreEntity for Chat {
    const KIND: EntityKind = EntityKind::Chat;

    fn key(&self) -> EntityKey {
        EntityKey::chat(self.id.clone())
    }

    fn get_from(store: &EntityStore, key: &EntityKey) -> Option<Arc<Self>> {
        store.chats.get(&key.id)
    }

    fn into_op(self) -> TxnOp {
        TxnOp::PutChat(self)
    }
}

impl StoreEntity for Document {
    const KIND: EntityKind = EntityKind::Document;

    fn key(&self) -> EntityKey {
        EntityKey::document(self.chat_id.clone(), self.id.clone())
    }

    fn get_from(store: &EntityStore, key: &EntityKey) -> Option<Arc<Self>> {
        store.documents.get(&key.id)
    }

    fn into_op(self) -> TxnOp {
        TxnOp::PutDocument(self)
    }
}

impl StoreEntity for Message {
    const KIND: EntityKind = EntityKind::Message;

    fn key(&self) -> EntityKey {
        EntityKey::message(self.chat_id.clone(), self.id.clone())
    }

    fn get_from(store: &EntityStore, key: &EntityKey) -> Option<Arc<Self>> {
        store.messages.get(&key.id)
    }

    fn into_op(self) -> TxnOp {
        TxnOp::PutMessage(self)
    }
}

impl StoreEntity for Chart {
    const KIND: EntityKind = EntityKind::Chart;

    fn key(&self) -> EntityKey {
        EntityKey::chart(self.chat_id.clone(), self.id.clone())
    }

    fn get_from(store: &EntityStore, key: &EntityKey) -> Option<Arc<Self>> {
        store.charts.get(&key.id)
    }

    fn into_op(self) -> TxnOp {
        TxnOp::PutChart(self)
    }
}

// ── EntityStore ─────────────────────────────────────────────────────

/// Central reactive store for all cached entities.
///
/// One instance per session -- constructed on login, dropped on logout.
/// Pure in-memory structure: no network access, no failure modes;
/// notification is the only side effect.
pub struct EntityStore {
    chats: Collection<Chat>,
    documents: Collection<Document>,
    messages: Collection<Message>,
    charts: Collection<Chart>,
    revision: AtomicU64,
    changes: broadcast::Sender<Arc<ChangeSet>>,
}

impl EntityStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Self {
            // Chats and charts list newest first; messages read in
            // conversation order; documents alphabetically.
            chats: Collection::new(|a, b| b.updated_at.cmp(&a.updated_at)),
            documents: Collection::new(|a, b| a.name.cmp(&b.name)),
            messages: Collection::new(|a, b| a.created_at.cmp(&b.created_at)),
            charts: Collection::new(|a, b| b.updated_at.cmp(&a.updated_at)),
            revision: AtomicU64::new(0),
            changes,
        }
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Insert or replace a single entity.
    pub fn put<T: StoreEntity>(&self, entity: T, origin: ChangeOrigin) {
        self.transaction(origin, |txn| txn.put(entity));
    }

    /// Delete a single entity. A no-op if the key is absent.
    pub fn remove(&self, key: &EntityKey, origin: ChangeOrigin) {
        self.transaction(origin, |txn| txn.remove(key.clone()));
    }

    /// Apply a batch of puts/removes as one notification cycle.
    ///
    /// All operations land in storage before snapshots are rebuilt and
    /// the single ChangeSet goes out, so no subscriber can observe a
    /// partially applied batch. An empty batch notifies nobody.
    pub fn transaction<F: FnOnce(&mut Txn)>(&self, origin: ChangeOrigin, f: F) {
        let mut txn = Txn { ops: Vec::new() };
        f(&mut txn);
        if txn.ops.is_empty() {
            return;
        }

        let mut keys = Vec::with_capacity(txn.ops.len());
        let mut touched = [false; 4];
        for op in txn.ops {
            let key = self.apply(op);
            touched[kind_index(key.kind)] = true;
            keys.push(key);
        }

        if touched[kind_index(EntityKind::Chat)] {
            self.chats.flush();
        }
        if touched[kind_index(EntityKind::Document)] {
            self.documents.flush();
        }
        if touched[kind_index(EntityKind::Message)] {
            self.messages.flush();
        }
        if touched[kind_index(EntityKind::Chart)] {
            self.charts.flush();
        }

        let revision = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(revision, ?origin, touched = keys.len(), "store changed");
        let _ = self.changes.send(Arc::new(ChangeSet {
            revision,
            origin,
            keys,
        }));
    }

    fn apply(&self, op: TxnOp) -> EntityKey {
        match op {
            TxnOp::PutChat(chat) => {
                let key = chat.key();
                self.chats.upsert(None, chat.id.clone(), chat);
                key
            }
            TxnOp::PutDocument(doc) => {
                let key = doc.key();
                self.documents
                    .upsert(Some(doc.chat_id.clone()), doc.id.clone(), doc);
                key
            }
            TxnOp::PutMessage(message) => {
                let key = message.key();
                self.messages
                    .upsert(Some(message.chat_id.clone()), message.id.clone(), message);
                key
            }
            TxnOp::PutChart(chart) => {
                let key = chart.key();
                self.charts
                    .upsert(Some(chart.chat_id.clone()), chart.id.clone(), chart);
                key
            }
            TxnOp::Remove(key) => {
                match key.kind {
                    EntityKind::Chat => {
                        self.chats.remove(&key.id);
                    }
                    EntityKind::Document => {
                        self.documents.remove(&key.id);
                    }
                    EntityKind::Message => {
                        self.messages.remove(&key.id);
                    }
                    EntityKind::Chart => {
                        self.charts.remove(&key.id);
                    }
                }
                key
            }
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Generic lookup by key. Synchronous, never blocks.
    pub fn get<T: StoreEntity>(&self, key: &EntityKey) -> Option<Arc<T>> {
        debug_assert_eq!(key.kind, T::KIND);
        T::get_from(self, key)
    }

    pub fn chat(&self, id: &EntityId) -> Option<Arc<Chat>> {
        self.chats.get(id)
    }

    pub fn document(&self, id: &EntityId) -> Option<Arc<Document>> {
        self.documents.get(id)
    }

    pub fn message(&self, id: &EntityId) -> Option<Arc<Message>> {
        self.messages.get(id)
    }

    pub fn chart(&self, id: &EntityId) -> Option<Arc<Chart>> {
        self.charts.get(id)
    }

    pub fn chats_snapshot(&self) -> Arc<Vec<Arc<Chat>>> {
        self.chats.snapshot()
    }

    pub fn documents_of(&self, chat_id: &EntityId) -> Vec<Arc<Document>> {
        self.documents.children_of(chat_id)
    }

    pub fn messages_of(&self, chat_id: &EntityId) -> Vec<Arc<Message>> {
        self.messages.children_of(chat_id)
    }

    pub fn charts_of(&self, chat_id: &EntityId) -> Vec<Arc<Chart>> {
        self.charts.children_of(chat_id)
    }

    pub fn chat_count(&self) -> usize {
        self.chats.len()
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Subscribe to the per-batch change feed.
    pub fn changes(&self) -> broadcast::Receiver<Arc<ChangeSet>> {
        self.changes.subscribe()
    }

    pub fn subscribe_chats(&self) -> EntityStream<Chat> {
        EntityStream::new(self.chats.subscribe())
    }

    pub fn subscribe_documents(&self) -> EntityStream<Document> {
        EntityStream::new(self.documents.subscribe())
    }

    pub fn subscribe_messages(&self) -> EntityStream<Message> {
        EntityStream::new(self.messages.subscribe())
    }

    pub fn subscribe_charts(&self) -> EntityStream<Chart> {
        EntityStream::new(self.charts.subscribe())
    }

    // ── List reconciliation ──────────────────────────────────────────
    //
    // Fetch results arrive as complete lists. Upsert the incoming set,
    // then prune ids that are gone server-side -- except temp ids,
    // which belong to optimistic creates the server cannot know yet.
    // Upsert-then-prune avoids the brief empty state a clear-then-fill
    // approach would flash at subscribers.

    pub fn apply_chat_list(&self, incoming: Vec<Chat>) {
        let incoming_ids: HashSet<EntityId> = incoming.iter().map(|c| c.id.clone()).collect();
        let stale: Vec<EntityId> = self
            .chats
            .ids()
            .into_iter()
            .filter(|id| !incoming_ids.contains(id) && !id.is_temp())
            .collect();

        self.transaction(ChangeOrigin::Fetch, |txn| {
            for chat in incoming {
                txn.put(chat);
            }
            for id in stale {
                txn.remove(EntityKey::chat(id));
            }
        });
    }

    pub fn apply_document_list(&self, chat_id: &EntityId, incoming: Vec<Document>) {
        let incoming_ids: HashSet<EntityId> = incoming.iter().map(|d| d.id.clone()).collect();
        let stale: Vec<EntityKey> = self
            .documents
            .children_of(chat_id)
            .into_iter()
            .filter(|d| !incoming_ids.contains(&d.id) && !d.id.is_temp())
            .map(|d| d.key())
            .collect();

        self.transaction(ChangeOrigin::Fetch, |txn| {
            for doc in incoming {
                txn.put(doc);
            }
            for key in stale {
                txn.remove(key);
            }
        });
    }

    pub fn apply_message_list(&self, chat_id: &EntityId, incoming: Vec<Message>) {
        let incoming_ids: HashSet<EntityId> = incoming.iter().map(|m| m.id.clone()).collect();
        let stale: Vec<EntityKey> = self
            .messages
            .children_of(chat_id)
            .into_iter()
            .filter(|m| !incoming_ids.contains(&m.id) && !m.id.is_temp())
            .map(|m| m.key())
            .collect();

        self.transaction(ChangeOrigin::Fetch, |txn| {
            for message in incoming {
                txn.put(message);
            }
            for key in stale {
                txn.remove(key);
            }
        });
    }

    pub fn apply_chart_list(&self, chat_id: &EntityId, incoming: Vec<Chart>) {
        let incoming_ids: HashSet<EntityId> = incoming.iter().map(|c| c.id.clone()).collect();
        let stale: Vec<EntityKey> = self
            .charts
            .children_of(chat_id)
            .into_iter()
            .filter(|c| !incoming_ids.contains(&c.id) && !c.id.is_temp())
            .map(|c| c.key())
            .collect();

        self.transaction(ChangeOrigin::Fetch, |txn| {
            for chart in incoming {
                txn.put(chart);
            }
            for key in stale {
                txn.remove(key);
            }
        });
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_index(kind: EntityKind) -> usize {
    match kind {
        EntityKind::Chat => 0,
        EntityKind::Document => 1,
        EntityKind::Message => 2,
        EntityKind::Chart => 3,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;

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

    fn message(id: &str, chat_id: &str, body: &str) -> Message {
        Message {
            id: EntityId::from(id),
            chat_id: EntityId::from(chat_id),
            role: crate::model::Role::User,
            body: body.into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn put_then_get() {
        let store = EntityStore::new();
        store.put(chat("1", "hello"), ChangeOrigin::Fetch);

        let found = store.chat(&EntityId::from("1")).unwrap();
        assert_eq!(found.title, "hello");
    }

    #[test]
    fn remove_leaves_key_absent() {
        let store = EntityStore::new();
        store.put(chat("1", "hello"), ChangeOrigin::Fetch);
        store.remove(&EntityKey::chat(EntityId::from("1")), ChangeOrigin::Mutation);

        assert!(store.chat(&EntityId::from("1")).is_none());
    }

    #[test]
    fn transaction_emits_one_change_set() {
        let store = EntityStore::new();
        let mut rx = store.changes();

        store.transaction(ChangeOrigin::Mutation, |txn| {
            txn.put(message("m-1", "7", "hi"));
            txn.put(chat("7", "bumped"));
        });

        let change = rx.try_recv().unwrap();
        assert_eq!(change.keys.len(), 2);
        assert_eq!(change.origin, ChangeOrigin::Mutation);
        assert!(rx.try_recv().is_err(), "expected exactly one notification");

        // Both sides of the batch are visible together.
        assert_eq!(store.messages_of(&EntityId::from("7")).len(), 1);
        assert_eq!(store.chat(&EntityId::from("7")).unwrap().title, "bumped");
    }

    #[test]
    fn last_write_in_batch_wins() {
        let store = EntityStore::new();
        store.transaction(ChangeOrigin::Fetch, |txn| {
            txn.put(chat("1", "first"));
            txn.put(chat("1", "second"));
        });

        assert_eq!(store.chat(&EntityId::from("1")).unwrap().title, "second");
    }

    #[test]
    fn empty_transaction_does_not_notify() {
        let store = EntityStore::new();
        let mut rx = store.changes();
        store.transaction(ChangeOrigin::Fetch, |_txn| {});
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn chat_list_prunes_stale_but_keeps_temp() {
        let store = EntityStore::new();
        store.put(chat("gone", "stale"), ChangeOrigin::Fetch);

        let draft = Chat::draft("optimistic");
        let draft_id = draft.id.clone();
        store.put(draft, ChangeOrigin::Mutation);

        store.apply_chat_list(vec![chat("1", "kept")]);

        assert!(store.chat(&EntityId::from("gone")).is_none());
        assert!(store.chat(&EntityId::from("1")).is_some());
        assert!(
            store.chat(&draft_id).is_some(),
            "list refresh must not wipe unconfirmed creates"
        );
    }

    #[test]
    fn message_list_prune_is_scoped_to_its_chat() {
        let store = EntityStore::new();
        store.put(message("m-1", "7", "one"), ChangeOrigin::Fetch);
        store.put(message("m-2", "8", "other chat"), ChangeOrigin::Fetch);

        store.apply_message_list(&EntityId::from("7"), vec![message("m-3", "7", "new")]);

        assert!(store.message(&EntityId::from("m-1")).is_none());
        assert!(store.message(&EntityId::from("m-2")).is_some());
        assert!(store.message(&EntityId::from("m-3")).is_some());
    }

    #[test]
    fn snapshots_are_ordered() {
        let store = EntityStore::new();
        let mut older = chat("1", "older");
        older.updated_at = Utc::now() - chrono::Duration::hours(1);
        store.transaction(ChangeOrigin::Fetch, |txn| {
            txn.put(older);
            txn.put(chat("2", "newer"));
        });

        let snap = store.chats_snapshot();
        assert_eq!(snap[0].title, "newer");
        assert_eq!(snap[1].title, "older");
    }
}

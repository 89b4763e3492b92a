// ── Push-event bridge ──
//
// Translates inbound push events into store writes. The bridge holds
// no entity state of its own: everything goes through the same
// `put`/`transaction` path the mutation coordinator uses, so a value
// that arrived over the channel is indistinguishable from one a local
// write produced.
//
// Delivery is at-least-once and gappy: the same event may arrive twice,
// and progress may jump straight to a terminal state. Merges are
// therefore idempotent (an unchanged value writes nothing) and
// monotonic (processing state never regresses).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use docsync_api::push::{PushChannel, PushEvent};
use docsync_api::types::{ChartDto, ChatDto, DocumentDto, MessageDto};

use crate::model::{Chart, Chat, Document, EntityId, EntityKey, Message, ProcessingState};
use crate::mutation::MutationCoordinator;
use crate::store::{ChangeOrigin, EntityStore, StoreEntity};

/// Applies push events to the [`EntityStore`].
#[derive(Clone)]
pub struct EventBridge {
    store: Arc<EntityStore>,
    mutations: Arc<MutationCoordinator>,
    push: Option<PushChannel>,
}

impl EventBridge {
    pub fn new(store: Arc<EntityStore>, mutations: Arc<MutationCoordinator>) -> Self {
        Self {
            store,
            mutations,
            push: None,
        }
    }

    /// Attach the push channel so the bridge can release subject
    /// interest once a document reaches a terminal processing state.
    pub fn with_push(mut self, push: PushChannel) -> Self {
        self.push = Some(push);
        self
    }

    /// Consume events until cancelled.
    pub fn spawn(
        &self,
        mut events: broadcast::Receiver<Arc<PushEvent>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    result = events.recv() => match result {
                        Ok(event) => bridge.apply(&event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "event bridge lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    /// Route a single event. Malformed or unknown events are logged and
    /// dropped; nothing here returns an error into the caller.
    pub fn apply(&self, event: &PushEvent) {
        match event.name.as_str() {
            "chat.created" | "chat.updated" => self.apply_chat(event),
            "chat.deleted" => self.apply_chat_deleted(event),
            "message.created" => self.apply_message(event),
            "chart.created" | "chart.updated" => self.apply_chart(event),
            "document.created" | "document.updated" => self.apply_document(event),
            "document.deleted" => self.apply_document_deleted(event),
            "document.processing.started" => {
                self.apply_processing(event, ProcessingState::Processing { percent: 0 });
            }
            "document.processing.progress" => {
                let percent = event
                    .payload
                    .get("percent")
                    .and_then(serde_json::Value::as_u64)
                    .map_or(0, |p| u8::try_from(p.min(100)).unwrap_or(100));
                self.apply_processing(event, ProcessingState::Processing { percent });
            }
            "document.processing.completed" => {
                self.apply_processing(event, ProcessingState::Ready);
            }
            "document.processing.failed" => {
                let reason = event
                    .payload
                    .get("reason")
                    .or_else(|| event.payload.get("error"))
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("processing failed")
                    .to_owned();
                self.apply_processing(event, ProcessingState::Failed { reason });
            }
            other => {
                tracing::debug!(event = other, "unroutable push event dropped");
            }
        }
    }

    // ── Entity upserts ───────────────────────────────────────────────

    /// Write only when the value actually differs, so redelivered
    /// events do not generate notification churn.
    fn put_if_changed<T: StoreEntity + PartialEq>(&self, entity: T) {
        let key = entity.key();
        let unchanged = T::get_from(&self.store, &key).is_some_and(|current| *current == entity);
        if !unchanged {
            self.store.put(entity, ChangeOrigin::Push);
        }
    }

    fn apply_chat(&self, event: &PushEvent) {
        match serde_json::from_value::<ChatDto>(event.payload.clone()) {
            Ok(dto) => self.put_if_changed(Chat::from(dto)),
            Err(e) => {
                tracing::debug!(event = %event.name, error = %e, "malformed push payload dropped");
            }
        }
    }

    fn apply_message(&self, event: &PushEvent) {
        match serde_json::from_value::<MessageDto>(event.payload.clone()) {
            Ok(dto) => self.put_if_changed(Message::from(dto)),
            Err(e) => {
                tracing::debug!(event = %event.name, error = %e, "malformed push payload dropped");
            }
        }
    }

    fn apply_chart(&self, event: &PushEvent) {
        match serde_json::from_value::<ChartDto>(event.payload.clone()) {
            Ok(dto) => self.put_if_changed(Chart::from(dto)),
            Err(e) => {
                tracing::debug!(event = %event.name, error = %e, "malformed push payload dropped");
            }
        }
    }

    fn apply_document(&self, event: &PushEvent) {
        match serde_json::from_value::<DocumentDto>(event.payload.clone()) {
            Ok(dto) => self.put_if_changed(Document::from(dto)),
            Err(e) => {
                tracing::debug!(event = %event.name, error = %e, "malformed push payload dropped");
            }
        }
    }

    // ── Removals ─────────────────────────────────────────────────────

    /// A deletion confirmed by the server wins over anything still in
    /// flight locally: pending writes on the chat and its children are
    /// superseded before the entries disappear in one cycle.
    fn apply_chat_deleted(&self, event: &PushEvent) {
        let Some(chat_id) = subject_entity_id(event) else {
            tracing::debug!(event = %event.name, "deletion event without id dropped");
            return;
        };

        let mut keys = vec![EntityKey::chat(chat_id.clone())];
        keys.extend(self.store.messages_of(&chat_id).iter().map(|m| m.key()));
        keys.extend(self.store.documents_of(&chat_id).iter().map(|d| d.key()));
        keys.extend(self.store.charts_of(&chat_id).iter().map(|c| c.key()));

        if self.store.chat(&chat_id).is_none() && keys.len() == 1 {
            return;
        }

        for key in &keys {
            self.mutations.supersede(key);
        }
        self.store.transaction(ChangeOrigin::Push, |txn| {
            for key in keys {
                txn.remove(key);
            }
        });
    }

    fn apply_document_deleted(&self, event: &PushEvent) {
        let Some(doc_id) = subject_entity_id(event) else {
            tracing::debug!(event = %event.name, "deletion event without id dropped");
            return;
        };
        let Some(doc) = self.store.document(&doc_id) else {
            return;
        };
        let key = doc.key();
        self.mutations.supersede(&key);
        self.store.remove(&key, ChangeOrigin::Push);
    }

    // ── Processing lifecycle ─────────────────────────────────────────

    fn apply_processing(&self, event: &PushEvent, incoming: ProcessingState) {
        let Some(doc_id) = subject_entity_id(event) else {
            tracing::debug!(event = %event.name, "processing event without subject dropped");
            return;
        };

        let Some(doc) = self.store.document(&doc_id) else {
            // First sight of this document: some events carry the full
            // record, in which case it can be admitted directly.
            match serde_json::from_value::<DocumentDto>(event.payload.clone()) {
                Ok(dto) => self.store.put(Document::from(dto), ChangeOrigin::Push),
                Err(_) => {
                    tracing::debug!(%doc_id, event = %event.name, "processing event for unknown document dropped");
                }
            }
            return;
        };

        let merged = ProcessingState::merge(&doc.processing, incoming);
        if merged == doc.processing {
            return;
        }

        let entered_terminal = merged.is_terminal();
        let mut next = (*doc).clone();
        next.processing = merged;
        if let Some(stamp) = payload_timestamp(event) {
            next.updated_at = stamp;
        } else {
            next.updated_at = Utc::now();
        }
        self.store.put(next, ChangeOrigin::Push);

        // The subject was joined once when the upload started; release
        // that interest exactly once, on the transition into a terminal
        // state (redeliveries merge to no change and never reach here).
        if entered_terminal {
            if let Some(push) = &self.push {
                push.leave_subject(doc_id.as_str());
            }
        }
    }
}

fn subject_entity_id(event: &PushEvent) -> Option<EntityId> {
    event
        .subject_id
        .clone()
        .or_else(|| {
            event
                .payload
                .get("id")
                .and_then(serde_json::Value::as_str)
                .map(String::from)
        })
        .map(EntityId::from)
}

fn payload_timestamp(event: &PushEvent) -> Option<DateTime<Utc>> {
    event
        .payload
        .get("updatedAt")
        .and_then(serde_json::Value::as_str)
        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
}

// ── Session facade ──
//
// The single entry point UI code holds. Owns the store, mutation
// coordinator, event bridge, query cache, API client, and push channel;
// exposes typed operations and subscriptions so consumers never touch
// the transport crates directly.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use docsync_api::push::{ChannelState, PushChannel};
use docsync_api::types::{CreateChatRequest, SendMessageRequest, UpdateChatRequest};
use docsync_api::{ApiClient, TransportConfig};

use crate::bridge::EventBridge;
use crate::config::SessionConfig;
use crate::error::SyncError;
use crate::model::{Chart, Chat, Document, EntityId, EntityKey, Message};
use crate::mutation::MutationCoordinator;
use crate::query::{Fetcher, QueryCache, QueryHandle, QueryKey};
use crate::store::{ChangeOrigin, EntityStore, StoreEntity};
use crate::stream::EntityStream;

/// One authenticated session against the Docsync service.
///
/// Cheaply cloneable via `Arc`. Constructed once per login and torn
/// down with [`disconnect`](Self::disconnect) on logout -- every piece
/// of cached state dies with it.
#[derive(Clone)]
pub struct SyncSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    api: ApiClient,
    push: PushChannel,
    store: Arc<EntityStore>,
    mutations: Arc<MutationCoordinator>,
    queries: QueryCache,
    bridge: EventBridge,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Production [`Fetcher`]: each query maps to one API call whose result
/// lands in the store as a fetch-originated batch.
struct ApiFetcher {
    api: ApiClient,
}

#[async_trait]
impl Fetcher for ApiFetcher {
    async fn fetch(&self, key: &QueryKey, store: &EntityStore) -> Result<(), SyncError> {
        match key {
            QueryKey::Chats => {
                let chats = self.api.list_chats().await?;
                store.apply_chat_list(chats.into_iter().map(Chat::from).collect());
            }
            QueryKey::Chat(id) => {
                let chat = self.api.get_chat(id.as_str()).await?;
                store.put(Chat::from(chat), ChangeOrigin::Fetch);
            }
            QueryKey::Document { chat, id } => {
                let doc = self.api.get_document(chat.as_str(), id.as_str()).await?;
                store.put(Document::from(doc), ChangeOrigin::Fetch);
            }
            QueryKey::Documents(chat_id) => {
                let docs = self.api.list_documents(chat_id.as_str()).await?;
                store.apply_document_list(chat_id, docs.into_iter().map(Document::from).collect());
            }
            QueryKey::Messages(chat_id) => {
                let messages = self.api.list_messages(chat_id.as_str()).await?;
                store.apply_message_list(
                    chat_id,
                    messages.into_iter().map(Message::from).collect(),
                );
            }
            QueryKey::Charts(chat_id) => {
                let charts = self.api.list_charts(chat_id.as_str()).await?;
                store.apply_chart_list(chat_id, charts.into_iter().map(Chart::from).collect());
            }
        }
        Ok(())
    }
}

impl SyncSession {
    /// Build a session from configuration. Does NOT touch the network --
    /// call [`connect`](Self::connect) to start syncing.
    pub fn new(config: SessionConfig) -> Result<Self, SyncError> {
        let transport = TransportConfig {
            timeout: config.request_timeout,
            ..TransportConfig::default()
        };
        let api = ApiClient::new(config.base_url.clone(), &config.token, &transport)?;
        let push = PushChannel::new(
            config.push_url()?,
            config.token.clone(),
            config.reconnect.clone(),
        );

        let store = Arc::new(EntityStore::new());
        let mutations = Arc::new(MutationCoordinator::new(Arc::clone(&store)));
        let queries = QueryCache::new(
            Arc::clone(&store),
            Arc::clone(&mutations),
            Arc::new(ApiFetcher { api: api.clone() }),
            config.stale_after,
        );
        let bridge =
            EventBridge::new(Arc::clone(&store), Arc::clone(&mutations)).with_push(push.clone());

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                api,
                push,
                store,
                mutations,
                queries,
                bridge,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Prime the chat list, open the push channel, and spawn the
    /// background tasks (query invalidation, event bridging).
    pub async fn connect(&self) -> Result<(), SyncError> {
        let inner = &self.inner;

        let chats = inner.api.list_chats().await?;
        inner
            .store
            .apply_chat_list(chats.into_iter().map(Chat::from).collect());

        let mut tasks = inner.tasks.lock().await;
        tasks.push(
            inner
                .queries
                .spawn_invalidation_task(inner.cancel.clone()),
        );

        if inner.config.push_enabled {
            inner.push.connect();
            tasks.push(
                inner
                    .bridge
                    .spawn(inner.push.subscribe(), inner.cancel.clone()),
            );
        }

        info!(chats = inner.store.chat_count(), "session connected");
        Ok(())
    }

    /// Cancel background tasks and close the push channel. In-flight
    /// writes still resolve to commit or rollback; queries stop
    /// refetching.
    pub async fn disconnect(&self) {
        self.inner.cancel.cancel();
        self.inner.push.shutdown();

        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        debug!("session disconnected");
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.inner.store
    }

    /// Push channel connection state.
    pub fn channel_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.push.state()
    }

    /// Writes currently awaiting a server response.
    pub fn pending_writes(&self) -> usize {
        self.inner.mutations.pending_len()
    }

    pub fn chats(&self) -> QueryHandle {
        self.inner.queries.subscribe(QueryKey::Chats)
    }

    pub fn messages(&self, chat_id: &EntityId) -> QueryHandle {
        self.inner
            .queries
            .subscribe(QueryKey::Messages(chat_id.clone()))
    }

    pub fn documents(&self, chat_id: &EntityId) -> QueryHandle {
        self.inner
            .queries
            .subscribe(QueryKey::Documents(chat_id.clone()))
    }

    pub fn document(&self, chat_id: &EntityId, id: &EntityId) -> QueryHandle {
        self.inner.queries.subscribe(QueryKey::Document {
            chat: chat_id.clone(),
            id: id.clone(),
        })
    }

    pub fn charts(&self, chat_id: &EntityId) -> QueryHandle {
        self.inner
            .queries
            .subscribe(QueryKey::Charts(chat_id.clone()))
    }

    /// Force a refetch of one query.
    pub fn refresh(&self, key: &QueryKey) {
        self.inner.queries.refresh(key);
    }

    pub fn subscribe_chats(&self) -> EntityStream<Chat> {
        self.inner.store.subscribe_chats()
    }

    pub fn subscribe_documents(&self) -> EntityStream<Document> {
        self.inner.store.subscribe_documents()
    }

    pub fn subscribe_messages(&self) -> EntityStream<Message> {
        self.inner.store.subscribe_messages()
    }

    pub fn subscribe_charts(&self) -> EntityStream<Chart> {
        self.inner.store.subscribe_charts()
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Create a chat. It appears immediately under a placeholder id,
    /// which the server id replaces on confirmation.
    pub async fn create_chat(&self, title: &str) -> Result<Arc<Chat>, SyncError> {
        let draft = Chat::draft(title);
        let key = draft.key();
        let api = self.inner.api.clone();
        let request = CreateChatRequest {
            title: title.to_owned(),
        };

        self.inner
            .mutations
            .mutate(
                key,
                move |_| draft,
                move || async move {
                    let dto = api.create_chat(&request).await?;
                    Ok(Chat::from(dto))
                },
            )
            .await
    }

    pub async fn rename_chat(&self, id: &EntityId, title: &str) -> Result<Arc<Chat>, SyncError> {
        let key = EntityKey::chat(id.clone());
        let api = self.inner.api.clone();
        let id_patch = id.clone();
        let id_remote = id.clone();
        let title_patch = title.to_owned();
        let title_remote = title.to_owned();

        self.inner
            .mutations
            .mutate(
                key,
                move |current: Option<Arc<Chat>>| match current {
                    Some(chat) => {
                        let mut next = (*chat).clone();
                        next.title = title_patch;
                        next.updated_at = Utc::now();
                        next
                    }
                    // Renaming a chat the cache has not seen yet: show
                    // something sensible until the server responds.
                    None => {
                        let now = Utc::now();
                        Chat {
                            id: id_patch,
                            title: title_patch,
                            starred: false,
                            created_at: now,
                            updated_at: now,
                        }
                    }
                },
                move || async move {
                    let dto = api
                        .update_chat(
                            id_remote.as_str(),
                            &UpdateChatRequest {
                                title: Some(title_remote),
                                starred: None,
                            },
                        )
                        .await?;
                    Ok(Chat::from(dto))
                },
            )
            .await
    }

    pub async fn star_chat(&self, id: &EntityId, starred: bool) -> Result<Arc<Chat>, SyncError> {
        let key = EntityKey::chat(id.clone());
        let api = self.inner.api.clone();
        let id_patch = id.clone();
        let id_remote = id.clone();

        self.inner
            .mutations
            .mutate(
                key,
                move |current: Option<Arc<Chat>>| match current {
                    Some(chat) => {
                        let mut next = (*chat).clone();
                        next.starred = starred;
                        next.updated_at = Utc::now();
                        next
                    }
                    None => {
                        let now = Utc::now();
                        Chat {
                            id: id_patch,
                            title: String::new(),
                            starred,
                            created_at: now,
                            updated_at: now,
                        }
                    }
                },
                move || async move {
                    let dto = api
                        .update_chat(
                            id_remote.as_str(),
                            &UpdateChatRequest {
                                title: None,
                                starred: Some(starred),
                            },
                        )
                        .await?;
                    Ok(Chat::from(dto))
                },
            )
            .await
    }

    /// Delete a chat. The entry disappears immediately; its children go
    /// with it once the server confirms.
    pub async fn delete_chat(&self, id: &EntityId) -> Result<(), SyncError> {
        let key = EntityKey::chat(id.clone());
        let api = self.inner.api.clone();
        let id_remote = id.clone();

        let result = self
            .inner
            .mutations
            .delete::<Chat, _, _>(key, move || async move {
                api.delete_chat(id_remote.as_str()).await?;
                Ok(())
            })
            .await;

        if result.is_ok() {
            let mut keys: Vec<EntityKey> = Vec::new();
            keys.extend(self.inner.store.messages_of(id).iter().map(|m| m.key()));
            keys.extend(self.inner.store.documents_of(id).iter().map(|d| d.key()));
            keys.extend(self.inner.store.charts_of(id).iter().map(|c| c.key()));
            if !keys.is_empty() {
                self.inner
                    .store
                    .transaction(ChangeOrigin::Mutation, |txn| {
                        for child in keys {
                            txn.remove(child);
                        }
                    });
            }
        }

        result
    }

    /// Delete a document from a chat.
    pub async fn delete_document(
        &self,
        chat_id: &EntityId,
        id: &EntityId,
    ) -> Result<(), SyncError> {
        let key = EntityKey::document(chat_id.clone(), id.clone());
        let api = self.inner.api.clone();
        let chat_remote = chat_id.clone();
        let id_remote = id.clone();

        self.inner
            .mutations
            .delete::<Document, _, _>(key, move || async move {
                api.delete_document(chat_remote.as_str(), id_remote.as_str())
                    .await?;
                Ok(())
            })
            .await
    }

    pub async fn send_message(
        &self,
        chat_id: &EntityId,
        body: &str,
    ) -> Result<Arc<Message>, SyncError> {
        let draft = Message::draft(chat_id.clone(), body);
        let key = draft.key();
        let api = self.inner.api.clone();
        let chat_remote = chat_id.clone();
        let request = SendMessageRequest {
            body: body.to_owned(),
        };

        self.inner
            .mutations
            .mutate(
                key,
                move |_| draft,
                move || async move {
                    let dto = api.send_message(chat_remote.as_str(), &request).await?;
                    Ok(Message::from(dto))
                },
            )
            .await
    }

    /// Upload a file into a chat. The document appears immediately as
    /// queued; transfer progress arrives through `progress`, and
    /// server-side processing updates flow in over the push channel
    /// until the document reaches a terminal state.
    pub async fn upload_document<F>(
        &self,
        chat_id: &EntityId,
        name: &str,
        bytes: Bytes,
        progress: F,
    ) -> Result<Arc<Document>, SyncError>
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        #[allow(clippy::as_conversions)]
        let size = bytes.len() as u64;
        let draft = Document::draft(chat_id.clone(), name, size);
        let key = draft.key();
        let api = self.inner.api.clone();
        let chat_remote = chat_id.clone();
        let name_remote = name.to_owned();

        let document = self
            .inner
            .mutations
            .mutate(
                key,
                move |_| draft,
                move || async move {
                    let dto = api
                        .upload_document(chat_remote.as_str(), &name_remote, bytes, progress)
                        .await?;
                    Ok(Document::from(dto))
                },
            )
            .await?;

        if self.inner.config.push_enabled && !document.processing.is_terminal() {
            self.inner.push.join_subject(document.id.as_str());
        }

        Ok(document)
    }
}

//! Client-side entity synchronization engine for Docsync UIs.
//!
//! This crate owns the cache, write coordination, and push-event
//! reconciliation between `docsync-api` and rendering layers:
//!
//! - **[`SyncSession`]** — Central facade managing the full lifecycle:
//!   [`connect()`](SyncSession::connect) primes the cache and spawns
//!   background tasks; domain operations (create/rename/star/delete
//!   chat, send message, upload document) and read subscriptions hang
//!   off it. UI code holds a session and nothing else.
//!
//! - **[`EntityStore`]** — The single shared mutable resource. Keyed,
//!   in-memory, reactive (`DashMap` + `tokio::sync::watch` snapshots).
//!   Batched writes notify subscribers exactly once per transaction.
//!
//! - **[`MutationCoordinator`]** — Optimistic writes: speculative value
//!   applied before the request leaves, server result reconciled on
//!   success, snapshot restored on failure, with per-key supersede
//!   semantics for overlapping writes.
//!
//! - **[`EventBridge`]** — Applies push events (entity updates,
//!   deletions, document-processing progress) to the store through the
//!   same write path mutations use, idempotently and monotonically.
//!
//! - **[`QueryCache`]** — The read side: per-key fetch state
//!   (absent/fetching/fresh/stale, error-with-last-value), staleness-
//!   and invalidation-driven background refetches, one in-flight fetch
//!   per key shared by all subscribers.
//!
//! - **Domain model** ([`model`]) — `Chat`, `Document`, `Message`,
//!   `Chart` with [`EntityId`] placeholder/server id semantics.

pub mod bridge;
pub mod config;
pub mod error;
pub mod model;
pub mod mutation;
pub mod query;
pub mod session;
pub mod store;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bridge::EventBridge;
pub use config::SessionConfig;
pub use error::SyncError;
pub use mutation::{MutationCoordinator, MutationStatus};
pub use query::{FetchPhase, Fetcher, QueryCache, QueryHandle, QueryKey, QueryState};
pub use session::SyncSession;
pub use store::{ChangeOrigin, ChangeSet, EntityStore, StoreEntity};
pub use stream::EntityStream;

// Re-export model types at the crate root for ergonomics.
pub use model::{Chart, Chat, Document, EntityId, EntityKey, EntityKind, Message, ProcessingState, Role};

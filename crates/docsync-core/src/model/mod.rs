// ── Domain model ──
//
// Canonical client-side entity types. Wire DTOs from `docsync-api`
// convert into these via `From`; nothing downstream of this module
// touches raw API shapes.

pub mod chart;
pub mod chat;
pub mod document;
pub mod entity_id;
pub mod message;

pub use chart::Chart;
pub use chat::Chat;
pub use document::{Document, ProcessingState};
pub use entity_id::{EntityId, EntityKey, EntityKind};
pub use message::{Message, Role};

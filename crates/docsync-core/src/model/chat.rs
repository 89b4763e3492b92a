use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docsync_api::types::ChatDto;

use super::entity_id::EntityId;

/// A conversation, the root entity that owns documents, messages, and
/// charts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: EntityId,
    pub title: String,
    pub starred: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    /// A locally created chat awaiting server confirmation. Timestamps
    /// are provisional and replaced by the server's on commit.
    pub fn draft(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::temp(),
            title: title.into(),
            starred: false,
            created_at: now,
            updated_at: now,
        }
    }
}

impl From<ChatDto> for Chat {
    fn from(dto: ChatDto) -> Self {
        Self {
            id: EntityId::Server(dto.id),
            title: dto.title,
            starred: dto.starred,
            created_at: dto.created_at,
            updated_at: dto.updated_at,
        }
    }
}

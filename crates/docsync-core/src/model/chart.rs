use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docsync_api::types::ChartDto;

use super::entity_id::EntityId;

/// A visualization produced by the analysis backend for a chat.
///
/// The `spec` is an opaque JSON document interpreted by the rendering
/// layer; the cache only tracks identity and freshness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub id: EntityId,
    pub chat_id: EntityId,
    pub title: String,
    pub spec: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl From<ChartDto> for Chart {
    fn from(dto: ChartDto) -> Self {
        Self {
            id: EntityId::Server(dto.id),
            chat_id: EntityId::Server(dto.chat_id),
            title: dto.title,
            spec: dto.spec,
            updated_at: dto.updated_at,
        }
    }
}

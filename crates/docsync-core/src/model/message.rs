use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docsync_api::types::MessageDto;

use super::entity_id::EntityId;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A single turn in a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: EntityId,
    pub chat_id: EntityId,
    pub role: Role,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A locally authored message awaiting server confirmation.
    pub fn draft(chat_id: EntityId, body: impl Into<String>) -> Self {
        Self {
            id: EntityId::temp(),
            chat_id,
            role: Role::User,
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

impl From<MessageDto> for Message {
    fn from(dto: MessageDto) -> Self {
        let role = match dto.role.as_str() {
            "assistant" => Role::Assistant,
            "system" => Role::System,
            // Unknown roles render as user turns rather than vanishing
            _ => Role::User,
        };
        Self {
            id: EntityId::Server(dto.id),
            chat_id: EntityId::Server(dto.chat_id),
            role,
            body: dto.body,
            created_at: dto.created_at,
        }
    }
}

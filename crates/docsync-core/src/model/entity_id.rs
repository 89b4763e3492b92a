// ── Core identity types ──
//
// EntityId, EntityKind, and EntityKey form the foundation of every
// domain type and of cache addressing. An id is either server-assigned
// or a client-generated placeholder that exists only between an
// optimistic create and its server confirmation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Prefix that marks client-generated placeholder ids. The server never
/// issues ids of this shape.
const TEMP_PREFIX: &str = "temp-";

// ── EntityId ────────────────────────────────────────────────────────

/// Canonical identifier for any Docsync entity.
///
/// `Server` ids come from the API and are stable. `Temp` ids are minted
/// locally for optimistic creates and are replaced by the server id
/// when the create is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityId {
    Server(String),
    Temp(String),
}

impl EntityId {
    /// Mint a fresh placeholder id.
    pub fn temp() -> Self {
        Self::Temp(format!("{TEMP_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, Self::Temp(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Server(s) | Self::Temp(s) => s,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_owned()))
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        if s.starts_with(TEMP_PREFIX) {
            Self::Temp(s)
        } else {
            Self::Server(s)
        }
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::from(s.to_owned())
    }
}

// On the wire an id is a plain string; the Server/Temp split is a
// client-side concern recovered from the prefix.
impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s))
    }
}

// ── EntityKind ──────────────────────────────────────────────────────

/// The entity types the cache knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Chat,
    Document,
    Message,
    Chart,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Chat => "chat",
            Self::Document => "document",
            Self::Message => "message",
            Self::Chart => "chart",
        };
        write!(f, "{name}")
    }
}

// ── EntityKey ───────────────────────────────────────────────────────

/// Cache address of a single entity: kind + id, plus the owning chat id
/// for child collections (documents, messages, charts).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: EntityId,
    pub parent: Option<EntityId>,
}

impl EntityKey {
    pub fn chat(id: EntityId) -> Self {
        Self {
            kind: EntityKind::Chat,
            id,
            parent: None,
        }
    }

    pub fn document(chat_id: EntityId, id: EntityId) -> Self {
        Self {
            kind: EntityKind::Document,
            id,
            parent: Some(chat_id),
        }
    }

    pub fn message(chat_id: EntityId, id: EntityId) -> Self {
        Self {
            kind: EntityKind::Message,
            id,
            parent: Some(chat_id),
        }
    }

    pub fn chart(chat_id: EntityId, id: EntityId) -> Self {
        Self {
            kind: EntityKind::Chart,
            id,
            parent: Some(chat_id),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{}:{}/{}", self.kind, parent, self.id),
            None => write!(f, "{}:{}", self.kind, self.id),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn server_id_from_plain_string() {
        let id = EntityId::from("42");
        assert!(!id.is_temp());
        assert_eq!(id.as_str(), "42");
    }

    #[test]
    fn temp_id_round_trips_through_string() {
        let id = EntityId::temp();
        assert!(id.is_temp());
        let parsed = EntityId::from(id.as_str());
        assert!(parsed.is_temp());
        assert_eq!(parsed, id);
    }

    #[test]
    fn temp_ids_are_unique() {
        assert_ne!(EntityId::temp(), EntityId::temp());
    }

    #[test]
    fn entity_id_serializes_as_plain_string() {
        let id = EntityId::from("42");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""42""#);

        let back: EntityId = serde_json::from_str(r#""temp-abc""#).unwrap();
        assert!(back.is_temp());
    }

    #[test]
    fn key_display_includes_parent() {
        let key = EntityKey::message(EntityId::from("7"), EntityId::from("m-1"));
        assert_eq!(key.to_string(), "message:7/m-1");

        let key = EntityKey::chat(EntityId::from("7"));
        assert_eq!(key.to_string(), "chat:7");
    }
}

//! Wire types for the Docsync HTTP API.
//!
//! These mirror the server's JSON shapes exactly (camelCase fields,
//! server-assigned ids and timestamps). `docsync-core` converts them
//! into its domain model; nothing in this module is meant for direct
//! consumption by UI code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Response envelope ────────────────────────────────────────────────

/// Every successful response has the shape `{ "data": ... }`.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    pub data: T,
}

/// Error responses have the shape `{ "error": { "message", "code" } }`.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

// ── Chats ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDto {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub starred: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatRequest {
    pub title: String,
}

/// Partial update -- `None` fields are omitted from the request body.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starred: Option<bool>,
}

// ── Messages ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub id: String,
    pub chat_id: String,
    pub role: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub body: String,
}

// ── Documents ────────────────────────────────────────────────────────

/// An uploaded file and its server-side processing lifecycle.
///
/// `status` is one of `"queued"`, `"processing"`, `"ready"`, `"failed"`;
/// `progress` accompanies `"processing"`, `error` accompanies `"failed"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDto {
    pub id: String,
    pub chat_id: String,
    pub name: String,
    #[serde(default)]
    pub size_bytes: u64,
    pub status: String,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ── Charts ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartDto {
    pub id: String,
    pub chat_id: String,
    pub title: String,
    /// Opaque chart specification, rendered client-side.
    pub spec: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_chat_dto() {
        let json = r#"{
            "id": "42",
            "title": "Q3 report",
            "starred": true,
            "createdAt": "2026-03-01T10:00:00Z",
            "updatedAt": "2026-03-02T11:30:00Z"
        }"#;
        let chat: ChatDto = serde_json::from_str(json).expect("valid chat");
        assert_eq!(chat.id, "42");
        assert!(chat.starred);
    }

    #[test]
    fn starred_defaults_to_false() {
        let json = r#"{
            "id": "7",
            "title": "untitled",
            "createdAt": "2026-03-01T10:00:00Z",
            "updatedAt": "2026-03-01T10:00:00Z"
        }"#;
        let chat: ChatDto = serde_json::from_str(json).expect("valid chat");
        assert!(!chat.starred);
    }

    #[test]
    fn update_request_omits_unset_fields() {
        let req = UpdateChatRequest {
            title: None,
            starred: Some(true),
        };
        let json = serde_json::to_string(&req).expect("serializes");
        assert_eq!(json, r#"{"starred":true}"#);
    }

    #[test]
    fn deserialize_document_with_progress() {
        let json = r#"{
            "id": "doc-1",
            "chatId": "42",
            "name": "report.pdf",
            "sizeBytes": 10240,
            "status": "processing",
            "progress": 40,
            "updatedAt": "2026-03-01T10:00:00Z"
        }"#;
        let doc: DocumentDto = serde_json::from_str(json).expect("valid document");
        assert_eq!(doc.status, "processing");
        assert_eq!(doc.progress, Some(40));
        assert!(doc.error.is_none());
    }
}

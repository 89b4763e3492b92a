#![allow(clippy::unwrap_used)]
// Integration tests for `ApiClient` using wiremock.

use std::sync::{Arc, Mutex};

use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use docsync_api::types::{CreateChatRequest, SendMessageRequest, UpdateChatRequest};
use docsync_api::{ApiClient, Error};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, ApiClient) {
    let server = MockServer::start().await;
    let base_url = Url::parse(&server.uri()).unwrap();
    let client = ApiClient::with_client(reqwest::Client::new(), base_url);
    (server, client)
}

fn chat_json(id: &str, title: &str) -> serde_json::Value {
    json!({
        "id": id,
        "title": title,
        "starred": false,
        "createdAt": "2026-03-01T10:00:00Z",
        "updatedAt": "2026-03-01T10:00:00Z"
    })
}

// ── Chat tests ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_list_chats() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/chats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [chat_json("1", "Quarterly numbers"), chat_json("2", "Contract review")]
        })))
        .mount(&server)
        .await;

    let chats = client.list_chats().await.unwrap();

    assert_eq!(chats.len(), 2);
    assert_eq!(chats[0].id, "1");
    assert_eq!(chats[1].title, "Contract review");
}

#[tokio::test]
async fn test_create_chat_sends_title() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/v1/chats"))
        .and(body_json(json!({ "title": "New analysis" })))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({ "data": chat_json("42", "New analysis") })),
        )
        .mount(&server)
        .await;

    let chat = client
        .create_chat(&CreateChatRequest {
            title: "New analysis".into(),
        })
        .await
        .unwrap();

    assert_eq!(chat.id, "42");
}

#[tokio::test]
async fn test_update_chat_partial_body() {
    let (server, client) = setup().await;

    Mock::given(method("PATCH"))
        .and(path("/v1/chats/42"))
        .and(body_json(json!({ "starred": true })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": chat_json("42", "kept") })),
        )
        .mount(&server)
        .await;

    let result = client
        .update_chat(
            "42",
            &UpdateChatRequest {
                title: None,
                starred: Some(true),
            },
        )
        .await;

    assert!(result.is_ok());
}

#[tokio::test]
async fn test_delete_chat() {
    let (server, client) = setup().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/chats/42"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    client.delete_chat("42").await.unwrap();
}

// ── Error mapping tests ─────────────────────────────────────────────

#[tokio::test]
async fn test_validation_error_parses_envelope() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/v1/chats"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "error": { "message": "title must not be empty", "code": "chat.title.empty" }
        })))
        .mount(&server)
        .await;

    let result = client
        .create_chat(&CreateChatRequest { title: String::new() })
        .await;

    match result {
        Err(Error::Api {
            message,
            code,
            status,
        }) => {
            assert_eq!(status, 422);
            assert_eq!(code.as_deref(), Some("chat.title.empty"));
            assert_eq!(message, "title must not be empty");
        }
        other => panic!("expected Api error, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_expired_session_maps_to_session_expired() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/chats"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let result = client.list_chats().await;
    assert!(matches!(result, Err(Error::SessionExpired)));
}

#[tokio::test]
async fn test_non_envelope_error_body_is_preserved() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/chats"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    match client.list_chats().await {
        Err(Error::Api {
            message, status, ..
        }) => {
            assert_eq!(status, 502);
            assert_eq!(message, "bad gateway");
        }
        other => panic!("expected Api error, got: {other:?}"),
    }
}

// ── Message tests ───────────────────────────────────────────────────

#[tokio::test]
async fn test_send_message() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/v1/chats/42/messages"))
        .and(body_json(json!({ "body": "summarize page 3" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "data": {
                "id": "m-1",
                "chatId": "42",
                "role": "user",
                "body": "summarize page 3",
                "createdAt": "2026-03-01T10:05:00Z"
            }
        })))
        .mount(&server)
        .await;

    let message = client
        .send_message(
            "42",
            &SendMessageRequest {
                body: "summarize page 3".into(),
            },
        )
        .await
        .unwrap();

    assert_eq!(message.id, "m-1");
    assert_eq!(message.role, "user");
}

// ── Upload tests ────────────────────────────────────────────────────

#[tokio::test]
async fn test_upload_reports_progress_and_returns_document() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/v1/chats/42/documents"))
        .and(query_param("name", "report.pdf"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "data": {
                "id": "doc-9",
                "chatId": "42",
                "name": "report.pdf",
                "sizeBytes": 200_000,
                "status": "queued",
                "updatedAt": "2026-03-01T10:00:00Z"
            }
        })))
        .mount(&server)
        .await;

    let calls: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&calls);

    // 200 KB -> several 64 KB chunks, so progress fires more than once.
    let payload = bytes::Bytes::from(vec![0_u8; 200_000]);
    let document = client
        .upload_document("42", "report.pdf", payload, move |sent, total| {
            recorded.lock().unwrap().push((sent, total));
        })
        .await
        .unwrap();

    assert_eq!(document.id, "doc-9");
    assert_eq!(document.status, "queued");

    let calls = calls.lock().unwrap();
    assert!(calls.len() > 1, "expected chunked progress, got {calls:?}");
    assert_eq!(calls.last().copied(), Some((200_000, 200_000)));
    // Monotonic non-decreasing byte counts
    assert!(calls.windows(2).all(|w| w[0].0 <= w[1].0));
}

//! HTTP client for the Docsync API.
//!
//! Thin, typed wrapper over `reqwest`. All responses share the
//! `{ "data": ... }` envelope; errors are parsed from the
//! `{ "error": { "message", "code" } }` envelope into [`Error::Api`].
//! The session token travels as a default `Authorization` header set at
//! construction time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use secrecy::SecretString;
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;
use crate::types::{
    ChartDto, ChatDto, CreateChatRequest, DocumentDto, Envelope, ErrorEnvelope, MessageDto,
    SendMessageRequest, UpdateChatRequest,
};

/// Upload chunk size. Small enough for useful progress granularity,
/// large enough to keep syscall overhead negligible.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Async client for the Docsync HTTP API.
///
/// Cheaply cloneable -- `reqwest::Client` is an `Arc` internally.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a client that authenticates every request with the given
    /// session token.
    pub fn new(
        base_url: Url,
        token: &SecretString,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client_with_token(token)?;
        Ok(Self { http, base_url })
    }

    /// Construct from a pre-built `reqwest::Client` (used by tests).
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(path)?)
    }

    // ── Request helpers ──────────────────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let url = self.endpoint(path)?;
        let resp = self.http.get(url).send().await?;
        self.handle_response(resp).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        let url = self.endpoint(path)?;
        let resp = self.http.post(url).json(body).send().await?;
        self.handle_response(resp).await
    }

    async fn patch<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        let url = self.endpoint(path)?;
        let resp = self.http.patch(url).json(body).send().await?;
        self.handle_response(resp).await
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        let url = self.endpoint(path)?;
        let resp = self.http.delete(url).send().await?;
        self.handle_empty(resp).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        resp: reqwest::Response,
    ) -> Result<T, Error> {
        let status = resp.status();
        if !status.is_success() {
            return Err(self.parse_error(status, resp).await);
        }

        let body = resp.text().await?;
        let envelope: Envelope<T> =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body,
            })?;
        Ok(envelope.data)
    }

    async fn handle_empty(&self, resp: reqwest::Response) -> Result<(), Error> {
        let status = resp.status();
        if !status.is_success() {
            return Err(self.parse_error(status, resp).await);
        }
        Ok(())
    }

    async fn parse_error(&self, status: reqwest::StatusCode, resp: reqwest::Response) -> Error {
        let body = resp.text().await.unwrap_or_default();

        match status.as_u16() {
            401 => return Error::SessionExpired,
            403 => {
                return Error::Authentication {
                    message: "session token rejected".into(),
                };
            }
            _ => {}
        }

        match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => Error::Api {
                message: envelope.error.message,
                code: envelope.error.code,
                status: status.as_u16(),
            },
            Err(_) => Error::Api {
                message: if body.is_empty() {
                    status.to_string()
                } else {
                    body
                },
                code: None,
                status: status.as_u16(),
            },
        }
    }

    // ── Chats ────────────────────────────────────────────────────────

    pub async fn list_chats(&self) -> Result<Vec<ChatDto>, Error> {
        self.get("v1/chats").await
    }

    pub async fn get_chat(&self, id: &str) -> Result<ChatDto, Error> {
        self.get(&format!("v1/chats/{id}")).await
    }

    pub async fn create_chat(&self, req: &CreateChatRequest) -> Result<ChatDto, Error> {
        self.post("v1/chats", req).await
    }

    pub async fn update_chat(&self, id: &str, req: &UpdateChatRequest) -> Result<ChatDto, Error> {
        self.patch(&format!("v1/chats/{id}"), req).await
    }

    pub async fn delete_chat(&self, id: &str) -> Result<(), Error> {
        self.delete(&format!("v1/chats/{id}")).await
    }

    // ── Messages ─────────────────────────────────────────────────────

    pub async fn list_messages(&self, chat_id: &str) -> Result<Vec<MessageDto>, Error> {
        self.get(&format!("v1/chats/{chat_id}/messages")).await
    }

    pub async fn send_message(
        &self,
        chat_id: &str,
        req: &SendMessageRequest,
    ) -> Result<MessageDto, Error> {
        self.post(&format!("v1/chats/{chat_id}/messages"), req).await
    }

    // ── Documents ────────────────────────────────────────────────────

    pub async fn list_documents(&self, chat_id: &str) -> Result<Vec<DocumentDto>, Error> {
        self.get(&format!("v1/chats/{chat_id}/documents")).await
    }

    pub async fn get_document(&self, chat_id: &str, id: &str) -> Result<DocumentDto, Error> {
        self.get(&format!("v1/chats/{chat_id}/documents/{id}")).await
    }

    pub async fn delete_document(&self, chat_id: &str, id: &str) -> Result<(), Error> {
        self.delete(&format!("v1/chats/{chat_id}/documents/{id}"))
            .await
    }

    /// Upload a file into a chat, streaming the body in chunks.
    ///
    /// `progress` is invoked with `(bytes_sent, bytes_total)` as each
    /// chunk is handed to the transport -- the final call is
    /// `(total, total)` before the server response arrives. Server-side
    /// processing is reported separately, through the push channel.
    pub async fn upload_document<F>(
        &self,
        chat_id: &str,
        file_name: &str,
        bytes: Bytes,
        progress: F,
    ) -> Result<DocumentDto, Error>
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        let mut url = self.endpoint(&format!("v1/chats/{chat_id}/documents"))?;
        url.query_pairs_mut().append_pair("name", file_name);

        let total = bytes.len() as u64;
        let sent = Arc::new(AtomicU64::new(0));
        let progress = Arc::new(progress);

        let chunks: Vec<Bytes> = (0..bytes.len())
            .step_by(UPLOAD_CHUNK_SIZE)
            .map(|start| {
                let end = (start + UPLOAD_CHUNK_SIZE).min(bytes.len());
                bytes.slice(start..end)
            })
            .collect();

        let stream = futures_util::stream::iter(chunks.into_iter().map(move |chunk| {
            let so_far =
                sent.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
            progress(so_far, total);
            Ok::<Bytes, std::io::Error>(chunk)
        }));

        let resp = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;

        self.handle_response(resp).await
    }

    // ── Charts ───────────────────────────────────────────────────────

    pub async fn list_charts(&self, chat_id: &str) -> Result<Vec<ChartDto>, Error> {
        self.get(&format!("v1/chats/{chat_id}/charts")).await
    }
}

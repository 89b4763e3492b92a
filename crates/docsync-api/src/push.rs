//! Push-event channel with auto-reconnect.
//!
//! Maintains a persistent WebSocket to the Docsync event endpoint and
//! fans inbound [`PushEvent`]s out through a [`tokio::sync::broadcast`]
//! channel plus a named-handler registry. Reconnection uses exponential
//! backoff with jitter and a bounded retry count; exhausting the budget
//! parks the channel in [`ChannelState::Failed`] without touching the
//! rest of the process.
//!
//! Server-side event delivery is scoped by *subject* (e.g. a document
//! being processed). Subject interest is reference-counted: the wire
//! join frame goes out on the first interested party, the leave frame
//! on the last, and live subjects are re-joined after every reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{Sink, SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;

// ── Broadcast channel capacity ───────────────────────────────────────

const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ── PushEvent ────────────────────────────────────────────────────────

/// A parsed event from the push channel.
///
/// Frames have the shape
/// `{ "event": "document.processing.progress", "subject": "doc-1", "payload": {...} }`.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    /// Event name, e.g. `"chat.updated"`, `"document.processing.completed"`.
    #[serde(rename = "event")]
    pub name: String,

    /// Subject id the event pertains to, if scoped.
    #[serde(default, rename = "subject")]
    pub subject_id: Option<String>,

    /// Event-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for channel reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before the channel gives up and
    /// reports [`ChannelState::Failed`].
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 8,
        }
    }
}

// ── ChannelState ─────────────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

// ── Handler registry ─────────────────────────────────────────────────

type Handler = Arc<dyn Fn(&PushEvent) + Send + Sync>;

/// Publish/subscribe registry keyed by event name.
///
/// Handlers for a name run in registration order. Handlers must not
/// block: they run on the dispatch task shared by all subscribers.
#[derive(Default)]
struct EventRouter {
    handlers: DashMap<String, Vec<(u64, Handler)>>,
    next_id: AtomicU64,
}

impl EventRouter {
    fn register(&self, name: &str, handler: Handler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entry(name.to_owned())
            .or_default()
            .push((id, handler));
        id
    }

    fn deregister(&self, name: &str, id: u64) {
        if let Some(mut entry) = self.handlers.get_mut(name) {
            entry.retain(|(registered, _)| *registered != id);
        }
    }

    fn dispatch(&self, event: &PushEvent) {
        // Clone handlers out of the map so one may unsubscribe itself
        // mid-dispatch without holding a shard lock.
        let handlers: Vec<Handler> = match self.handlers.get(&event.name) {
            Some(entry) => entry.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };
        for handler in handlers {
            handler(event);
        }
    }
}

/// Registration handle returned by [`PushChannel::on`].
///
/// [`unsubscribe`](Self::unsubscribe) is idempotent and also fires on
/// drop.
pub struct HandlerGuard {
    router: Arc<EventRouter>,
    name: String,
    id: u64,
    active: AtomicBool,
}

impl HandlerGuard {
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.router.deregister(&self.name, self.id);
        }
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ── PushChannel ──────────────────────────────────────────────────────

enum SubjectCommand {
    Join(String),
    Leave(String),
}

/// Handle to the push-event channel.
///
/// Cheaply cloneable. [`connect`](Self::connect) is idempotent; a
/// channel instance connects at most once and is torn down with
/// [`shutdown`](Self::shutdown) -- a new session builds a new channel.
#[derive(Clone)]
pub struct PushChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    url: Url,
    token: SecretString,
    reconnect: ReconnectConfig,
    state: watch::Sender<ChannelState>,
    event_tx: broadcast::Sender<Arc<PushEvent>>,
    router: Arc<EventRouter>,
    /// Subject id -> number of interested parties.
    subjects: DashMap<String, usize>,
    cmd_tx: mpsc::UnboundedSender<SubjectCommand>,
    cmd_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SubjectCommand>>>,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl ChannelInner {
    fn watched_subjects(&self) -> Vec<String> {
        self.subjects.iter().map(|r| r.key().clone()).collect()
    }
}

impl PushChannel {
    pub fn new(url: Url, token: SecretString, reconnect: ReconnectConfig) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(ChannelInner {
                url,
                token,
                reconnect,
                state,
                event_tx,
                router: Arc::new(EventRouter::default()),
                subjects: DashMap::new(),
                cmd_tx,
                cmd_rx: std::sync::Mutex::new(Some(cmd_rx)),
                cancel: CancellationToken::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the connection loop and the handler-dispatch task.
    ///
    /// Idempotent -- calling while a loop is already alive is a no-op.
    pub fn connect(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let cmd_rx = self
            .inner
            .cmd_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        let Some(cmd_rx) = cmd_rx else {
            return;
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            ws_loop(&inner, cmd_rx).await;
        });

        let router = Arc::clone(&self.inner.router);
        let mut event_rx = self.inner.event_tx.subscribe();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    result = event_rx.recv() => match result {
                        Ok(event) => router.dispatch(&event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "push dispatch lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Signal the background tasks to shut down gracefully.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Subscribe to connection state changes.
    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Get a new broadcast receiver for the raw event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PushEvent>> {
        self.inner.event_tx.subscribe()
    }

    /// Register a handler for a named event.
    ///
    /// Multiple handlers per name are invoked in registration order.
    pub fn on<F>(&self, event_name: &str, handler: F) -> HandlerGuard
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let id = self.inner.router.register(event_name, Arc::new(handler));
        HandlerGuard {
            router: Arc::clone(&self.inner.router),
            name: event_name.to_owned(),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Declare interest in a subject. The wire join frame is sent only
    /// on the first interested party.
    pub fn join_subject(&self, subject_id: &str) {
        let mut first = false;
        self.inner
            .subjects
            .entry(subject_id.to_owned())
            .and_modify(|count| *count += 1)
            .or_insert_with(|| {
                first = true;
                1
            });
        if first {
            let _ = self
                .inner
                .cmd_tx
                .send(SubjectCommand::Join(subject_id.to_owned()));
        }
    }

    /// Release interest in a subject. The wire leave frame is sent only
    /// when the last interested party releases.
    pub fn leave_subject(&self, subject_id: &str) {
        let mut last = false;
        if let Some(mut entry) = self.inner.subjects.get_mut(subject_id) {
            *entry = entry.saturating_sub(1);
            last = *entry == 0;
        }
        if last {
            self.inner.subjects.remove_if(subject_id, |_, count| *count == 0);
            let _ = self
                .inner
                .cmd_tx
                .send(SubjectCommand::Leave(subject_id.to_owned()));
        }
    }

    /// Current number of interested parties for a subject.
    pub fn subject_watchers(&self, subject_id: &str) -> usize {
        self.inner.subjects.get(subject_id).map_or(0, |r| *r)
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// Main loop: connect -> read -> on error, backoff -> reconnect.
async fn ws_loop(inner: &Arc<ChannelInner>, mut cmd_rx: mpsc::UnboundedReceiver<SubjectCommand>) {
    let mut attempt: u32 = 0;

    loop {
        let _ = inner.state.send(if attempt == 0 {
            ChannelState::Connecting
        } else {
            ChannelState::Reconnecting { attempt }
        });

        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            result = connect_and_read(inner, &mut cmd_rx) => {
                match result {
                    // Clean disconnect (server close frame or stream ended).
                    // Reset the attempt counter and reconnect immediately.
                    Ok(()) => {
                        tracing::info!("push channel disconnected cleanly, reconnecting");
                        attempt = 0;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempt, "push channel error");

                        if attempt >= inner.reconnect.max_retries {
                            tracing::error!(
                                max_retries = inner.reconnect.max_retries,
                                "push channel reconnection limit reached, giving up"
                            );
                            let _ = inner.state.send(ChannelState::Failed);
                            return;
                        }

                        let delay = backoff_delay(attempt, &inner.reconnect);
                        tokio::select! {
                            biased;
                            () = inner.cancel.cancelled() => break,
                            () = tokio::time::sleep(delay) => {}
                        }

                        attempt += 1;
                    }
                }
            }
        }
    }

    let _ = inner.state.send(ChannelState::Disconnected);
    tracing::debug!("push channel loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Establish one WebSocket connection, re-join live subjects, then read
/// frames and relay subject commands until the connection drops.
async fn connect_and_read(
    inner: &ChannelInner,
    cmd_rx: &mut mpsc::UnboundedReceiver<SubjectCommand>,
) -> Result<(), Error> {
    tracing::info!(url = %inner.url, "connecting push channel");

    let uri: tungstenite::http::Uri = inner
        .url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::ChannelConnect(e.to_string()))?;

    let request = ClientRequestBuilder::new(uri).with_header(
        "Authorization",
        format!("Bearer {}", inner.token.expose_secret()),
    );

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::ChannelConnect(e.to_string()))?;

    tracing::info!("push channel connected");
    let _ = inner.state.send(ChannelState::Connected);

    let (mut write, mut read) = ws_stream.split();

    for subject in inner.watched_subjects() {
        send_subject_frame(&mut write, "join", &subject).await?;
    }

    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => return Ok(()),
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SubjectCommand::Join(id)) => {
                        send_subject_frame(&mut write, "join", &id).await?;
                    }
                    Some(SubjectCommand::Leave(id)) => {
                        send_subject_frame(&mut write, "leave", &id).await?;
                    }
                    None => return Ok(()),
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        parse_and_broadcast(&text, &inner.event_tx);
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite answers pongs automatically
                        tracing::trace!("push channel ping");
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(
                                code = %cf.code,
                                reason = %cf.reason,
                                "push channel close frame received"
                            );
                        } else {
                            tracing::info!("push channel close frame received (no payload)");
                        }
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        return Err(Error::ChannelConnect(e.to_string()));
                    }
                    None => {
                        tracing::info!("push channel stream ended");
                        return Ok(());
                    }
                    _ => {
                        // Binary, Pong, Frame -- ignore
                    }
                }
            }
        }
    }
}

async fn send_subject_frame<S>(write: &mut S, action: &str, subject_id: &str) -> Result<(), Error>
where
    S: Sink<tungstenite::Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let frame = serde_json::json!({ "action": action, "subject": subject_id }).to_string();
    write
        .send(tungstenite::Message::Text(frame.into()))
        .await
        .map_err(|e| Error::ChannelConnect(e.to_string()))
}

// ── Frame parsing ────────────────────────────────────────────────────

/// Parse a text frame and broadcast the event. Malformed or unnamed
/// frames are logged and dropped; they never reach subscribers.
fn parse_and_broadcast(text: &str, event_tx: &broadcast::Sender<Arc<PushEvent>>) {
    match serde_json::from_str::<PushEvent>(text) {
        Ok(event) if event.name.is_empty() => {
            tracing::debug!("dropping push frame with empty event name");
        }
        Ok(event) => {
            // Send errors just mean no active subscribers right now
            let _ = event_tx.send(Arc::new(event));
        }
        Err(e) => {
            tracing::debug!(error = %e, "failed to parse push frame");
        }
    }
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25%, deterministically seeded from the attempt number,
/// to spread reconnection storms from multiple clients.
#[allow(clippy::as_conversions, clippy::cast_precision_loss)]
fn backoff_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(attempt as i32);
    let capped = base.min(config.max_delay.as_secs_f64());

    let jitter_factor = 1.0 + 0.25 * ((attempt as f64 * 7.3).sin());
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn test_channel() -> PushChannel {
        PushChannel::new(
            Url::parse("wss://example.test/v1/events").unwrap(),
            "tok".to_string().into(),
            ReconnectConfig::default(),
        )
    }

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_retries, 8);
    }

    #[test]
    fn backoff_increases_exponentially() {
        let config = ReconnectConfig::default();

        let d0 = backoff_delay(0, &config);
        let d1 = backoff_delay(1, &config);
        let d2 = backoff_delay(2, &config);

        assert!(d1 > d0, "d1 ({d1:?}) should be greater than d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should be greater than d1 ({d1:?})");
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_retries: 8,
        };

        let d10 = backoff_delay(10, &config);
        // Jitter factor tops out at 1.25
        assert!(
            d10 <= Duration::from_secs(13),
            "delay at attempt 10 ({d10:?}) should be capped near max_delay"
        );
    }

    #[test]
    fn parse_push_event() {
        let json = r#"{
            "event": "document.processing.progress",
            "subject": "doc-1",
            "payload": { "percent": 42 }
        }"#;

        let event: PushEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.name, "document.processing.progress");
        assert_eq!(event.subject_id.as_deref(), Some("doc-1"));
        assert_eq!(event.payload["percent"], 42);
    }

    #[test]
    fn malformed_frame_is_dropped() {
        let (tx, mut rx) = broadcast::channel::<Arc<PushEvent>>(16);

        parse_and_broadcast("not json at all", &tx);
        parse_and_broadcast(r#"{"payload": {}}"#, &tx);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let channel = test_channel();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        let _g1 = channel.on("chat.updated", move |_| o1.lock().unwrap().push(1));
        let o2 = Arc::clone(&order);
        let _g2 = channel.on("chat.updated", move |_| o2.lock().unwrap().push(2));

        channel.inner.router.dispatch(&PushEvent {
            name: "chat.updated".into(),
            subject_id: None,
            payload: serde_json::Value::Null,
        });

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let channel = test_channel();
        let calls = Arc::new(Mutex::new(0_u32));

        let c = Arc::clone(&calls);
        let guard = channel.on("chat.updated", move |_| *c.lock().unwrap() += 1);
        guard.unsubscribe();
        guard.unsubscribe();

        channel.inner.router.dispatch(&PushEvent {
            name: "chat.updated".into(),
            subject_id: None,
            payload: serde_json::Value::Null,
        });

        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn subject_interest_is_reference_counted() {
        let channel = test_channel();
        let mut cmd_rx = channel.inner.cmd_rx.lock().unwrap().take().unwrap();

        channel.join_subject("doc-1");
        channel.join_subject("doc-1");
        assert_eq!(channel.subject_watchers("doc-1"), 2);

        // Only the first join produced a wire command
        assert!(matches!(cmd_rx.try_recv(), Ok(SubjectCommand::Join(ref s)) if s == "doc-1"));
        assert!(cmd_rx.try_recv().is_err());

        channel.leave_subject("doc-1");
        assert!(cmd_rx.try_recv().is_err());

        channel.leave_subject("doc-1");
        assert_eq!(channel.subject_watchers("doc-1"), 0);
        assert!(matches!(cmd_rx.try_recv(), Ok(SubjectCommand::Leave(ref s)) if s == "doc-1"));
    }

    #[test]
    fn leave_of_unknown_subject_is_a_noop() {
        let channel = test_channel();
        let mut cmd_rx = channel.inner.cmd_rx.lock().unwrap().take().unwrap();

        channel.leave_subject("never-joined");
        assert!(cmd_rx.try_recv().is_err());
    }
}

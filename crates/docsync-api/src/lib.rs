// docsync-api: Async Rust client for the Docsync HTTP API and push-event channel

pub mod client;
pub mod error;
pub mod push;
pub mod transport;
pub mod types;

pub use client::ApiClient;
pub use error::Error;
pub use push::{ChannelState, HandlerGuard, PushChannel, PushEvent, ReconnectConfig};
pub use transport::TransportConfig;

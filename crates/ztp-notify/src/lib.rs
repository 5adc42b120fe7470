//! ztp-notify: real-time notification client for the ZTP provisioning server.
//!
//! One duplex channel, typed event envelopes, per-kind and any-kind
//! subscribers, and automatic reconnection with capped exponential backoff.
//!
//! # Example
//!
//! ```rust,ignore
//! use ztp_notify::{ClientConfig, EventKind, NotificationClient, SharedBaseUrl};
//!
//! let base = SharedBaseUrl::new("https://ztp.example.net".parse()?);
//! let client = NotificationClient::websocket(ClientConfig::default(), base.clone());
//!
//! let sub = client.on(EventKind::DeviceDiscovered, |event| {
//!     tracing::info!(payload = %event.payload(), "new device");
//!     Ok(())
//! });
//! client.connect()?;
//!
//! // later
//! sub.unsubscribe();
//! client.shutdown().await;
//! ```

pub mod backoff;
pub mod client;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod reconnect;
pub mod transport;
pub mod websocket;

// ── Primary re-exports ──────────────────────────────────────────────
pub use backoff::{ReconnectConfig, calculate_backoff};
pub use client::{ClientConfig, LinkEvent, NotificationClient, RetryTimer};
pub use dispatch::{DispatchReport, DispatchStats, Dispatcher, HandlerError, Subscription};
pub use endpoint::{BaseAddressSource, DEFAULT_ENDPOINT_PATH, SharedBaseUrl, derive_endpoint};
pub use error::Error;
pub use event::{Envelope, EventKind};
pub use reconnect::{ConnectionState, ReconnectAction, ReconnectController};
pub use transport::{
    CLOSE_ABNORMAL, CLOSE_GOING_AWAY, CLOSE_NORMAL, CloseReason, ConnectionId, Transport,
    TransportEvent, TransportSink,
};
pub use websocket::{WsHandle, WsTransport};

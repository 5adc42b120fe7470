use thiserror::Error;

/// Top-level error type for the `ztp-notify` crate.
///
/// None of these ever escape the background task as a panic: connection
/// failures feed the backoff path, decode failures are counted and logged.
/// They surface to callers only from the few synchronous helpers
/// (endpoint derivation, envelope decoding, typed payload access).
#[derive(Debug, Error)]
pub enum Error {
    // ── Endpoint ────────────────────────────────────────────────────
    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Base address uses a scheme that has no WebSocket counterpart.
    #[error("Unsupported base URL scheme '{scheme}' (expected http or https)")]
    UnsupportedScheme { scheme: String },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// Envelope decoding failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// Payload did not match the shape requested by the caller.
    #[error("Payload for '{event_type}' does not match the requested type: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    // ── Client ──────────────────────────────────────────────────────
    /// The background task has exited; the client can no longer act.
    #[error("Notification client is shut down")]
    ClientClosed,
}

impl Error {
    /// Returns `true` if this is a transient error the backoff path
    /// is expected to recover from.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WebSocketConnect(_) | Self::WebSocketClosed { .. })
    }

    /// Build a [`Deserialization`](Self::Deserialization) error, keeping a
    /// lossy copy of the raw body.
    pub(crate) fn deserialization(err: &serde_json::Error, body: &[u8]) -> Self {
        Self::Deserialization {
            message: err.to_string(),
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }
}

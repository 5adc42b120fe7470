//! WebSocket transport.
//!
//! One background task per [`Transport::open`] call: connect, read frames
//! until the channel ends, report exactly one close through the sink.
//! Retrying is not this module's business.
//!
//! Close reporting:
//!
//! | what happened                          | `closed(clean, code)`      |
//! |----------------------------------------|----------------------------|
//! | client called `close(handle, reason)`  | `(true, reason.code())`    |
//! | server sent a close frame              | `(true, frame code)`       |
//! | connect failed, read error, EOF        | `(false, 1006)`            |

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, protocol::CloseFrame};
use url::Url;

use crate::error::Error;
use crate::transport::{CLOSE_ABNORMAL, CloseReason, ConnectionId, Transport, TransportSink};

/// Production transport backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

/// Owner side of one WebSocket task.
#[derive(Debug)]
pub struct WsHandle {
    conn: ConnectionId,
    close_tx: oneshot::Sender<CloseReason>,
    task: JoinHandle<()>,
}

impl WsHandle {
    pub fn connection(&self) -> ConnectionId {
        self.conn
    }
}

impl Transport for WsTransport {
    type Handle = WsHandle;

    fn open(&mut self, conn: ConnectionId, endpoint: Url, sink: TransportSink) -> WsHandle {
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            run_connection(endpoint, sink, close_rx).await;
        });
        WsHandle {
            conn,
            close_tx,
            task,
        }
    }

    fn close(&mut self, handle: WsHandle, reason: CloseReason) {
        tracing::debug!(conn = %handle.conn, ?reason, "closing WebSocket");
        if handle.close_tx.send(reason).is_err() {
            // Task already finished and reported its own close.
            tracing::trace!(conn = %handle.conn, "WebSocket task already gone");
        }
        drop(handle.task);
    }
}

// ── Single connection lifecycle ──────────────────────────────────────

/// How a connection that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Closure {
    code: u16,
}

async fn run_connection(
    endpoint: Url,
    sink: TransportSink,
    mut close_rx: oneshot::Receiver<CloseReason>,
) {
    let conn = sink.connection();
    match connect_and_read(&endpoint, &sink, &mut close_rx).await {
        Ok(Closure { code }) => {
            tracing::info!(%conn, code, "WebSocket closed");
            sink.closed(true, code);
        }
        Err(e) => {
            tracing::warn!(%conn, error = %e, "WebSocket dropped");
            sink.closed(false, CLOSE_ABNORMAL);
        }
    }
}

/// Establish one WebSocket connection and read messages until it ends.
async fn connect_and_read(
    endpoint: &Url,
    sink: &TransportSink,
    close_rx: &mut oneshot::Receiver<CloseReason>,
) -> Result<Closure, Error> {
    tracing::info!(url = %endpoint, conn = %sink.connection(), "Connecting to WebSocket");

    let connected = tokio::select! {
        biased;
        reason = &mut *close_rx => {
            // Closed before the handshake finished; nothing to send.
            return Ok(Closure { code: requested(reason).code() });
        }
        res = tokio_tungstenite::connect_async(endpoint.as_str()) => res,
    };
    let (mut ws_stream, _response) =
        connected.map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    tracing::info!(conn = %sink.connection(), "WebSocket connected");
    sink.opened();

    loop {
        tokio::select! {
            biased;
            reason = &mut *close_rx => {
                let reason = requested(reason);
                let frame = CloseFrame {
                    code: reason.code().into(),
                    reason: "client closing".into(),
                };
                if let Err(e) = ws_stream.close(Some(frame)).await {
                    tracing::debug!(error = %e, "close handshake did not complete");
                }
                return Ok(Closure { code: reason.code() });
            }
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        sink.message(Bytes::copy_from_slice(text.as_bytes()));
                    }
                    Some(Ok(tungstenite::Message::Binary(data))) => {
                        sink.message(data);
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite handles pong replies automatically
                        tracing::trace!("WebSocket ping");
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        let code = frame.as_ref().map_or(CLOSE_ABNORMAL, |cf| u16::from(cf.code));
                        if let Some(ref cf) = frame {
                            tracing::info!(
                                code = %cf.code,
                                reason = %cf.reason,
                                "WebSocket close frame received"
                            );
                        } else {
                            tracing::info!("WebSocket close frame received (no payload)");
                        }
                        return Ok(Closure { code });
                    }
                    Some(Err(e)) => {
                        return Err(Error::WebSocketConnect(e.to_string()));
                    }
                    None => {
                        return Err(Error::WebSocketClosed {
                            code: CLOSE_ABNORMAL,
                            reason: "stream ended without close frame".into(),
                        });
                    }
                    _ => {
                        // Pong, Frame -- ignore
                    }
                }
            }
        }
    }
}

/// A dropped handle counts as the owner going away.
fn requested(reason: Result<CloseReason, oneshot::error::RecvError>) -> CloseReason {
    reason.unwrap_or(CloseReason::GoingAway)
}

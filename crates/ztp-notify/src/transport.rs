// ── Transport boundary ──
//
// The thinnest possible seam between the reconnection logic and the
// network. A transport opens one duplex channel per `open` call and reports
// back through a `TransportSink`; it never retries on its own.

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;
use url::Url;

/// Normal closure: the client asked for it.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint is going away (shutdown, navigation, server restart).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// No close frame was exchanged: connect failure, reset, EOF.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Generation tag for one `open` call.
///
/// The controller hands out a fresh id for every attempt, so a notification
/// from a transport it has already discarded can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why the client is closing a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit `disconnect()`.
    Normal,
    /// The client itself is shutting down.
    GoingAway,
}

impl CloseReason {
    /// WebSocket close code that goes on the wire for this reason.
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => CLOSE_NORMAL,
            Self::GoingAway => CLOSE_GOING_AWAY,
        }
    }
}

/// Notification emitted by a transport to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(Bytes),
    Closed { clean: bool, code: u16 },
}

/// Sending half handed to a transport on `open`.
///
/// Every notification is tagged with the connection it belongs to and lands
/// on the client's single serialized queue. Sends after the client is gone
/// are silently dropped.
#[derive(Debug, Clone)]
pub struct TransportSink {
    conn: ConnectionId,
    tx: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>,
}

impl TransportSink {
    pub(crate) fn new(
        conn: ConnectionId,
        tx: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>,
    ) -> Self {
        Self { conn, tx }
    }

    /// Connection this sink reports for.
    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    /// The channel is established.
    pub fn opened(&self) {
        self.emit(TransportEvent::Opened);
    }

    /// A complete inbound message arrived.
    pub fn message(&self, raw: impl Into<Bytes>) {
        self.emit(TransportEvent::Message(raw.into()));
    }

    /// The channel is gone. `clean` is true only when a close handshake
    /// actually happened.
    pub fn closed(&self, clean: bool, code: u16) {
        self.emit(TransportEvent::Closed { clean, code });
    }

    fn emit(&self, event: TransportEvent) {
        // Receiver gone means the client shut down; nothing left to tell.
        let _ = self.tx.send((self.conn, event));
    }
}

/// A duplex channel factory.
///
/// `open` must not block and must not report failure synchronously: a
/// failed attempt is reported later as `closed(false, CLOSE_ABNORMAL)`
/// through the sink.
pub trait Transport: Send + 'static {
    /// Owner-side handle to one open (or opening) channel.
    type Handle: Send + 'static;

    fn open(&mut self, conn: ConnectionId, endpoint: Url, sink: TransportSink) -> Self::Handle;

    /// Request a graceful shutdown of the channel behind `handle`.
    fn close(&mut self, handle: Self::Handle, reason: CloseReason);
}

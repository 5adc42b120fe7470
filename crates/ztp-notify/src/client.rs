// ── Notification client ──
//
// The application-facing handle. All state lives in one background task
// that serializes application commands, transport notifications and the
// retry timer; the handle only enqueues commands and reads published
// state. Handler registration goes straight to the shared dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::backoff::ReconnectConfig;
use crate::dispatch::{DispatchStats, Dispatcher, HandlerError, Subscription};
use crate::endpoint::{BaseAddressSource, DEFAULT_ENDPOINT_PATH, derive_endpoint};
use crate::error::Error;
use crate::event::{Envelope, EventKind};
use crate::reconnect::{ConnectionState, ReconnectAction, ReconnectController};
use crate::transport::{
    CLOSE_ABNORMAL, CloseReason, ConnectionId, Transport, TransportEvent, TransportSink,
};
use crate::websocket::WsTransport;

const DEFAULT_LIFECYCLE_CAPACITY: usize = 64;

// ── ClientConfig ─────────────────────────────────────────────────────

/// Runtime configuration for a [`NotificationClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub reconnect: ReconnectConfig,
    /// Path appended to the base address. Default: `/ws`.
    pub endpoint_path: String,
    /// Buffered [`LinkEvent`]s per lagging observer.
    pub lifecycle_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            endpoint_path: DEFAULT_ENDPOINT_PATH.to_owned(),
            lifecycle_capacity: DEFAULT_LIFECYCLE_CAPACITY,
        }
    }
}

// ── LinkEvent ────────────────────────────────────────────────────────

/// Connection lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A transport is being opened against `endpoint`.
    Connecting { conn: ConnectionId, endpoint: Url },
    Opened { conn: ConnectionId },
    Dropped {
        conn: ConnectionId,
        clean: bool,
        code: u16,
    },
    RetryScheduled { attempt: u32, delay: Duration },
    /// Retries exhausted. Nothing else happens until `connect()`.
    GaveUp { attempts: u32 },
    /// `disconnect()` (or shutdown) took effect.
    Disconnected,
}

// ── RetryTimer ───────────────────────────────────────────────────────

/// The single pending reconnect timer.
///
/// Scheduling replaces the previous deadline; cancelling clears it.
#[derive(Debug, Default)]
pub struct RetryTimer {
    deadline: Option<Instant>,
}

impl RetryTimer {
    pub fn schedule(&mut self, delay: Duration) {
        self.deadline = Some(Instant::now() + delay);
    }

    /// Returns `true` if a timer was pending.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves at the deadline; never resolves while nothing is scheduled.
    pub async fn fired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

// ── NotificationClient ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Command {
    Connect,
    Disconnect,
}

/// Reconnecting publish/subscribe client for server-pushed events.
///
/// Constructed explicitly and handed to whatever needs it; there is no
/// global instance. Dropping the client (or calling
/// [`shutdown`](Self::shutdown)) closes the channel and stops the task.
#[derive(Debug)]
pub struct NotificationClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    lifecycle: broadcast::Sender<LinkEvent>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl NotificationClient {
    /// Spawn the client task on the current Tokio runtime.
    ///
    /// Starts `Idle`; nothing connects until [`connect`](Self::connect).
    pub fn spawn<B, T>(config: ClientConfig, base: B, transport: T) -> Self
    where
        B: BaseAddressSource,
        T: Transport,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Idle);
        let (lifecycle, _) = broadcast::channel(config.lifecycle_capacity.max(1));
        let dispatcher = Arc::new(Dispatcher::new());
        let cancel = CancellationToken::new();

        let driver = Driver {
            machine: ReconnectController::new(config.reconnect),
            base,
            endpoint_path: config.endpoint_path,
            transport,
            handle: None,
            retry: RetryTimer::default(),
            events_tx,
            state_tx,
            lifecycle: lifecycle.clone(),
            dispatcher: Arc::clone(&dispatcher),
        };
        let task = tokio::spawn(driver.run(command_rx, events_rx, cancel.clone()));

        Self {
            commands,
            state,
            lifecycle,
            dispatcher,
            cancel,
            task,
        }
    }

    /// Spawn a client over the WebSocket transport.
    pub fn websocket<B: BaseAddressSource>(config: ClientConfig, base: B) -> Self {
        Self::spawn(config, base, WsTransport::new())
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Arm auto-reconnect and open the channel. Returns immediately;
    /// a no-op while already connecting or open.
    pub fn connect(&self) -> Result<(), Error> {
        self.send(Command::Connect)
    }

    /// Close the channel and stop reconnecting until the next `connect()`.
    pub fn disconnect(&self) -> Result<(), Error> {
        self.send(Command::Disconnect)
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.commands.send(command).map_err(|_| {
            warn!(?command, "notification client task is gone");
            Error::ClientClosed
        })
    }

    /// `true` while the channel is open.
    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribe to lifecycle notifications, including the terminal
    /// [`LinkEvent::GaveUp`].
    pub fn lifecycle(&self) -> broadcast::Receiver<LinkEvent> {
        self.lifecycle.subscribe()
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Register a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(kind, handler)
    }

    /// Register a handler for every event.
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.dispatcher.subscribe_all(handler)
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Close the channel (code 1001) and wait for the task to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "notification client task ended abnormally");
        }
    }
}

// ── Background driver ────────────────────────────────────────────────

struct Driver<B, T: Transport> {
    machine: ReconnectController,
    base: B,
    endpoint_path: String,
    transport: T,
    handle: Option<(ConnectionId, T::Handle)>,
    retry: RetryTimer,
    events_tx: mpsc::UnboundedSender<(ConnectionId, TransportEvent)>,
    state_tx: watch::Sender<ConnectionState>,
    lifecycle: broadcast::Sender<LinkEvent>,
    dispatcher: Arc<Dispatcher>,
}

impl<B: BaseAddressSource, T: Transport> Driver<B, T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<(ConnectionId, TransportEvent)>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    let actions = match command {
                        Command::Connect => self.machine.connect(),
                        Command::Disconnect => self.machine.disconnect(CloseReason::Normal),
                    };
                    self.apply(actions);
                }
                Some((conn, event)) = events.recv() => self.on_transport(conn, event),
                () = self.retry.fired() => {
                    self.retry.cancel();
                    let actions = self.machine.on_retry_timer();
                    self.apply(actions);
                }
            }
        }

        let actions = self.machine.disconnect(CloseReason::GoingAway);
        self.apply(actions);
        debug!("notification client task exiting");
    }

    fn on_transport(&mut self, conn: ConnectionId, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                let actions = self.machine.on_open(conn);
                self.apply(actions);
            }
            TransportEvent::Message(raw) => {
                if self.machine.current() == Some(conn) && self.machine.is_connected() {
                    self.dispatcher.dispatch(&raw);
                } else {
                    debug!(%conn, "dropping message from inactive connection");
                }
            }
            TransportEvent::Closed { clean, code } => {
                let actions = self.machine.on_close(conn, clean, code);
                self.apply(actions);
            }
        }
    }

    fn apply(&mut self, actions: Vec<ReconnectAction>) {
        for action in actions {
            match action {
                ReconnectAction::Open(conn) => self.open(conn),
                ReconnectAction::Close { conn, reason } => self.close(conn, reason),
                ReconnectAction::ScheduleRetry { attempt, delay } => {
                    self.retry.schedule(delay);
                    info!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Waiting before reconnect"
                    );
                    self.emit(LinkEvent::RetryScheduled { attempt, delay });
                }
                ReconnectAction::CancelRetry => {
                    if self.retry.cancel() {
                        debug!("pending reconnect cancelled");
                    }
                }
                ReconnectAction::Opened(conn) => {
                    info!(%conn, "notification channel open");
                    self.emit(LinkEvent::Opened { conn });
                }
                ReconnectAction::Dropped { conn, clean, code } => {
                    if self.handle.as_ref().is_some_and(|(owned, _)| *owned == conn) {
                        self.handle = None;
                    }
                    if clean {
                        info!(%conn, code, "notification channel closed");
                    } else {
                        warn!(%conn, code, "notification channel dropped");
                    }
                    self.emit(LinkEvent::Dropped { conn, clean, code });
                }
                ReconnectAction::GaveUp { attempts } => {
                    error!(attempts, "reconnection limit reached, giving up");
                    self.emit(LinkEvent::GaveUp { attempts });
                }
                ReconnectAction::Disconnected => {
                    info!("notification channel disconnected");
                    self.emit(LinkEvent::Disconnected);
                }
            }
        }

        let state = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn open(&mut self, conn: ConnectionId) {
        let base = self.base.base_url();
        let endpoint = match derive_endpoint(&base, &self.endpoint_path) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                // Same path as a refused connection: an unclean close,
                // delivered through the queue.
                warn!(%conn, base = %base, error = %e, "cannot derive notification endpoint");
                let _ = self.events_tx.send((
                    conn,
                    TransportEvent::Closed {
                        clean: false,
                        code: CLOSE_ABNORMAL,
                    },
                ));
                return;
            }
        };

        info!(%conn, %endpoint, "opening notification channel");
        self.emit(LinkEvent::Connecting {
            conn,
            endpoint: endpoint.clone(),
        });

        let sink = TransportSink::new(conn, self.events_tx.clone());
        let handle = self.transport.open(conn, endpoint, sink);
        if let Some((stale, old)) = self.handle.replace((conn, handle)) {
            warn!(%stale, "replacing a transport that was never released");
            self.transport.close(old, CloseReason::GoingAway);
        }
    }

    fn close(&mut self, conn: ConnectionId, reason: CloseReason) {
        match self.handle.take() {
            Some((owned, handle)) if owned == conn => self.transport.close(handle, reason),
            Some(other) => {
                debug!(%conn, owned = %other.0, "close requested for a transport not owned");
                self.handle = Some(other);
            }
            None => debug!(%conn, "close requested but no transport is owned"),
        }
    }

    fn emit(&self, event: LinkEvent) {
        // No observers is fine.
        let _ = self.lifecycle.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_client_config() {
        let config = ClientConfig::default();
        assert_eq!(config.endpoint_path, "/ws");
        assert_eq!(config.reconnect, ReconnectConfig::default());
        assert_eq!(config.lifecycle_capacity, 64);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_timer_fires_at_deadline() {
        let mut timer = RetryTimer::default();
        assert!(!timer.is_pending());

        timer.schedule(Duration::from_secs(4));
        let started = Instant::now();
        timer.fired().await;
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_pending_deadline() {
        let mut timer = RetryTimer::default();
        timer.schedule(Duration::from_secs(30));
        timer.schedule(Duration::from_secs(2));

        let started = Instant::now();
        timer.fired().await;
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let mut timer = RetryTimer::default();
        timer.schedule(Duration::from_secs(1));
        assert!(timer.cancel());
        assert!(!timer.cancel());

        let fired = tokio::time::timeout(Duration::from_secs(60), timer.fired()).await;
        assert!(fired.is_err());
    }
}

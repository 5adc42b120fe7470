//! Reconnection state machine.
//!
//! Pure logic, no I/O and no clock: every input returns the list of
//! [`ReconnectAction`]s the driver has to carry out (open a transport,
//! arm or cancel the retry timer, report lifecycle changes). The runtime
//! driver lives in [`crate::client`]; tests drive this type directly.
//!
//! ```text
//!            connect()                 on_open
//!   ┌──────┐ ─────────> ┌────────────┐ ───────> ┌──────┐
//!   │ Idle │            │ Connecting │          │ Open │
//!   └──────┘ <───────── └────────────┘ <─────── └──────┘
//!      ^     disconnect()   │    ^    on_close     │
//!      │                    │    └─ retry timer ───┘ (armed)
//!      │      retries       v
//!      │     exhausted  ┌────────┐
//!      └─ disconnect() ─│ Closed │── connect() ──> Connecting
//!                       └────────┘
//! ```
//!
//! Every `open` gets a fresh [`ConnectionId`]. Notifications for any id
//! other than the one currently owned are stale and ignored.

use std::time::Duration;

use crate::backoff::{ReconnectConfig, calculate_backoff};
use crate::transport::{CloseReason, ConnectionId};

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never connected, or disconnected on request.
    #[default]
    Idle,
    /// A transport is opening, or a retry is scheduled.
    Connecting,
    Open,
    /// Retries exhausted. Stays here until the next `connect()`.
    Closed,
}

/// Instruction for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Resolve the endpoint and open a transport tagged with this id.
    Open(ConnectionId),
    /// Close the transport owned under this id.
    Close {
        conn: ConnectionId,
        reason: CloseReason,
    },
    /// Arm the single retry timer, replacing any pending one.
    ScheduleRetry { attempt: u32, delay: Duration },
    /// Disarm the retry timer.
    CancelRetry,

    // Lifecycle reports, no side effect beyond notifying observers.
    Opened(ConnectionId),
    Dropped {
        conn: ConnectionId,
        clean: bool,
        code: u16,
    },
    GaveUp { attempts: u32 },
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ReconnectController {
    config: ReconnectConfig,
    state: ConnectionState,
    should_reconnect: bool,
    attempt_count: u32,
    current: Option<ConnectionId>,
    retry_pending: bool,
    next_conn: u64,
}

impl ReconnectController {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
            should_reconnect: false,
            attempt_count: 0,
            current: None,
            retry_pending: false,
            next_conn: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Retries scheduled since the last successful open.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Transport currently owned, if any.
    pub fn current(&self) -> Option<ConnectionId> {
        self.current
    }

    pub fn should_reconnect(&self) -> bool {
        self.should_reconnect
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    // ── Application inputs ───────────────────────────────────────

    /// Arm auto-reconnect and start an attempt. No-op while `Connecting`
    /// or `Open`.
    pub fn connect(&mut self) -> Vec<ReconnectAction> {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            tracing::debug!(state = ?self.state, "connect ignored, already active");
            return Vec::new();
        }

        self.should_reconnect = true;
        self.attempt_count = 0;
        vec![self.begin_attempt()]
    }

    /// Disarm auto-reconnect, cancel a pending retry and close the owned
    /// transport with `reason`.
    pub fn disconnect(&mut self, reason: CloseReason) -> Vec<ReconnectAction> {
        self.should_reconnect = false;

        let mut actions = Vec::new();
        if self.retry_pending {
            self.retry_pending = false;
            actions.push(ReconnectAction::CancelRetry);
        }
        if let Some(conn) = self.current.take() {
            actions.push(ReconnectAction::Close { conn, reason });
        }
        if self.state != ConnectionState::Idle {
            self.state = ConnectionState::Idle;
            actions.push(ReconnectAction::Disconnected);
        }
        actions
    }

    // ── Transport and timer inputs ───────────────────────────────

    pub fn on_open(&mut self, conn: ConnectionId) -> Vec<ReconnectAction> {
        if self.current != Some(conn) || self.state != ConnectionState::Connecting {
            tracing::debug!(%conn, state = ?self.state, "ignoring stale open");
            return Vec::new();
        }

        self.state = ConnectionState::Open;
        self.attempt_count = 0;
        vec![ReconnectAction::Opened(conn)]
    }

    pub fn on_close(&mut self, conn: ConnectionId, clean: bool, code: u16) -> Vec<ReconnectAction> {
        if self.current != Some(conn) {
            tracing::debug!(%conn, clean, code, "ignoring close from discarded transport");
            return Vec::new();
        }
        self.current = None;

        let mut actions = vec![ReconnectAction::Dropped { conn, clean, code }];

        if !self.should_reconnect {
            self.state = ConnectionState::Idle;
            return actions;
        }

        if let Some(max) = self.config.max_attempts {
            if self.attempt_count >= max {
                self.state = ConnectionState::Closed;
                self.should_reconnect = false;
                actions.push(ReconnectAction::GaveUp {
                    attempts: self.attempt_count,
                });
                return actions;
            }
        }

        let delay = calculate_backoff(self.attempt_count, &self.config);
        self.attempt_count += 1;
        self.state = ConnectionState::Connecting;
        if self.retry_pending {
            actions.push(ReconnectAction::CancelRetry);
        }
        self.retry_pending = true;
        actions.push(ReconnectAction::ScheduleRetry {
            attempt: self.attempt_count,
            delay,
        });
        actions
    }

    pub fn on_retry_timer(&mut self) -> Vec<ReconnectAction> {
        if !self.retry_pending {
            return Vec::new();
        }
        self.retry_pending = false;

        if !self.should_reconnect || self.current.is_some() {
            return Vec::new();
        }
        vec![self.begin_attempt()]
    }

    fn begin_attempt(&mut self) -> ReconnectAction {
        self.next_conn += 1;
        let conn = ConnectionId(self.next_conn);
        self.current = Some(conn);
        self.state = ConnectionState::Connecting;
        ReconnectAction::Open(conn)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::transport::{CLOSE_ABNORMAL, CLOSE_GOING_AWAY, CLOSE_NORMAL};

    fn controller() -> ReconnectController {
        ReconnectController::new(ReconnectConfig::default())
    }

    fn opened_conn(actions: &[ReconnectAction]) -> ConnectionId {
        actions
            .iter()
            .find_map(|a| match a {
                ReconnectAction::Open(c) => Some(*c),
                _ => None,
            })
            .expect("expected an Open action")
    }

    fn scheduled(actions: &[ReconnectAction]) -> Option<(u32, Duration)> {
        actions.iter().find_map(|a| match a {
            ReconnectAction::ScheduleRetry { attempt, delay } => Some((*attempt, *delay)),
            _ => None,
        })
    }

    /// Fail the current attempt and fire the retry timer, returning the
    /// delay that was scheduled and the id of the next attempt.
    fn fail_and_retry(ctl: &mut ReconnectController) -> (Duration, ConnectionId) {
        let conn = ctl.current().unwrap();
        let actions = ctl.on_close(conn, false, CLOSE_ABNORMAL);
        let (_, delay) = scheduled(&actions).expect("retry scheduled");
        let next = opened_conn(&ctl.on_retry_timer());
        (delay, next)
    }

    #[test]
    fn connect_from_idle_opens_once() {
        let mut ctl = controller();
        let actions = ctl.connect();
        assert_eq!(actions, vec![ReconnectAction::Open(ConnectionId(1))]);
        assert_eq!(ctl.state(), ConnectionState::Connecting);
        assert!(ctl.should_reconnect());
    }

    #[test]
    fn connect_is_idempotent_while_connecting_or_open() {
        let mut ctl = controller();
        let conn = opened_conn(&ctl.connect());
        assert!(ctl.connect().is_empty());

        ctl.on_open(conn);
        assert!(ctl.connect().is_empty());
        assert_eq!(ctl.current(), Some(conn));
    }

    #[test]
    fn connect_during_retry_wait_does_not_reset_backoff() {
        let mut ctl = controller();
        let conn = opened_conn(&ctl.connect());
        ctl.on_close(conn, false, CLOSE_ABNORMAL);
        assert_eq!(ctl.attempt_count(), 1);

        assert!(ctl.connect().is_empty());
        assert_eq!(ctl.attempt_count(), 1);
        assert!(ctl.retry_pending());
    }

    #[test]
    fn open_resets_attempt_count() {
        let mut ctl = controller();
        opened_conn(&ctl.connect());
        fail_and_retry(&mut ctl);
        fail_and_retry(&mut ctl);
        let (_, conn) = fail_and_retry(&mut ctl);
        assert_eq!(ctl.attempt_count(), 3);

        assert_eq!(ctl.on_open(conn), vec![ReconnectAction::Opened(conn)]);
        assert_eq!(ctl.attempt_count(), 0);
        assert!(ctl.is_connected());

        // The next drop starts over at the base delay.
        let actions = ctl.on_close(conn, false, CLOSE_ABNORMAL);
        assert_eq!(scheduled(&actions), Some((1, Duration::from_secs(1))));
    }

    #[test]
    fn six_failures_schedule_capped_exponential_delays() {
        let mut ctl = controller();
        opened_conn(&ctl.connect());

        let delays: Vec<u128> = (0..6)
            .map(|_| fail_and_retry(&mut ctl).0.as_millis())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000]);
    }

    #[test]
    fn drop_while_open_schedules_retry() {
        let mut ctl = controller();
        let conn = opened_conn(&ctl.connect());
        ctl.on_open(conn);

        let actions = ctl.on_close(conn, false, CLOSE_ABNORMAL);
        assert_eq!(
            actions,
            vec![
                ReconnectAction::Dropped {
                    conn,
                    clean: false,
                    code: CLOSE_ABNORMAL
                },
                ReconnectAction::ScheduleRetry {
                    attempt: 1,
                    delay: Duration::from_secs(1)
                },
            ]
        );
        assert_eq!(ctl.state(), ConnectionState::Connecting);
        assert!(!ctl.is_connected());
    }

    #[test]
    fn server_going_away_while_armed_reconnects() {
        let mut ctl = controller();
        let conn = opened_conn(&ctl.connect());
        ctl.on_open(conn);

        let actions = ctl.on_close(conn, true, CLOSE_GOING_AWAY);
        assert!(scheduled(&actions).is_some());
    }

    #[test]
    fn disconnect_closes_normally_and_goes_idle() {
        let mut ctl = controller();
        let conn = opened_conn(&ctl.connect());
        ctl.on_open(conn);

        let actions = ctl.disconnect(CloseReason::Normal);
        assert_eq!(
            actions,
            vec![
                ReconnectAction::Close {
                    conn,
                    reason: CloseReason::Normal
                },
                ReconnectAction::Disconnected,
            ]
        );
        assert_eq!(ctl.state(), ConnectionState::Idle);
        assert!(!ctl.should_reconnect());
    }

    #[test]
    fn no_retry_after_disconnect_even_on_abnormal_close() {
        let mut ctl = controller();
        let conn = opened_conn(&ctl.connect());
        ctl.on_open(conn);
        ctl.disconnect(CloseReason::Normal);

        assert!(ctl.on_close(conn, false, CLOSE_ABNORMAL).is_empty());
        assert!(ctl.on_close(conn, true, CLOSE_NORMAL).is_empty());
        assert!(ctl.on_retry_timer().is_empty());
        assert_eq!(ctl.state(), ConnectionState::Idle);
    }

    #[test]
    fn disconnect_during_backoff_cancels_timer() {
        let mut ctl = controller();
        let conn = opened_conn(&ctl.connect());
        ctl.on_close(conn, false, CLOSE_ABNORMAL);
        assert!(ctl.retry_pending());

        let actions = ctl.disconnect(CloseReason::Normal);
        assert_eq!(
            actions,
            vec![ReconnectAction::CancelRetry, ReconnectAction::Disconnected]
        );
        // A timer that fired anyway is ignored.
        assert!(ctl.on_retry_timer().is_empty());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut ctl = controller();
        ctl.connect();
        assert!(!ctl.disconnect(CloseReason::Normal).is_empty());
        assert!(ctl.disconnect(CloseReason::Normal).is_empty());
    }

    #[test]
    fn gives_up_after_max_attempts_and_connect_rearms() {
        let mut ctl = ReconnectController::new(ReconnectConfig {
            max_attempts: Some(2),
            ..ReconnectConfig::default()
        });
        opened_conn(&ctl.connect());
        fail_and_retry(&mut ctl);
        fail_and_retry(&mut ctl);

        let conn = ctl.current().unwrap();
        let actions = ctl.on_close(conn, false, CLOSE_ABNORMAL);
        assert_eq!(
            actions,
            vec![
                ReconnectAction::Dropped {
                    conn,
                    clean: false,
                    code: CLOSE_ABNORMAL
                },
                ReconnectAction::GaveUp { attempts: 2 },
            ]
        );
        assert_eq!(ctl.state(), ConnectionState::Closed);
        assert!(ctl.on_retry_timer().is_empty());

        let actions = ctl.connect();
        assert!(matches!(actions.as_slice(), [ReconnectAction::Open(_)]));
        assert_eq!(ctl.attempt_count(), 0);
    }

    #[test]
    fn unlimited_attempts_never_give_up() {
        let mut ctl = ReconnectController::new(ReconnectConfig {
            max_attempts: None,
            ..ReconnectConfig::default()
        });
        opened_conn(&ctl.connect());
        for _ in 0..100 {
            fail_and_retry(&mut ctl);
        }
        assert_eq!(ctl.state(), ConnectionState::Connecting);
        assert_eq!(ctl.attempt_count(), 100);
    }

    #[test]
    fn stale_open_after_reconnect_is_ignored() {
        let mut ctl = controller();
        let first = opened_conn(&ctl.connect());
        ctl.disconnect(CloseReason::Normal);
        let second = opened_conn(&ctl.connect());
        assert_ne!(first, second);

        assert!(ctl.on_open(first).is_empty());
        assert_eq!(ctl.state(), ConnectionState::Connecting);
        assert_eq!(ctl.on_open(second), vec![ReconnectAction::Opened(second)]);
    }

    #[derive(Debug, Clone, Copy)]
    enum Input {
        Connect,
        Disconnect,
        Open,
        CloseClean,
        CloseAbnormal,
        Timer,
    }

    const INPUTS: [Input; 6] = [
        Input::Connect,
        Input::Disconnect,
        Input::Open,
        Input::CloseClean,
        Input::CloseAbnormal,
        Input::Timer,
    ];

    fn apply(
        ctl: &mut ReconnectController,
        last: &mut Option<ConnectionId>,
        input: Input,
    ) -> Vec<ReconnectAction> {
        // Transport notifications target the most recently opened id, which
        // may already be discarded.
        let actions = match input {
            Input::Connect => ctl.connect(),
            Input::Disconnect => ctl.disconnect(CloseReason::Normal),
            Input::Open => last.map(|c| ctl.on_open(c)).unwrap_or_default(),
            Input::CloseClean => last
                .map(|c| ctl.on_close(c, true, CLOSE_NORMAL))
                .unwrap_or_default(),
            Input::CloseAbnormal => last
                .map(|c| ctl.on_close(c, false, CLOSE_ABNORMAL))
                .unwrap_or_default(),
            Input::Timer => ctl.on_retry_timer(),
        };
        for a in &actions {
            if let ReconnectAction::Open(c) = a {
                *last = Some(*c);
            }
        }
        actions
    }

    /// Exhaustively walk every input sequence up to length 6: once a
    /// disconnect happened and no connect followed, nothing may open or be
    /// scheduled, and the connection is never reported open.
    #[test]
    fn nothing_reconnects_after_disconnect_for_all_short_sequences() {
        fn walk(
            ctl: &ReconnectController,
            last: Option<ConnectionId>,
            disarmed: bool,
            depth: usize,
        ) {
            if depth == 0 {
                return;
            }
            for input in INPUTS {
                let mut ctl = ctl.clone();
                let mut last = last;
                let actions = apply(&mut ctl, &mut last, input);

                let disarmed = match input {
                    Input::Connect => false,
                    Input::Disconnect => true,
                    _ => disarmed,
                };
                if disarmed {
                    assert!(
                        !actions.iter().any(|a| matches!(
                            a,
                            ReconnectAction::Open(_) | ReconnectAction::ScheduleRetry { .. }
                        )),
                        "{input:?} produced {actions:?} while disarmed"
                    );
                    assert!(!ctl.is_connected());
                }
                let schedules = actions
                    .iter()
                    .filter(|a| matches!(a, ReconnectAction::ScheduleRetry { .. }))
                    .count();
                assert!(schedules <= 1);
                walk(&ctl, last, disarmed, depth - 1);
            }
        }

        walk(&controller(), None, false, 6);
    }
}

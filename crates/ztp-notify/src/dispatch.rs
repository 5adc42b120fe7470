//! Event fan-out.
//!
//! Two registration sets: handlers bound to one [`EventKind`], and
//! handlers that see every event. A dispatch decodes the raw message once,
//! runs the kind-specific set, then the any-kind set, each in registration
//! order. Every handler call is its own failure boundary: an `Err` or a
//! panic is logged and counted, and the remaining handlers still run.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use indexmap::IndexMap;

use crate::event::{Envelope, EventKind};

/// Error a handler may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct HandlerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_kind: HashMap<EventKind, IndexMap<HandlerId, Handler>>,
    any: IndexMap<HandlerId, Handler>,
}

impl Registry {
    fn insert(&mut self, kind: Option<EventKind>, handler: Handler) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        match kind {
            Some(kind) => {
                self.by_kind.entry(kind).or_default().insert(id, handler);
            }
            None => {
                self.any.insert(id, handler);
            }
        }
        id
    }

    fn remove(&mut self, kind: Option<EventKind>, id: HandlerId) -> bool {
        match kind {
            Some(kind) => {
                let Some(set) = self.by_kind.get_mut(&kind) else {
                    return false;
                };
                let removed = set.shift_remove(&id).is_some();
                if set.is_empty() {
                    self.by_kind.remove(&kind);
                }
                removed
            }
            None => self.any.shift_remove(&id).is_some(),
        }
    }

    /// Handlers to run for `kind`, kind-specific first.
    fn snapshot(&self, kind: Option<EventKind>) -> Vec<Handler> {
        let specific = kind
            .and_then(|k| self.by_kind.get(&k))
            .into_iter()
            .flat_map(IndexMap::values);
        specific.chain(self.any.values()).cloned().collect()
    }

    fn len(&self) -> usize {
        self.by_kind.values().map(IndexMap::len).sum::<usize>() + self.any.len()
    }
}

/// Capability to remove exactly one registration.
///
/// Dropping it leaves the handler registered. [`unsubscribe`](Self::unsubscribe)
/// is idempotent and safe to call from inside a running handler.
#[derive(Clone)]
pub struct Subscription {
    kind: Option<EventKind>,
    id: HandlerId,
    registry: Weak<RwLock<Registry>>,
}

impl Subscription {
    /// Remove the handler. Returns `true` only for the call that actually
    /// removed it.
    pub fn unsubscribe(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let removed = registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.kind, self.id);
        if removed {
            tracing::debug!(kind = ?self.kind, "handler unsubscribed");
        }
        removed
    }

    /// Kind this subscription listens to; `None` for any-kind handlers.
    pub fn kind(&self) -> Option<EventKind> {
        self.kind
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id.0)
            .finish_non_exhaustive()
    }
}

/// Running totals since the dispatcher was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Messages that decoded and were fanned out.
    pub dispatched: u64,
    /// Messages dropped because they did not decode.
    pub decode_failures: u64,
    /// Handler calls that returned `Err` or panicked.
    pub handler_failures: u64,
}

/// Outcome of one [`Dispatcher::dispatch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub decoded: bool,
    pub invoked: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct Dispatcher {
    registry: Arc<RwLock<Registry>>,
    dispatched: AtomicU64,
    decode_failures: AtomicU64,
    handler_failures: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Register `handler` for every decoded event, known kind or not.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, kind: Option<EventKind>, handler: Handler) -> Subscription {
        let id = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, handler);
        tracing::debug!(?kind, "handler subscribed");
        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Number of live registrations across both sets.
    pub fn handler_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Decode `raw` and fan it out. Never panics and never returns an
    /// error: malformed input and failing handlers are logged and counted.
    pub fn dispatch(&self, raw: &[u8]) -> DispatchReport {
        match Envelope::decode(raw) {
            Ok(envelope) => self.deliver(&envelope),
            Err(e) => {
                self.decode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %e, len = raw.len(), "dropping undecodable message");
                DispatchReport::default()
            }
        }
    }

    /// Fan out an already decoded envelope.
    pub fn deliver(&self, envelope: &Envelope) -> DispatchReport {
        // Snapshot so handlers may (un)subscribe without deadlocking or
        // disturbing this round.
        let handlers = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot(envelope.kind());

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let mut report = DispatchReport {
            decoded: true,
            invoked: handlers.len(),
            failed: 0,
        };

        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| (*handler)(envelope)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(&*panic),
            };
            report.failed += 1;
            self.handler_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                event_type = envelope.event_type(),
                error = %failure,
                "event handler failed"
            );
        }

        tracing::trace!(
            event_type = envelope.event_type(),
            invoked = report.invoked,
            failed = report.failed,
            "event dispatched"
        );
        report
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handler_count())
            .field("stats", &self.stats())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_owned()
    }
}

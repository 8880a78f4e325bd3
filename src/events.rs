//! Connection lifecycle events and listener dispatch.
//!
//! Listeners are invoked on whichever task emits the event, through a
//! wrapper that catches panics and routes them to the
//! [`ConnectionEvent::CallbackException`] fault channel so one misbehaving
//! callback cannot take down the recovery worker or starve the others.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::port::ShutdownReport;

/// Events emitted by a recovering connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A recovery attempt completed; the connection is live again.
    RecoverySucceeded,

    /// A recovery attempt or a single topology replay item failed.
    ConnectionRecoveryError { message: String },

    /// A server-named queue came back under a different name.
    QueueNameChanged { old: String, new: String },

    /// A consumer was re-subscribed under a different tag.
    ConsumerTagChanged { old: String, new: String },

    /// A registered listener panicked while handling an event.
    CallbackException { context: String },

    /// Forwarded from the current transport.
    ConnectionShutdown { report: ShutdownReport },

    /// Forwarded from the current transport.
    ConnectionBlocked { reason: String },

    /// Forwarded from the current transport.
    ConnectionUnblocked,
}

impl ConnectionEvent {
    /// Short label used in logs and fault-channel context.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RecoverySucceeded => "recovery_succeeded",
            Self::ConnectionRecoveryError { .. } => "connection_recovery_error",
            Self::QueueNameChanged { .. } => "queue_name_changed_after_recovery",
            Self::ConsumerTagChanged { .. } => "consumer_tag_changed_after_recovery",
            Self::CallbackException { .. } => "callback_exception",
            Self::ConnectionShutdown { .. } => "connection_shutdown",
            Self::ConnectionBlocked { .. } => "connection_blocked",
            Self::ConnectionUnblocked => "connection_unblocked",
        }
    }
}

type Listener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Registry of event listeners with panic-isolated dispatch.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for all connection events.
    pub fn subscribe(&self, listener: impl Fn(&ConnectionEvent) + Send + Sync + 'static) {
        self.listeners.lock().push(Arc::new(listener));
    }

    /// Emit `event` to every registered listener.
    ///
    /// Dispatch runs on a snapshot of the listener list so no user code
    /// executes under the registry lock. A panicking listener produces a
    /// [`ConnectionEvent::CallbackException`]; panics while handling the
    /// fault channel itself are only logged.
    pub fn emit(&self, event: &ConnectionEvent) {
        self.dispatch(event, true);
    }

    fn dispatch(&self, event: &ConnectionEvent, route_faults: bool) {
        let listeners: Vec<Listener> = self.listeners.lock().clone();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| (listener.as_ref())(event)));
            if outcome.is_err() {
                error!(event = event.kind(), "Event listener panicked");
                if route_faults {
                    let fault = ConnectionEvent::CallbackException {
                        context: event.kind().to_string(),
                    };
                    self.dispatch(&fault, false);
                }
            }
        }
    }
}

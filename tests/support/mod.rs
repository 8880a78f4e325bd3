//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use rabbithole::domain::{Delivery, DeliveryHandler};
use rabbithole::events::ConnectionEvent;
use rabbithole::port::ShutdownInitiator;
use rabbithole::testkit::ScriptedFactory;
use rabbithole::ConnectionConfig;
use rabbithole::RecoveringConnection;

/// Route tracing output through the test harness; honors `RUST_LOG`.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Delivery handler that drops everything.
pub struct NullHandler;

#[async_trait]
impl DeliveryHandler for NullHandler {
    async fn on_delivery(&self, _delivery: Delivery) {}
}

pub fn handler() -> Arc<dyn DeliveryHandler> {
    Arc::new(NullHandler)
}

/// Config with a short retry interval so tests do not crawl.
pub fn fast_config(endpoints: &[&str]) -> ConnectionConfig {
    ConnectionConfig::new(endpoints.iter().copied())
        .with_network_recovery_interval(Duration::from_millis(10))
}

/// Captures every emitted event for later assertions.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ConnectionEvent>>>,
}

impl EventLog {
    pub fn attach(connection: &RecoveringConnection) -> Self {
        let log = Self::default();
        let events = Arc::clone(&log.events);
        connection.on_event(move |event| events.lock().push(event.clone()));
        log
    }

    pub fn all(&self) -> Vec<ConnectionEvent> {
        self.events.lock().clone()
    }

    pub fn recovery_succeeded(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::RecoverySucceeded))
            .count()
    }

    pub fn recovery_errors(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::ConnectionRecoveryError { .. }))
            .count()
    }

    pub fn queue_renames(&self) -> Vec<(String, String)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::QueueNameChanged { old, new } => {
                    Some((old.clone(), new.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn tag_changes(&self) -> Vec<(String, String)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::ConsumerTagChanged { old, new } => {
                    Some((old.clone(), new.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn blocked_reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::ConnectionBlocked { reason } => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Poll `predicate` until it holds, panicking after two seconds.
pub async fn wait_for(what: &str, predicate: impl Fn() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Peer-initiated disconnect of the current transport.
pub async fn force_disconnect(factory: &ScriptedFactory) {
    factory
        .shutdown_current(ShutdownInitiator::Peer, 320, "CONNECTION_FORCED")
        .await;
}

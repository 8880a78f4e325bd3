//! The public connection surface.
//!
//! `RecoveringConnection` forwards liveness-dependent operations to the
//! current transport and owns the machinery that replaces that transport
//! when it dies: the channel registry, the recorded topology, the event
//! bus, and the supervisor task running the recovery loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::config::{ConnectionConfig, Credentials};
use crate::domain::Endpoint;
use crate::error::{Error, Result};
use crate::events::{ConnectionEvent, EventBus};
use crate::port::{ClientIdentity, ShutdownReport, Transport, TransportFactory};

use super::channel::{ChannelCore, RecoveringChannel};
use super::controller;
use super::endpoints::{EndpointCycler, EndpointSelector};
use super::registry::{TopologyRegistry, TopologySnapshot};

/// AMQP reply-success, used for orderly closes.
const REPLY_SUCCESS: u16 = 200;

const DEFAULT_CLOSE_TEXT: &str = "Goodbye";

const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection lifecycle as observed by the recovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    Recovering,
    Closed,
}

/// Counters describing recovery activity, for observability surfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Reconnect attempts started.
    pub attempts: u64,
    /// Recovery passes that completed.
    pub succeeded: u64,
    /// Attempts that failed before the connection was usable.
    pub failed_attempts: u64,
    /// Individual topology items that failed to replay.
    pub topology_errors: u64,
}

#[derive(Default)]
pub(crate) struct StatsCounters {
    attempts: AtomicU64,
    succeeded: AtomicU64,
    failed_attempts: AtomicU64,
    topology_errors: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failed_attempt(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn topology_error(&self) {
        self.topology_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RecoveryStats {
        RecoveryStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            topology_errors: self.topology_errors.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct ConnectionInner {
    pub(crate) config: ConnectionConfig,
    pub(crate) factory: Arc<dyn TransportFactory>,
    pub(crate) cycler: EndpointCycler,
    /// Swap lock: `None` only during construction; a replacement is
    /// written in one critical section during takeover.
    pub(crate) transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Channel registry lock. Acquired before the entities lock, never
    /// after.
    channels: Mutex<Vec<Arc<ChannelCore>>>,
    next_channel: AtomicU16,
    pub(crate) topology: Arc<TopologyRegistry>,
    pub(crate) events: EventBus,
    lifecycle: watch::Sender<Lifecycle>,
    disposed: AtomicBool,
    client_name: String,
    credentials: RwLock<Credentials>,
    pub(crate) stats: StatsCounters,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionInner {
    pub(crate) fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            name: self.client_name.clone(),
            credentials: self.credentials.read().clone(),
        }
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Move the state machine, never downgrading out of `Closed`.
    pub(crate) fn set_lifecycle(&self, next: Lifecycle) {
        self.lifecycle.send_if_modified(|current| {
            if *current == Lifecycle::Closed || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    pub(crate) fn lifecycle_signal(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Stop the recovery loop; observed between attempts and items.
    pub(crate) fn request_stop(&self) {
        self.set_lifecycle(Lifecycle::Closed);
    }

    pub(crate) fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().clone()
    }

    /// Transport accessor used by every forwarded operation.
    pub(crate) fn live_transport(&self) -> Result<Arc<dyn Transport>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        if self.lifecycle() == Lifecycle::Closed {
            return Err(Error::NotOpen);
        }
        self.current_transport().ok_or(Error::NotOpen)
    }

    /// Install `transport` as the current handle (the takeover swap).
    pub(crate) fn install_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = Some(transport);
    }

    /// Clone the open channel list out of the registry lock.
    pub(crate) fn open_channels(&self) -> Vec<Arc<ChannelCore>> {
        self.channels
            .lock()
            .iter()
            .filter(|c| c.is_open())
            .cloned()
            .collect()
    }

    pub(crate) fn channel_by_number(&self, number: u16) -> Option<Arc<ChannelCore>> {
        self.channels
            .lock()
            .iter()
            .find(|c| c.number() == number && c.is_open())
            .cloned()
    }

    pub(crate) fn unregister_channel(&self, number: u16) {
        self.channels.lock().retain(|c| c.number() != number);
    }

    pub(crate) fn rotate_secret(&self, secret: &str) {
        self.credentials.write().password = secret.to_string();
    }
}

/// An auto-recovering connection.
///
/// Application code holds this handle and the [`RecoveringChannel`]s it
/// hands out; when the underlying transport dies involuntarily, a
/// supervisor task re-establishes it and replays the recorded topology,
/// and the handles keep working.
pub struct RecoveringConnection {
    inner: Arc<ConnectionInner>,
}

impl RecoveringConnection {
    /// Open a connection using the first endpoint the configured selector
    /// picks.
    ///
    /// # Errors
    ///
    /// Returns configuration errors, or the connect failure from the
    /// chosen endpoint. The initial connect is not retried.
    pub async fn connect(
        config: ConnectionConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let endpoints = config.resolved_endpoints()?;
        let cycler = EndpointCycler::from_selection(endpoints, config.endpoint_selection)?;
        Self::connect_with_cycler(config, factory, cycler).await
    }

    /// Open a connection with a custom endpoint selection strategy,
    /// overriding `endpoint_selection` from the configuration.
    ///
    /// # Errors
    ///
    /// Returns configuration errors, or the connect failure from the
    /// chosen endpoint.
    pub async fn connect_with_selector(
        config: ConnectionConfig,
        factory: Arc<dyn TransportFactory>,
        selector: Box<dyn EndpointSelector>,
    ) -> Result<Self> {
        config.validate()?;
        let cycler = EndpointCycler::new(config.resolved_endpoints()?, selector)?;
        Self::connect_with_cycler(config, factory, cycler).await
    }

    async fn connect_with_cycler(
        config: ConnectionConfig,
        factory: Arc<dyn TransportFactory>,
        cycler: EndpointCycler,
    ) -> Result<Self> {
        let client_name = config
            .client_name
            .clone()
            .unwrap_or_else(|| format!("rabbithole-{}", Uuid::new_v4()));
        let credentials = config.credentials.clone();

        let (lifecycle, _) = watch::channel(Lifecycle::Running);
        let inner = Arc::new(ConnectionInner {
            config,
            factory,
            cycler,
            transport: RwLock::new(None),
            channels: Mutex::new(Vec::new()),
            next_channel: AtomicU16::new(1),
            topology: Arc::new(TopologyRegistry::new()),
            events: EventBus::new(),
            lifecycle,
            disposed: AtomicBool::new(false),
            client_name,
            credentials: RwLock::new(credentials),
            stats: StatsCounters::default(),
            supervisor: Mutex::new(None),
        });

        let factory = Arc::clone(&inner.factory);
        let identity = inner.identity();
        let connected = inner
            .cycler
            .select_one(move |endpoint| async move { factory.connect(&endpoint, &identity).await })
            .await?;

        info!(endpoint = %connected.transport.endpoint(), "Connected");
        inner.install_transport(Arc::clone(&connected.transport));

        let handle = tokio::spawn(controller::supervise(
            Arc::clone(&inner),
            connected.events,
        ));
        *inner.supervisor.lock() = Some(handle);

        Ok(Self { inner })
    }

    /// Open a new channel and register its proxy for recovery.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after an abort, [`Error::NotOpen`]
    /// after a close, [`Error::ChannelsExhausted`] past the negotiated
    /// channel-max, or the transport failure from the channel-open RPC.
    pub async fn create_channel(&self) -> Result<RecoveringChannel> {
        let transport = self.inner.live_transport()?;

        let number = self.inner.next_channel.fetch_add(1, Ordering::SeqCst);
        let max = transport.channel_max();
        if max != 0 && number > max {
            return Err(Error::ChannelsExhausted { max });
        }

        let raw = transport.open_channel(number).await?;
        let core = Arc::new(ChannelCore::new(
            number,
            raw,
            Arc::clone(&self.inner.topology),
            self.inner.config.continuation_timeout(),
            Arc::downgrade(&self.inner),
        ));
        self.inner.channels.lock().push(Arc::clone(&core));
        Ok(RecoveringChannel::new(core))
    }

    /// Register a listener for connection events.
    pub fn on_event(&self, listener: impl Fn(&ConnectionEvent) + Send + Sync + 'static) {
        self.inner.events.subscribe(listener);
    }

    /// `false` while no live transport is installed, after a close, and
    /// during recovery.
    #[must_use]
    pub fn is_open(&self) -> bool {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.lifecycle() == Lifecycle::Running
            && self
                .inner
                .current_transport()
                .is_some_and(|t| t.is_open())
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lifecycle()
    }

    #[must_use]
    pub fn client_name(&self) -> &str {
        &self.inner.client_name
    }

    /// Endpoint of the current transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] or [`Error::NotOpen`] per lifecycle.
    pub fn endpoint(&self) -> Result<Endpoint> {
        Ok(self.inner.live_transport()?.endpoint())
    }

    /// # Errors
    ///
    /// Returns [`Error::Disposed`] or [`Error::NotOpen`] per lifecycle.
    pub fn local_port(&self) -> Result<Option<u16>> {
        Ok(self.inner.live_transport()?.local_port())
    }

    /// # Errors
    ///
    /// Returns [`Error::Disposed`] or [`Error::NotOpen`] per lifecycle.
    pub fn server_properties(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.inner.live_transport()?.server_properties())
    }

    /// # Errors
    ///
    /// Returns [`Error::Disposed`] or [`Error::NotOpen`] per lifecycle.
    pub fn channel_max(&self) -> Result<u16> {
        Ok(self.inner.live_transport()?.channel_max())
    }

    /// # Errors
    ///
    /// Returns [`Error::Disposed`] or [`Error::NotOpen`] per lifecycle.
    pub fn frame_max(&self) -> Result<u32> {
        Ok(self.inner.live_transport()?.frame_max())
    }

    /// # Errors
    ///
    /// Returns [`Error::Disposed`] or [`Error::NotOpen`] per lifecycle.
    pub fn heartbeat(&self) -> Result<Duration> {
        Ok(self.inner.live_transport()?.heartbeat())
    }

    /// Shutdown report of the current transport, if it has terminated.
    #[must_use]
    pub fn close_reason(&self) -> Option<ShutdownReport> {
        self.inner.current_transport().and_then(|t| t.close_reason())
    }

    /// Owned copy of the recorded topology.
    #[must_use]
    pub fn topology_snapshot(&self) -> TopologySnapshot {
        self.inner.topology.snapshot()
    }

    #[must_use]
    pub fn recovery_stats(&self) -> RecoveryStats {
        self.inner.stats.snapshot()
    }

    /// Rotate the authentication secret on the live connection and store
    /// it so subsequent reconnects authenticate with the new value.
    ///
    /// # Errors
    ///
    /// Returns lifecycle errors or the broker's rejection; the stored
    /// secret is only updated on success.
    pub async fn update_secret(&self, new_secret: &str, reason: &str) -> Result<()> {
        let transport = self.inner.live_transport()?;
        transport.update_secret(new_secret, reason).await?;
        self.inner.rotate_secret(new_secret);
        Ok(())
    }

    /// Orderly close with reply-success and the default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after an abort, or the close-handshake
    /// failure.
    pub async fn close(&self) -> Result<()> {
        self.close_with(REPLY_SUCCESS, DEFAULT_CLOSE_TEXT, DEFAULT_CLOSE_TIMEOUT)
            .await
    }

    /// Orderly close with an explicit reason code, text, and timeout.
    ///
    /// Stops the recovery loop first so an in-flight or future shutdown
    /// event cannot trigger reconnection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disposed`] after an abort, or the close-handshake
    /// failure.
    pub async fn close_with(&self, code: u16, text: &str, timeout: Duration) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        self.inner.request_stop();
        if let Some(transport) = self.inner.current_transport() {
            if transport.is_open() {
                transport.close(code, text, timeout).await?;
            }
        }
        Ok(())
    }

    /// Terminal teardown with reply-success and the default timeout.
    pub async fn abort(&self) {
        self.abort_with(REPLY_SUCCESS, DEFAULT_CLOSE_TEXT, DEFAULT_CLOSE_TIMEOUT)
            .await;
    }

    /// Terminal teardown: stops recovery, closes the transport swallowing
    /// failures, and marks the connection disposed. Subsequent operations
    /// fail with [`Error::Disposed`].
    pub async fn abort_with(&self, code: u16, text: &str, timeout: Duration) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.request_stop();
        if let Some(transport) = self.inner.current_transport() {
            if transport.is_open() {
                transport.abort(code, text, timeout).await;
            }
        }
        if let Some(handle) = self.inner.supervisor.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for RecoveringConnection {
    fn drop(&mut self) {
        self.inner.request_stop();
        if let Some(handle) = self.inner.supervisor.lock().take() {
            handle.abort();
        }
    }
}

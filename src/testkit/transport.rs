//! Fake transport stack driven by per-test scripts.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::{
    Arguments, DeliveryHandler, Endpoint, ExchangeSpec, QueueSpec,
};
use crate::error::{Error, Result};
use crate::port::{
    ChannelTransport, ClientIdentity, Connected, ConsumeOptions, DeclaredQueue, PublishOptions,
    ShutdownInitiator, ShutdownReport, Transport, TransportEvent, TransportFactory,
};

// ---------------------------------------------------------------------------
// TestBroker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BrokerState {
    /// Names handed out for server-named queue declarations, in order.
    server_names: Mutex<VecDeque<String>>,
    /// Tags handed out for consume calls. When non-empty, the next tag is
    /// popped regardless of what the client requested; otherwise the
    /// requested tag is echoed (or one is generated for an empty request).
    consumer_tags: Mutex<VecDeque<String>>,
    /// Exchanges that reject declares and binds, simulating broker-side
    /// failures during replay.
    broken_exchanges: Mutex<HashSet<String>>,
    /// Every channel operation, in arrival order.
    operations: Mutex<Vec<String>>,
    exchange_declares: Mutex<HashMap<String, u32>>,
    queue_declares: Mutex<HashMap<String, u32>>,
    consumes: AtomicU32,
    binds: AtomicU32,
    secret_updates: Mutex<Vec<String>>,
}

/// Scripted broker-side behavior shared by every fake transport a
/// [`ScriptedFactory`] creates.
#[derive(Clone, Default)]
pub struct TestBroker {
    state: Arc<BrokerState>,
}

impl TestBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue up a name for the next server-named queue declaration.
    pub fn push_server_name(&self, name: impl Into<String>) {
        self.state.server_names.lock().push_back(name.into());
    }

    /// Queue up a tag for the next consume call.
    pub fn push_consumer_tag(&self, tag: impl Into<String>) {
        self.state.consumer_tags.lock().push_back(tag.into());
    }

    /// Make declares of `name` and binds involving it fail.
    pub fn break_exchange(&self, name: impl Into<String>) {
        self.state.broken_exchanges.lock().insert(name.into());
    }

    pub fn repair_exchange(&self, name: &str) {
        self.state.broken_exchanges.lock().remove(name);
    }

    /// Every channel operation seen so far, in order.
    pub fn operations(&self) -> Vec<String> {
        self.state.operations.lock().clone()
    }

    pub fn exchange_declare_count(&self, name: &str) -> u32 {
        self.state
            .exchange_declares
            .lock()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn queue_declare_count(&self, name: &str) -> u32 {
        self.state
            .queue_declares
            .lock()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn consume_count(&self) -> u32 {
        self.state.consumes.load(Ordering::SeqCst)
    }

    pub fn bind_count(&self) -> u32 {
        self.state.binds.load(Ordering::SeqCst)
    }

    pub fn secret_updates(&self) -> Vec<String> {
        self.state.secret_updates.lock().clone()
    }

    fn log(&self, operation: String) {
        self.state.operations.lock().push(operation);
    }

    fn exchange_is_broken(&self, name: &str) -> bool {
        self.state.broken_exchanges.lock().contains(name)
    }

    fn next_server_name(&self) -> String {
        self.state
            .server_names
            .lock()
            .pop_front()
            .unwrap_or_else(|| format!("amq.gen-{}", short_id()))
    }

    fn next_consumer_tag(&self, requested: &str) -> String {
        if let Some(tag) = self.state.consumer_tags.lock().pop_front() {
            return tag;
        }
        if requested.is_empty() {
            format!("ctag-{}", short_id())
        } else {
            requested.to_string()
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

// ---------------------------------------------------------------------------
// ScriptedFactory
// ---------------------------------------------------------------------------

/// A [`TransportFactory`] with scripted connect outcomes.
///
/// Each `connect` pops the next result from the script (defaults to
/// `Ok` when exhausted). Tests kill the current transport with
/// [`shutdown_current`](Self::shutdown_current) to trigger recovery.
pub struct ScriptedFactory {
    broker: TestBroker,
    connect_results: Mutex<VecDeque<Result<()>>>,
    connect_count: AtomicU32,
    attempts: Mutex<Vec<Endpoint>>,
    identities: Mutex<Vec<ClientIdentity>>,
    current: Mutex<Option<Arc<FakeTransport>>>,
}

impl ScriptedFactory {
    pub fn new(broker: TestBroker) -> Self {
        Self {
            broker,
            connect_results: Mutex::new(VecDeque::new()),
            connect_count: AtomicU32::new(0),
            attempts: Mutex::new(Vec::new()),
            identities: Mutex::new(Vec::new()),
            current: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_connect_results(self, results: Vec<Result<()>>) -> Self {
        *self.connect_results.lock() = results.into();
        self
    }

    /// Append a connect outcome to the script.
    pub fn push_connect_result(&self, result: Result<()>) {
        self.connect_results.lock().push_back(result);
    }

    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Endpoints of every connect attempt, including failed ones.
    pub fn attempted_endpoints(&self) -> Vec<Endpoint> {
        self.attempts.lock().clone()
    }

    /// Identity presented on the most recent connect attempt.
    pub fn last_identity(&self) -> Option<ClientIdentity> {
        self.identities.lock().last().cloned()
    }

    /// Endpoint of the transport currently live, if any.
    pub fn current_endpoint(&self) -> Option<Endpoint> {
        self.current.lock().as_ref().map(|t| t.endpoint.clone())
    }

    /// Kill the current transport with the given initiator and report it
    /// through the transport's event stream.
    pub async fn shutdown_current(&self, initiator: ShutdownInitiator, code: u16, text: &str) {
        let transport = self.current.lock().clone();
        if let Some(transport) = transport {
            transport
                .terminate(ShutdownReport::new(initiator, code, text))
                .await;
        }
    }

    /// Raise a resource alarm on the current transport.
    pub async fn block_current(&self, reason: &str) {
        let transport = self.current.lock().clone();
        if let Some(transport) = transport {
            let _ = transport
                .events
                .send(TransportEvent::Blocked {
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Clear the resource alarm on the current transport.
    pub async fn unblock_current(&self) {
        let transport = self.current.lock().clone();
        if let Some(transport) = transport {
            let _ = transport.events.send(TransportEvent::Unblocked).await;
        }
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn connect(&self, endpoint: &Endpoint, identity: &ClientIdentity) -> Result<Connected> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.attempts.lock().push(endpoint.clone());
        self.identities.lock().push(identity.clone());

        if let Some(result) = self.connect_results.lock().pop_front() {
            result?;
        }

        let (events_tx, events_rx) = mpsc::channel(16);
        let transport = Arc::new(FakeTransport {
            endpoint: endpoint.clone(),
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            close_reason: Mutex::new(None),
            events: events_tx,
        });
        *self.current.lock() = Some(Arc::clone(&transport));

        Ok(Connected {
            transport,
            events: events_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// FakeTransport
// ---------------------------------------------------------------------------

struct FakeTransport {
    endpoint: Endpoint,
    broker: TestBroker,
    open: AtomicBool,
    close_reason: Mutex<Option<ShutdownReport>>,
    events: mpsc::Sender<TransportEvent>,
}

impl FakeTransport {
    async fn terminate(&self, report: ShutdownReport) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.close_reason.lock() = Some(report.clone());
        let _ = self.events.send(TransportEvent::Shutdown(report)).await;
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_channel(&self, number: u16) -> Result<Arc<dyn ChannelTransport>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::transport("connection is closed"));
        }
        Ok(Arc::new(FakeChannel {
            number,
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
        }))
    }

    async fn close(&self, code: u16, text: &str, _timeout: Duration) -> Result<()> {
        self.terminate(ShutdownReport::new(
            ShutdownInitiator::Application,
            code,
            text,
        ))
        .await;
        Ok(())
    }

    async fn abort(&self, code: u16, text: &str, _timeout: Duration) {
        self.terminate(ShutdownReport::new(
            ShutdownInitiator::Application,
            code,
            text,
        ))
        .await;
    }

    async fn update_secret(&self, secret: &str, _reason: &str) -> Result<()> {
        self.broker
            .state
            .secret_updates
            .lock()
            .push(secret.to_string());
        Ok(())
    }

    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn local_port(&self) -> Option<u16> {
        Some(49152)
    }

    fn server_properties(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("product".to_string(), "rabbithole-testkit".to_string())])
    }

    fn channel_max(&self) -> u16 {
        2047
    }

    fn frame_max(&self) -> u32 {
        131_072
    }

    fn heartbeat(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close_reason(&self) -> Option<ShutdownReport> {
        self.close_reason.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// FakeChannel
// ---------------------------------------------------------------------------

struct FakeChannel {
    number: u16,
    broker: TestBroker,
    open: AtomicBool,
}

impl FakeChannel {
    fn guard(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::transport(format!("channel {} is closed", self.number)))
        }
    }
}

#[async_trait]
impl ChannelTransport for FakeChannel {
    async fn declare_exchange(&self, name: &str, _spec: &ExchangeSpec) -> Result<()> {
        self.guard()?;
        self.broker.log(format!("exchange.declare {name}"));
        *self
            .broker
            .state
            .exchange_declares
            .lock()
            .entry(name.to_string())
            .or_insert(0) += 1;
        if self.broker.exchange_is_broken(name) {
            return Err(Error::Protocol {
                code: 541,
                message: format!("exchange {name} is unavailable"),
            });
        }
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        self.guard()?;
        self.broker.log(format!("exchange.delete {name}"));
        Ok(())
    }

    async fn declare_queue(&self, name: &str, _spec: &QueueSpec) -> Result<DeclaredQueue> {
        self.guard()?;
        let effective = if name.is_empty() {
            self.broker.next_server_name()
        } else {
            name.to_string()
        };
        self.broker.log(format!("queue.declare {effective}"));
        *self
            .broker
            .state
            .queue_declares
            .lock()
            .entry(effective.clone())
            .or_insert(0) += 1;
        Ok(DeclaredQueue {
            name: effective,
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.guard()?;
        self.broker.log(format!("queue.delete {name}"));
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: &Arguments,
    ) -> Result<()> {
        self.guard()?;
        self.broker
            .log(format!("queue.bind {exchange}->{queue} key={routing_key}"));
        if self.broker.exchange_is_broken(exchange) {
            return Err(Error::Protocol {
                code: 404,
                message: format!("no exchange {exchange}"),
            });
        }
        self.broker.state.binds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: &Arguments,
    ) -> Result<()> {
        self.guard()?;
        self.broker
            .log(format!("queue.unbind {exchange}->{queue} key={routing_key}"));
        Ok(())
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        _arguments: &Arguments,
    ) -> Result<()> {
        self.guard()?;
        self.broker.log(format!(
            "exchange.bind {source}->{destination} key={routing_key}"
        ));
        if self.broker.exchange_is_broken(source) || self.broker.exchange_is_broken(destination) {
            return Err(Error::Protocol {
                code: 404,
                message: format!("no exchange {source}"),
            });
        }
        self.broker.state.binds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unbind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        _arguments: &Arguments,
    ) -> Result<()> {
        self.guard()?;
        self.broker.log(format!(
            "exchange.unbind {source}->{destination} key={routing_key}"
        ));
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        tag: &str,
        _options: &ConsumeOptions,
        _handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String> {
        self.guard()?;
        let effective = self.broker.next_consumer_tag(tag);
        self.broker
            .log(format!("basic.consume {queue} tag={effective}"));
        self.broker.state.consumes.fetch_add(1, Ordering::SeqCst);
        Ok(effective)
    }

    async fn basic_cancel(&self, tag: &str) -> Result<()> {
        self.guard()?;
        self.broker.log(format!("basic.cancel {tag}"));
        Ok(())
    }

    async fn basic_qos(&self, prefetch_size: u32, prefetch_count: u16, global: bool) -> Result<()> {
        self.guard()?;
        self.broker.log(format!(
            "basic.qos size={prefetch_size} count={prefetch_count} global={global}"
        ));
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.guard()?;
        self.broker.log("confirm.select".to_string());
        Ok(())
    }

    async fn tx_select(&self) -> Result<()> {
        self.guard()?;
        self.broker.log("tx.select".to_string());
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _options: &PublishOptions,
        _body: &[u8],
    ) -> Result<()> {
        self.guard()?;
        self.broker
            .log(format!("basic.publish {exchange} key={routing_key}"));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.broker.log(format!("channel.close {}", self.number));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

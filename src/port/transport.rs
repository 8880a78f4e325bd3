//! Transport integration ports.
//!
//! Defines the traits a concrete AMQP transport must implement for the
//! recovery layer to drive it. The frame codec, socket handling, TLS, and
//! SASL negotiation all live behind these seams.
//!
//! # Overview
//!
//! - [`TransportFactory`]: open a fresh broker connection for an endpoint
//! - [`Transport`]: a live connection carrying channels and lifecycle events
//! - [`ChannelTransport`]: one AMQP channel's RPC surface
//! - [`TransportEvent`]: lifecycle notifications pushed by the transport

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::Credentials;
use crate::domain::{Arguments, DeliveryHandler, Endpoint, ExchangeSpec, QueueSpec};
use crate::error::Result;

/// Who initiated a connection shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownInitiator {
    /// The application asked for the close; recovery must not run.
    Application,
    /// The broker closed the connection.
    Peer,
    /// The socket died or the I/O loop failed.
    Network,
}

/// Terminal report describing why a transport shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub initiator: ShutdownInitiator,
    pub code: u16,
    pub text: String,
}

impl ShutdownReport {
    pub fn new(initiator: ShutdownInitiator, code: u16, text: impl Into<String>) -> Self {
        Self {
            initiator,
            code,
            text: text.into(),
        }
    }

    /// Return `true` if recovery is allowed to react to this shutdown.
    #[must_use]
    pub const fn is_involuntary(&self) -> bool {
        !matches!(self.initiator, ShutdownInitiator::Application)
    }
}

/// Lifecycle notification pushed by a live transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection terminated. Exactly one per transport lifetime.
    Shutdown(ShutdownReport),
    /// The broker paused publishes due to a resource alarm.
    Blocked { reason: String },
    /// The resource alarm cleared.
    Unblocked,
}

/// Identity presented to the broker on every (re)connect.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub name: String,
    pub credentials: Credentials,
}

/// A freshly opened transport plus its lifecycle event stream.
///
/// The receiver carries [`TransportEvent`]s for this transport only; the
/// recovery supervisor owns it for the transport's lifetime.
pub struct Connected {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Factory for opening broker connections.
///
/// # Thread Safety
///
/// Implementations must be thread-safe (`Send + Sync`); the recovery worker
/// and the initial connect path share one instance.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a connection to `endpoint`, authenticating as `identity`.
    ///
    /// # Errors
    ///
    /// Returns an error when the socket, handshake, or authentication
    /// fails; the caller decides whether to try another endpoint.
    async fn connect(&self, endpoint: &Endpoint, identity: &ClientIdentity) -> Result<Connected>;
}

/// A live, non-recovering broker connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open channel `number` on this connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the broker refuses
    /// the channel.
    async fn open_channel(&self, number: u16) -> Result<Arc<dyn ChannelTransport>>;

    /// Close the connection, waiting up to `timeout` for the handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails; the connection is
    /// torn down regardless.
    async fn close(&self, code: u16, text: &str, timeout: Duration) -> Result<()>;

    /// Close the connection, swallowing handshake failures.
    async fn abort(&self, code: u16, text: &str, timeout: Duration);

    /// Rotate the authentication secret on the live connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the new secret.
    async fn update_secret(&self, secret: &str, reason: &str) -> Result<()>;

    fn endpoint(&self) -> Endpoint;

    fn local_port(&self) -> Option<u16>;

    fn server_properties(&self) -> BTreeMap<String, String>;

    /// Negotiated channel ceiling; `0` means unlimited.
    fn channel_max(&self) -> u16;

    fn frame_max(&self) -> u32;

    fn heartbeat(&self) -> Duration;

    fn is_open(&self) -> bool;

    /// The shutdown report once the connection has terminated.
    fn close_reason(&self) -> Option<ShutdownReport>;
}

/// Result of a queue declaration.
#[derive(Debug, Clone)]
pub struct DeclaredQueue {
    /// Broker-assigned name; differs from the request for server-named
    /// queues.
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Options for a `basic.consume` subscription.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub arguments: Arguments,
}

/// Options for a `basic.publish`.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub mandatory: bool,
    pub immediate: bool,
}

/// One AMQP channel's RPC surface on a live transport.
///
/// # Errors
///
/// All methods return [`crate::error::Error`] for transport failures or
/// broker rejections.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn declare_exchange(&self, name: &str, spec: &ExchangeSpec) -> Result<()>;

    async fn delete_exchange(&self, name: &str) -> Result<()>;

    /// Declare a queue; an empty `name` requests a server-named queue.
    async fn declare_queue(&self, name: &str, spec: &QueueSpec) -> Result<DeclaredQueue>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<()>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<()>;

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<()>;

    async fn unbind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<()>;

    /// Subscribe `handler` to `queue`; an empty `tag` requests a
    /// broker-issued consumer tag. Returns the effective tag.
    async fn basic_consume(
        &self,
        queue: &str,
        tag: &str,
        options: &ConsumeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String>;

    async fn basic_cancel(&self, tag: &str) -> Result<()>;

    async fn basic_qos(&self, prefetch_size: u32, prefetch_count: u16, global: bool) -> Result<()>;

    async fn confirm_select(&self) -> Result<()>;

    async fn tx_select(&self) -> Result<()>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: &PublishOptions,
        body: &[u8],
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

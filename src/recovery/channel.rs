//! Channel proxy that survives transport replacement.
//!
//! Every topology-mutating call is tee'd into the [`TopologyRegistry`]
//! before returning, so a successful return implies the effect is already
//! recorded. Channel-local state (prefetch, confirm mode, tx mode) is kept
//! here and replayed when the channel is moved onto a replacement
//! transport.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::domain::{
    Arguments, DeliveryHandler, ExchangeSpec, QueueSpec, RecordedBinding, RecordedConsumer,
    RecordedExchange, RecordedQueue,
};
use crate::error::{Error, Result};
use crate::port::{ChannelTransport, ConsumeOptions, DeclaredQueue, PublishOptions, Transport};

use super::connection::ConnectionInner;
use super::registry::TopologyRegistry;

/// State the broker keeps per channel and forgets on reconnect.
#[derive(Debug, Clone, Copy, Default)]
struct ChannelLocalState {
    prefetch: Option<Prefetch>,
    confirms: bool,
    transactional: bool,
}

#[derive(Debug, Clone, Copy)]
struct Prefetch {
    size: u32,
    count: u16,
    global: bool,
}

pub(crate) struct ChannelCore {
    number: u16,
    raw: RwLock<Arc<dyn ChannelTransport>>,
    local: Mutex<ChannelLocalState>,
    topology: Arc<TopologyRegistry>,
    continuation_timeout: Duration,
    open: AtomicBool,
    connection: Weak<ConnectionInner>,
}

impl ChannelCore {
    pub(crate) fn new(
        number: u16,
        raw: Arc<dyn ChannelTransport>,
        topology: Arc<TopologyRegistry>,
        continuation_timeout: Duration,
        connection: Weak<ConnectionInner>,
    ) -> Self {
        Self {
            number,
            raw: RwLock::new(raw),
            local: Mutex::new(ChannelLocalState::default()),
            topology,
            continuation_timeout,
            open: AtomicBool::new(true),
            connection,
        }
    }

    pub(crate) fn number(&self) -> u16 {
        self.number
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Current raw channel handle, cloned out of the slot.
    pub(crate) fn raw(&self) -> Arc<dyn ChannelTransport> {
        self.raw.read().clone()
    }

    /// Move this channel onto `transport`: open a fresh raw channel and
    /// replay channel-local state (confirm/tx mode first, then prefetch),
    /// then swap it into the slot. Consumer re-subscription is driven by
    /// the connection-level recovery walk.
    pub(crate) async fn recover(&self, transport: &dyn Transport) -> Result<()> {
        let raw = transport.open_channel(self.number).await?;
        let local = *self.local.lock();

        if local.confirms {
            raw.confirm_select().await?;
        }
        if local.transactional {
            raw.tx_select().await?;
        }
        if let Some(p) = local.prefetch {
            raw.basic_qos(p.size, p.count, p.global).await?;
        }

        *self.raw.write() = raw;
        debug!(channel = self.number, "Channel recovered");
        Ok(())
    }

    /// Run one broker RPC with the open-state guard and the continuation
    /// timeout applied.
    async fn rpc<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        if !self.is_open() {
            return Err(Error::NotOpen);
        }
        tokio::time::timeout(self.continuation_timeout, fut)
            .await
            .map_err(|_| Error::ContinuationTimeout)?
    }
}

/// Application-facing channel handle.
///
/// The proxy keeps working across transport replacement: the recovery
/// worker swaps the raw channel underneath while the application keeps its
/// handle.
pub struct RecoveringChannel {
    core: Arc<ChannelCore>,
}

impl std::fmt::Debug for RecoveringChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveringChannel")
            .field("number", &self.core.number())
            .finish()
    }
}

impl RecoveringChannel {
    pub(crate) fn new(core: Arc<ChannelCore>) -> Self {
        Self { core }
    }

    /// Channel number on the wire.
    #[must_use]
    pub fn number(&self) -> u16 {
        self.core.number()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Declare an exchange and record it for replay.
    ///
    /// # Errors
    ///
    /// Returns the transport failure or [`Error::ContinuationTimeout`].
    pub async fn exchange_declare(&self, name: &str, spec: ExchangeSpec) -> Result<()> {
        let raw = self.core.raw();
        self.core.rpc(raw.declare_exchange(name, &spec)).await?;
        self.core.topology.record_exchange(RecordedExchange {
            name: name.to_string(),
            spec,
        });
        Ok(())
    }

    /// Delete an exchange, dropping it and its incident bindings from the
    /// record.
    ///
    /// # Errors
    ///
    /// Returns the transport failure or [`Error::ContinuationTimeout`].
    pub async fn exchange_delete(&self, name: &str) -> Result<()> {
        let raw = self.core.raw();
        self.core.rpc(raw.delete_exchange(name)).await?;
        self.core.topology.delete_exchange(name);
        Ok(())
    }

    /// Declare a queue and record it for replay.
    ///
    /// An empty `name` requests a server-named queue; the record tracks
    /// the broker-assigned name and is re-keyed on every recovery.
    ///
    /// # Errors
    ///
    /// Returns the transport failure or [`Error::ContinuationTimeout`].
    pub async fn queue_declare(&self, name: &str, spec: QueueSpec) -> Result<DeclaredQueue> {
        let server_named = name.is_empty();
        let raw = self.core.raw();
        let declared = self.core.rpc(raw.declare_queue(name, &spec)).await?;
        self.core.topology.record_queue(RecordedQueue {
            name: declared.name.clone(),
            spec,
            server_named,
            channel: self.core.number(),
        });
        Ok(declared)
    }

    /// Delete a queue, cascading auto-delete evaluation onto exchanges
    /// that were bound into it.
    ///
    /// # Errors
    ///
    /// Returns the transport failure or [`Error::ContinuationTimeout`].
    pub async fn queue_delete(&self, name: &str) -> Result<()> {
        let raw = self.core.raw();
        self.core.rpc(raw.delete_queue(name)).await?;
        self.core.topology.delete_queue(name);
        Ok(())
    }

    /// Bind a queue to an exchange and record the binding.
    ///
    /// # Errors
    ///
    /// Returns the transport failure or [`Error::ContinuationTimeout`].
    pub async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: Arguments,
    ) -> Result<()> {
        let raw = self.core.raw();
        self.core
            .rpc(raw.bind_queue(queue, exchange, routing_key, &arguments))
            .await?;
        self.core
            .topology
            .record_binding(RecordedBinding::to_queue(
                exchange,
                queue,
                routing_key,
                arguments,
            ));
        Ok(())
    }

    /// Remove a queue binding. Unbinding alone does not cascade.
    ///
    /// # Errors
    ///
    /// Returns the transport failure or [`Error::ContinuationTimeout`].
    pub async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: Arguments,
    ) -> Result<()> {
        let raw = self.core.raw();
        self.core
            .rpc(raw.unbind_queue(queue, exchange, routing_key, &arguments))
            .await?;
        self.core
            .topology
            .delete_binding(&RecordedBinding::to_queue(
                exchange,
                queue,
                routing_key,
                arguments,
            ));
        Ok(())
    }

    /// Bind an exchange to an exchange and record the binding.
    ///
    /// # Errors
    ///
    /// Returns the transport failure or [`Error::ContinuationTimeout`].
    pub async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: Arguments,
    ) -> Result<()> {
        let raw = self.core.raw();
        self.core
            .rpc(raw.bind_exchange(destination, source, routing_key, &arguments))
            .await?;
        self.core
            .topology
            .record_binding(RecordedBinding::to_exchange(
                source,
                destination,
                routing_key,
                arguments,
            ));
        Ok(())
    }

    /// Remove an exchange-to-exchange binding.
    ///
    /// # Errors
    ///
    /// Returns the transport failure or [`Error::ContinuationTimeout`].
    pub async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: Arguments,
    ) -> Result<()> {
        let raw = self.core.raw();
        self.core
            .rpc(raw.unbind_exchange(destination, source, routing_key, &arguments))
            .await?;
        self.core
            .topology
            .delete_binding(&RecordedBinding::to_exchange(
                source,
                destination,
                routing_key,
                arguments,
            ));
        Ok(())
    }

    /// Subscribe `handler` to `queue` and record the consumer. Returns the
    /// effective consumer tag, which the broker may have assigned.
    ///
    /// # Errors
    ///
    /// Returns the transport failure or [`Error::ContinuationTimeout`].
    pub async fn basic_consume(
        &self,
        queue: &str,
        tag: &str,
        options: ConsumeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String> {
        let raw = self.core.raw();
        let effective_tag = self
            .core
            .rpc(raw.basic_consume(queue, tag, &options, handler.clone()))
            .await?;
        self.core.topology.record_consumer(RecordedConsumer {
            tag: effective_tag.clone(),
            queue: queue.to_string(),
            auto_ack: options.auto_ack,
            exclusive: options.exclusive,
            no_local: options.no_local,
            arguments: options.arguments,
            handler,
            channel: self.core.number(),
        });
        Ok(effective_tag)
    }

    /// Cancel a consumer, then evaluate its queue for auto-delete.
    ///
    /// # Errors
    ///
    /// Returns the transport failure or [`Error::ContinuationTimeout`].
    pub async fn basic_cancel(&self, tag: &str) -> Result<()> {
        let raw = self.core.raw();
        self.core.rpc(raw.basic_cancel(tag)).await?;
        if let Some(consumer) = self.core.topology.delete_consumer(tag) {
            self.core
                .topology
                .maybe_delete_auto_delete_queue(&consumer.queue);
        }
        Ok(())
    }

    /// Apply prefetch limits and remember them for replay.
    ///
    /// # Errors
    ///
    /// Returns the transport failure or [`Error::ContinuationTimeout`].
    pub async fn basic_qos(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<()> {
        let raw = self.core.raw();
        self.core
            .rpc(raw.basic_qos(prefetch_size, prefetch_count, global))
            .await?;
        self.core.local.lock().prefetch = Some(Prefetch {
            size: prefetch_size,
            count: prefetch_count,
            global,
        });
        Ok(())
    }

    /// Enable publisher confirms and remember the mode for replay.
    ///
    /// # Errors
    ///
    /// Returns the transport failure or [`Error::ContinuationTimeout`].
    pub async fn confirm_select(&self) -> Result<()> {
        let raw = self.core.raw();
        self.core.rpc(raw.confirm_select()).await?;
        self.core.local.lock().confirms = true;
        Ok(())
    }

    /// Enter transactional mode and remember it for replay.
    ///
    /// # Errors
    ///
    /// Returns the transport failure or [`Error::ContinuationTimeout`].
    pub async fn tx_select(&self) -> Result<()> {
        let raw = self.core.raw();
        self.core.rpc(raw.tx_select()).await?;
        self.core.local.lock().transactional = true;
        Ok(())
    }

    /// Publish a message. Publishes are not recorded and not replayed.
    ///
    /// # Errors
    ///
    /// Returns the transport failure or [`Error::ContinuationTimeout`].
    pub async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        body: &[u8],
    ) -> Result<()> {
        let raw = self.core.raw();
        self.core
            .rpc(raw.basic_publish(exchange, routing_key, &options, body))
            .await
    }

    /// Close the channel, unregister the proxy, and drop its consumers
    /// from the record (evaluating queue auto-delete for each).
    ///
    /// # Errors
    ///
    /// Returns the transport failure or [`Error::ContinuationTimeout`].
    pub async fn close(&self) -> Result<()> {
        if !self.core.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        for consumer in self
            .core
            .topology
            .remove_channel_consumers(self.core.number())
        {
            self.core
                .topology
                .maybe_delete_auto_delete_queue(&consumer.queue);
        }
        if let Some(connection) = self.core.connection.upgrade() {
            connection.unregister_channel(self.core.number());
        }
        let raw = self.core.raw();
        tokio::time::timeout(self.core.continuation_timeout, raw.close())
            .await
            .map_err(|_| Error::ContinuationTimeout)?
    }
}

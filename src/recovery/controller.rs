//! Recovery orchestration.
//!
//! A supervisor task owns the current transport's event stream. Involuntary
//! shutdown moves the connection into `Recovering` and drives attempts:
//! pick an endpoint, build a replacement transport, take it over beneath
//! the channel proxies, then replay recorded topology in declaration order
//! (exchanges, queues, bindings, consumers). Item failures are isolated;
//! attempt failures pace the next try by the configured interval. Nothing
//! on this path panics out of the worker or throws to the application.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::ConnectionEvent;
use crate::port::{
    ConsumeOptions, ShutdownInitiator, ShutdownReport, TransportEvent,
};

use super::channel::ChannelCore;
use super::connection::{ConnectionInner, Lifecycle};

/// Supervisor loop: forwards lifecycle events and runs recovery after an
/// involuntary shutdown. Exits when the connection reaches `Closed`.
pub(crate) async fn supervise(
    inner: Arc<ConnectionInner>,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    loop {
        let event = match events.recv().await {
            Some(event) => event,
            // The transport dropped its sender without reporting shutdown;
            // treat it as a network loss.
            None => TransportEvent::Shutdown(ShutdownReport::new(
                ShutdownInitiator::Network,
                0,
                "transport event stream ended",
            )),
        };

        match event {
            TransportEvent::Blocked { reason } => {
                inner
                    .events
                    .emit(&ConnectionEvent::ConnectionBlocked { reason });
            }
            TransportEvent::Unblocked => {
                inner.events.emit(&ConnectionEvent::ConnectionUnblocked);
            }
            TransportEvent::Shutdown(report) => {
                inner.events.emit(&ConnectionEvent::ConnectionShutdown {
                    report: report.clone(),
                });

                if inner.lifecycle() == Lifecycle::Closed {
                    return;
                }
                if !report.is_involuntary() || !inner.config.automatic_recovery {
                    inner.set_lifecycle(Lifecycle::Closed);
                    return;
                }

                info!(
                    code = report.code,
                    text = %report.text,
                    "Connection lost, starting recovery"
                );
                inner.set_lifecycle(Lifecycle::Recovering);
                match run_recovery_loop(&inner).await {
                    Some(next_events) => {
                        inner.set_lifecycle(Lifecycle::Running);
                        events = next_events;
                    }
                    None => {
                        inner.set_lifecycle(Lifecycle::Closed);
                        return;
                    }
                }
            }
        }
    }
}

/// Retry attempts until one succeeds or a stop is requested. Returns the
/// replacement transport's event stream on success, `None` when stopped.
async fn run_recovery_loop(
    inner: &Arc<ConnectionInner>,
) -> Option<mpsc::Receiver<TransportEvent>> {
    let mut stop = inner.lifecycle_signal();
    let interval = inner.config.network_recovery_interval();

    loop {
        if inner.lifecycle() == Lifecycle::Closed {
            return None;
        }

        match attempt(inner).await {
            Ok(events) => {
                inner.stats.success();
                inner.events.emit(&ConnectionEvent::RecoverySucceeded);
                return Some(events);
            }
            Err(err) => {
                inner.stats.failed_attempt();
                warn!(error = %err, "Recovery attempt failed");
                inner.events.emit(&ConnectionEvent::ConnectionRecoveryError {
                    message: err.to_string(),
                });
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.changed() => {
                if inner.lifecycle() == Lifecycle::Closed {
                    return None;
                }
            }
        }
    }
}

/// One recovery pass: reconnect, take over, reopen channels, replay
/// topology.
async fn attempt(inner: &Arc<ConnectionInner>) -> Result<mpsc::Receiver<TransportEvent>> {
    inner.stats.attempt();

    let factory = Arc::clone(&inner.factory);
    let identity = inner.identity();
    let connected = inner
        .cycler
        .select_one(move |endpoint| async move { factory.connect(&endpoint, &identity).await })
        .await?;

    let transport = connected.transport;
    info!(endpoint = %transport.endpoint(), "Reconnected");

    // Takeover: the replacement becomes the handle every proxy reads.
    inner.install_transport(Arc::clone(&transport));

    for channel in inner.open_channels() {
        channel.recover(transport.as_ref()).await?;
    }

    if inner.config.topology_recovery {
        recover_topology(inner).await;
    }

    Ok(connected.events)
}

/// Replay recorded topology on the freshly recovered channels.
///
/// Each phase iterates a fresh snapshot so queue renames from the queue
/// phase are visible to the binding and consumer phases. Per-item failures
/// are logged, surfaced as `ConnectionRecoveryError`, and skipped.
async fn recover_topology(inner: &Arc<ConnectionInner>) {
    recover_exchanges(inner).await;
    recover_queues(inner).await;
    recover_bindings(inner).await;
    recover_consumers(inner).await;
}

async fn recover_exchanges(inner: &Arc<ConnectionInner>) {
    for exchange in inner.topology.snapshot().exchanges {
        if inner.lifecycle() == Lifecycle::Closed {
            return;
        }
        let Some(channel) = fallback_channel(inner) else {
            report_item_failure(
                inner,
                format!("exchange {}", exchange.name),
                Error::NotOpen,
            );
            continue;
        };
        let result = channel
            .raw()
            .declare_exchange(&exchange.name, &exchange.spec)
            .await;
        if let Err(err) = result {
            report_item_failure(inner, format!("exchange {}", exchange.name), err);
        }
    }
}

async fn recover_queues(inner: &Arc<ConnectionInner>) {
    for queue in inner.topology.snapshot().queues {
        if inner.lifecycle() == Lifecycle::Closed {
            return;
        }
        let Some(channel) = channel_or_fallback(inner, queue.channel) else {
            report_item_failure(inner, format!("queue {}", queue.name), Error::NotOpen);
            continue;
        };

        // Server-named queues are redeclared with an empty name so the
        // broker assigns a fresh one.
        let request = if queue.server_named { "" } else { &queue.name };
        match channel.raw().declare_queue(request, &queue.spec).await {
            Ok(declared) if declared.name != queue.name => {
                inner.topology.rename_queue(&queue.name, &declared.name);
                debug!(old = %queue.name, new = %declared.name, "Queue renamed by broker");
                inner.events.emit(&ConnectionEvent::QueueNameChanged {
                    old: queue.name.clone(),
                    new: declared.name,
                });
            }
            Ok(_) => {}
            Err(err) => report_item_failure(inner, format!("queue {}", queue.name), err),
        }
    }
}

async fn recover_bindings(inner: &Arc<ConnectionInner>) {
    let snapshot = inner.topology.snapshot();
    for binding in snapshot.bindings {
        if inner.lifecycle() == Lifecycle::Closed {
            return;
        }
        let context = format!("binding {} -> {}", binding.source, binding.destination);

        // Queue bindings replay on the channel that declared their queue
        // when it survives; exchange bindings have no recorded channel.
        let owner = snapshot
            .queues
            .iter()
            .find(|q| q.name == binding.destination)
            .and_then(|q| channel_or_fallback(inner, q.channel));
        let Some(channel) = owner.or_else(|| fallback_channel(inner)) else {
            report_item_failure(inner, context, Error::NotOpen);
            continue;
        };

        let raw = channel.raw();
        let result = match binding.destination_kind {
            crate::domain::BindingDestinationKind::Queue => {
                raw.bind_queue(
                    &binding.destination,
                    &binding.source,
                    &binding.routing_key,
                    &binding.arguments,
                )
                .await
            }
            crate::domain::BindingDestinationKind::Exchange => {
                raw.bind_exchange(
                    &binding.destination,
                    &binding.source,
                    &binding.routing_key,
                    &binding.arguments,
                )
                .await
            }
        };
        if let Err(err) = result {
            report_item_failure(inner, context, err);
        }
    }
}

async fn recover_consumers(inner: &Arc<ConnectionInner>) {
    for consumer in inner.topology.snapshot().consumers {
        if inner.lifecycle() == Lifecycle::Closed {
            return;
        }
        let context = format!("consumer {}", consumer.tag);
        let Some(channel) = channel_or_fallback(inner, consumer.channel) else {
            report_item_failure(inner, context, Error::NotOpen);
            continue;
        };

        let options = ConsumeOptions {
            auto_ack: consumer.auto_ack,
            exclusive: consumer.exclusive,
            no_local: consumer.no_local,
            arguments: consumer.arguments.clone(),
        };
        let result = channel
            .raw()
            .basic_consume(
                &consumer.queue,
                &consumer.tag,
                &options,
                Arc::clone(&consumer.handler),
            )
            .await;
        match result {
            Ok(new_tag) if new_tag != consumer.tag => {
                inner.topology.rename_consumer(&consumer.tag, &new_tag);
                debug!(old = %consumer.tag, new = %new_tag, "Consumer tag reissued");
                inner.events.emit(&ConnectionEvent::ConsumerTagChanged {
                    old: consumer.tag.clone(),
                    new: new_tag,
                });
            }
            Ok(_) => {}
            Err(err) => report_item_failure(inner, context, err),
        }
    }
}

fn channel_or_fallback(inner: &Arc<ConnectionInner>, number: u16) -> Option<Arc<ChannelCore>> {
    inner
        .channel_by_number(number)
        .or_else(|| fallback_channel(inner))
}

fn fallback_channel(inner: &Arc<ConnectionInner>) -> Option<Arc<ChannelCore>> {
    inner.open_channels().into_iter().min_by_key(|c| c.number())
}

fn report_item_failure(inner: &Arc<ConnectionInner>, context: String, cause: Error) {
    let err = Error::topology(context, cause);
    warn!(error = %err, "Topology item skipped");
    inner.stats.topology_error();
    inner.events.emit(&ConnectionEvent::ConnectionRecoveryError {
        message: err.to_string(),
    });
}

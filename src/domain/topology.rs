//! Recorded-topology data types.
//!
//! These records mirror every declaration the application has made on the
//! broker so it can be replayed after a reconnect. They are plain data:
//! replay logic lives in the recovery controller, not on the records.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::delivery::DeliveryHandler;

/// String-valued AMQP argument table.
///
/// Richer field-table value types are the transport adapter's concern; the
/// recording layer only needs a stable, hashable representation.
pub type Arguments = BTreeMap<String, String>;

/// Exchange routing behavior.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
    /// A broker-specific exchange type, e.g. `x-delayed-message`.
    Custom(String),
}

impl ExchangeKind {
    /// Wire name of the exchange type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration attributes of an exchange, excluding its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub kind: ExchangeKind,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: Arguments,
}

impl ExchangeSpec {
    /// A non-durable, non-auto-delete exchange of the given kind.
    pub fn new(kind: ExchangeKind) -> Self {
        Self {
            kind,
            durable: false,
            auto_delete: false,
            arguments: Arguments::new(),
        }
    }

    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    #[must_use]
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

/// Declaration attributes of a queue, excluding its name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSpec {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Arguments,
}

impl QueueSpec {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    #[must_use]
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    #[must_use]
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

/// An exchange the application has declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedExchange {
    pub name: String,
    pub spec: ExchangeSpec,
}

/// A queue the application has declared.
///
/// `name` is the current name; for server-named queues it changes across
/// recovery. `channel` is the number of the channel that declared it, used
/// to route the redeclaration during replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedQueue {
    pub name: String,
    pub spec: QueueSpec,
    pub server_named: bool,
    pub channel: u16,
}

/// Whether a binding terminates at a queue or at another exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingDestinationKind {
    Queue,
    Exchange,
}

/// A binding between an exchange and a queue or exchange.
///
/// The whole value is the identity: bindings form a set and duplicate
/// records are no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordedBinding {
    pub source: String,
    pub destination: String,
    pub destination_kind: BindingDestinationKind,
    pub routing_key: String,
    pub arguments: Arguments,
}

impl RecordedBinding {
    /// A binding from `source` into queue `destination`.
    pub fn to_queue(
        source: impl Into<String>,
        destination: impl Into<String>,
        routing_key: impl Into<String>,
        arguments: Arguments,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            destination_kind: BindingDestinationKind::Queue,
            routing_key: routing_key.into(),
            arguments,
        }
    }

    /// A binding from `source` into exchange `destination`.
    pub fn to_exchange(
        source: impl Into<String>,
        destination: impl Into<String>,
        routing_key: impl Into<String>,
        arguments: Arguments,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            destination_kind: BindingDestinationKind::Exchange,
            routing_key: routing_key.into(),
            arguments,
        }
    }
}

/// A consumer subscription the application has issued.
///
/// `tag` may change across recovery when the broker issues a fresh one.
#[derive(Clone)]
pub struct RecordedConsumer {
    pub tag: String,
    pub queue: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub arguments: Arguments,
    pub handler: Arc<dyn DeliveryHandler>,
    pub channel: u16,
}

impl fmt::Debug for RecordedConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordedConsumer")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .field("auto_ack", &self.auto_ack)
            .field("exclusive", &self.exclusive)
            .field("no_local", &self.no_local)
            .field("arguments", &self.arguments)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_kind_wire_names() {
        assert_eq!(ExchangeKind::Direct.as_str(), "direct");
        assert_eq!(ExchangeKind::Headers.as_str(), "headers");
        assert_eq!(
            ExchangeKind::Custom("x-delayed-message".into()).as_str(),
            "x-delayed-message"
        );
    }

    #[test]
    fn binding_identity_is_the_whole_value() {
        let a = RecordedBinding::to_queue("x", "q", "k", Arguments::new());
        let b = RecordedBinding::to_queue("x", "q", "k", Arguments::new());
        assert_eq!(a, b);

        let c = RecordedBinding::to_exchange("x", "q", "k", Arguments::new());
        assert_ne!(a, c);
    }

    #[test]
    fn spec_builders_set_flags() {
        let ex = ExchangeSpec::new(ExchangeKind::Fanout)
            .durable(true)
            .auto_delete(true);
        assert!(ex.durable);
        assert!(ex.auto_delete);

        let q = QueueSpec::new().exclusive(true);
        assert!(q.exclusive);
        assert!(!q.durable);
    }

    #[test]
    fn specs_round_trip_through_serde() {
        let mut arguments = Arguments::new();
        arguments.insert("x-message-ttl".into(), "60000".into());
        let spec = ExchangeSpec {
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
            arguments,
        };

        let json = serde_json::to_string(&spec).unwrap();
        let back: ExchangeSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);

        let queue: QueueSpec = serde_json::from_str(r#"{"durable": true}"#).unwrap();
        assert!(queue.durable);
        assert!(!queue.exclusive);
        assert!(queue.arguments.is_empty());
    }
}

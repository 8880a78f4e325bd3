//! Transport-agnostic domain types.

mod delivery;
mod endpoint;
mod topology;

pub use delivery::{Delivery, DeliveryHandler};
pub use endpoint::{Endpoint, DEFAULT_AMQP_PORT};
pub use topology::{
    Arguments, BindingDestinationKind, ExchangeKind, ExchangeSpec, QueueSpec, RecordedBinding,
    RecordedConsumer, RecordedExchange, RecordedQueue,
};

//! Message delivery to application consumers.

use async_trait::async_trait;

/// A message pushed to a consumer by the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

/// Application callback invoked for each delivery on a subscription.
///
/// The handler reference is recorded alongside the consumer so the same
/// callback keeps receiving messages after the subscription is replayed on
/// a replacement transport.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn on_delivery(&self, delivery: Delivery);
}

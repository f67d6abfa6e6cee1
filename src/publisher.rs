//! Domain event fan-out.

use async_trait::async_trait;

use crate::domain::events::OrderEvent;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Best-effort; a publish failure is logged by the implementation.
    async fn publish(&self, event: &OrderEvent);
}

/// Publishes to `orders.<kind>` on NATS.
pub struct NatsPublisher {
    client: async_nats::Client,
}

impl NatsPublisher {
    pub fn new(client: async_nats::Client) -> Self { Self { client } }
}

#[async_trait]
impl EventPublisher for NatsPublisher {
    async fn publish(&self, event: &OrderEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode order event");
                return;
            }
        };
        let subject = format!("orders.{}", event.kind());
        if let Err(e) = self.client.publish(subject.clone(), payload.into()).await {
            tracing::warn!(%subject, order_id = event.order_id(), error = %e, "Failed to publish order event");
        }
    }
}

/// Used when no broker is configured.
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: &OrderEvent) {
        tracing::debug!(kind = event.kind(), order_id = event.order_id(), "Order event");
    }
}

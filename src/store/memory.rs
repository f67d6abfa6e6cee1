//! In-memory store for tests and database-less dev runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{OrderStore, OutboxStore, StoreError, WebhookLedger};
use crate::domain::aggregates::Order;
use crate::outbox::{OutboxEntry, OutboxStatus};

#[derive(Default)]
struct Inner {
    orders: HashMap<String, Order>,
    outbox: Vec<OutboxEntry>,
    webhook_events: HashMap<String, String>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Snapshot of the outbox, in insertion order. Delivered and abandoned
    /// entries are dropped at the next `claim_due`.
    pub async fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.inner.read().await.outbox.clone()
    }

    pub async fn processed_events(&self) -> usize {
        self.inner.read().await.webhook_events.len()
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn get(&self, order_id: &str) -> Result<Order, StoreError> {
        self.inner.read().await.orders.get(order_id).cloned().ok_or_else(|| StoreError::NotFound(order_id.to_string()))
    }

    async fn create(&self, order: &Order, effects: &[OutboxEntry]) -> Result<Order, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.orders.contains_key(order.id()) {
            return Err(StoreError::Backend(format!("duplicate order id {}", order.id())));
        }
        let mut stored = order.clone();
        stored.take_events();
        stored.set_revision(1);
        inner.orders.insert(stored.id().to_string(), stored.clone());
        inner.outbox.extend_from_slice(effects);
        Ok(stored)
    }

    async fn update(&self, order: &Order, effects: &[OutboxEntry]) -> Result<Order, StoreError> {
        let mut inner = self.inner.write().await;
        let current = inner.orders.get(order.id()).ok_or_else(|| StoreError::NotFound(order.id().to_string()))?;
        if current.revision() != order.revision() {
            return Err(StoreError::RevisionConflict { order_id: order.id().to_string(), expected: order.revision() });
        }
        let mut stored = order.clone();
        stored.take_events();
        stored.set_revision(order.revision() + 1);
        inner.orders.insert(stored.id().to_string(), stored.clone());
        inner.outbox.extend_from_slice(effects);
        Ok(stored)
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn claim_due(&self, now: DateTime<Utc>, lease: Duration, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let lease = chrono::Duration::from_std(lease).map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut inner = self.inner.write().await;
        inner.outbox.retain(|e| e.status == OutboxStatus::Pending);
        let mut claimed = Vec::new();
        for entry in inner.outbox.iter_mut() {
            if claimed.len() >= limit { break; }
            if entry.status == OutboxStatus::Pending && entry.next_attempt_at <= now {
                entry.next_attempt_at = now + lease;
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_delivered(&self, entry_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let entry = inner.outbox.iter_mut().find(|e| e.id == entry_id).ok_or_else(|| StoreError::Backend(format!("no outbox entry {entry_id}")))?;
        entry.status = OutboxStatus::Delivered;
        entry.attempts += 1;
        Ok(())
    }

    async fn record_failure(&self, entry_id: Uuid, error: &str, next_attempt_at: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let entry = inner.outbox.iter_mut().find(|e| e.id == entry_id).ok_or_else(|| StoreError::Backend(format!("no outbox entry {entry_id}")))?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        match next_attempt_at {
            Some(at) => entry.next_attempt_at = at,
            None => entry.status = OutboxStatus::Abandoned,
        }
        Ok(())
    }
}

#[async_trait]
impl WebhookLedger for InMemoryStore {
    async fn claim(&self, event_id: &str, event_type: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.webhook_events.contains_key(event_id) { return Ok(false); }
        inner.webhook_events.insert(event_id.to_string(), event_type.to_string());
        Ok(true)
    }

    async fn release(&self, event_id: &str) -> Result<(), StoreError> {
        self.inner.write().await.webhook_events.remove(event_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{Address, LineItem, NewOrder};
    use crate::domain::value_objects::Money;
    use crate::outbox::SideEffect;
    use rust_decimal::Decimal;

    fn order() -> Order {
        Order::place(NewOrder {
            buyer_id: "b1".into(), vendor_id: "s1".into(),
            items: vec![LineItem { product_id: "p".into(), name: "Eggs".into(), unit_price: Money::new(Decimal::new(250, 2), "NGN"), quantity: 1, variant_index: 0 }],
            shipping_address: Address::default(), payment_method: None, payment_status: None,
            coupon_code: None, discount: Decimal::ZERO, claimed_total: None, currency: "NGN".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_revision_compare_and_swap() {
        let store = InMemoryStore::new();
        let created = store.create(&order(), &[]).await.unwrap();
        assert_eq!(created.revision(), 1);

        let first = store.update(&created, &[]).await.unwrap();
        assert_eq!(first.revision(), 2);
        let stale = store.update(&created, &[]).await.unwrap_err();
        assert!(matches!(stale, StoreError::RevisionConflict { expected: 1, .. }));
    }

    #[tokio::test]
    async fn test_claim_due_leases_entries() {
        let store = InMemoryStore::new();
        let mut entry = OutboxEntry::new("o1", SideEffect::DecrementStock { product_id: "p".into(), quantity: 1, variant_index: 0 });
        entry.next_attempt_at = Utc::now() - chrono::Duration::seconds(1);
        store.create(&order(), &[entry]).await.unwrap();

        let now = Utc::now();
        assert_eq!(store.claim_due(now, Duration::from_secs(60), 10).await.unwrap().len(), 1);
        assert!(store.claim_due(now, Duration::from_secs(60), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settled_entries_are_pruned() {
        let store = InMemoryStore::new();
        let done = OutboxEntry::new("o1", SideEffect::ClearCart { buyer_id: "b".into(), auth_token: None });
        let waiting = OutboxEntry::new("o1", SideEffect::ClearCart { buyer_id: "b".into(), auth_token: None });
        store.create(&order(), &[done.clone(), waiting.clone()]).await.unwrap();
        store.mark_delivered(done.id).await.unwrap();

        store.claim_due(Utc::now(), Duration::from_secs(60), 10).await.unwrap();
        let left = store.outbox_entries().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, waiting.id);
    }

    #[tokio::test]
    async fn test_webhook_claim_is_once() {
        let store = InMemoryStore::new();
        assert!(store.claim("evt_1", "checkout.session.completed").await.unwrap());
        assert!(!store.claim("evt_1", "checkout.session.completed").await.unwrap());
        store.release("evt_1").await.unwrap();
        assert!(store.claim("evt_1", "checkout.session.completed").await.unwrap());
    }
}

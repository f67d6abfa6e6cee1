//! Order persistence.
//!
//! The order document is the single source of truth. Writes are
//! compare-and-swap on the order's revision, and carry the outbox entries
//! produced by the same mutation so both land together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::Order;
use crate::outbox::OutboxEntry;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("order {0} not found")]
    NotFound(String),

    #[error("order {order_id} changed concurrently (expected revision {expected})")]
    RevisionConflict { order_id: String, expected: u64 },

    #[error("storage backend: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self { Self::Backend(e.to_string()) }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self { Self::Backend(e.to_string()) }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get(&self, order_id: &str) -> Result<Order, StoreError>;

    /// Persists a new order at revision 1.
    async fn create(&self, order: &Order, effects: &[OutboxEntry]) -> Result<Order, StoreError>;

    /// Replaces the stored order if its revision still equals
    /// `order.revision()`, bumping it by one.
    async fn update(&self, order: &Order, effects: &[OutboxEntry]) -> Result<Order, StoreError>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Pending entries due at `now`, each leased for `lease` so that
    /// concurrent workers do not pick up the same entry.
    async fn claim_due(&self, now: DateTime<Utc>, lease: Duration, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    async fn mark_delivered(&self, entry_id: Uuid) -> Result<(), StoreError>;

    /// Counts a failed attempt. `next_attempt_at = None` abandons the entry.
    async fn record_failure(&self, entry_id: Uuid, error: &str, next_attempt_at: Option<DateTime<Utc>>) -> Result<(), StoreError>;
}

/// Processed-event ledger for gateway webhooks.
#[async_trait]
pub trait WebhookLedger: Send + Sync {
    /// Records `event_id`; false if it was already recorded.
    async fn claim(&self, event_id: &str, event_type: &str) -> Result<bool, StoreError>;

    /// Forgets a claim whose processing failed, so a redelivery can retry.
    async fn release(&self, event_id: &str) -> Result<(), StoreError>;
}

//! PostgreSQL store: one JSONB document per order plus outbox and webhook tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use super::{OrderStore, OutboxStore, StoreError, WebhookLedger};
use crate::domain::aggregates::Order;
use crate::outbox::{OutboxEntry, OutboxStatus, SideEffect};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    revision: i64,
    document: Json<Order>,
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    order_id: String,
    effect: Json<SideEffect>,
    status: String,
    attempts: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxEntry {
    type Error = StoreError;
    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            effect: row.effect.0,
            status: row.status.parse::<OutboxStatus>().map_err(|s| StoreError::Backend(format!("unknown outbox status {s}")))?,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

fn revision_to_db(revision: u64) -> Result<i64, StoreError> {
    i64::try_from(revision).map_err(|_| StoreError::Backend(format!("revision {revision} out of range")))
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await.map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn insert_outbox(tx: &mut Transaction<'_, Postgres>, effects: &[OutboxEntry]) -> Result<(), StoreError> {
        for entry in effects {
            sqlx::query(
                "INSERT INTO order_outbox (id, order_id, effect, status, attempts, next_attempt_at, last_error, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(entry.id)
            .bind(&entry.order_id)
            .bind(Json(&entry.effect))
            .bind(entry.status.as_str())
            .bind(i32::try_from(entry.attempts).unwrap_or(i32::MAX))
            .bind(entry.next_attempt_at)
            .bind(&entry.last_error)
            .bind(entry.created_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn get(&self, order_id: &str) -> Result<Order, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT revision, document FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(order_id.to_string()))?;
        let mut order = row.document.0;
        order.set_revision(u64::try_from(row.revision).unwrap_or(0));
        Ok(order)
    }

    async fn create(&self, order: &Order, effects: &[OutboxEntry]) -> Result<Order, StoreError> {
        let mut stored = order.clone();
        stored.take_events();
        stored.set_revision(1);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO orders (id, buyer_id, vendor_id, revision, document, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(stored.id())
        .bind(stored.buyer_id())
        .bind(stored.vendor_id())
        .bind(1_i64)
        .bind(Json(&stored))
        .bind(stored.created_at())
        .bind(stored.updated_at())
        .execute(&mut *tx)
        .await?;
        Self::insert_outbox(&mut tx, effects).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn update(&self, order: &Order, effects: &[OutboxEntry]) -> Result<Order, StoreError> {
        let expected = order.revision();
        let mut stored = order.clone();
        stored.take_events();
        stored.set_revision(expected + 1);

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE orders SET document = $1, revision = $2, updated_at = $3
             WHERE id = $4 AND revision = $5",
        )
        .bind(Json(&stored))
        .bind(revision_to_db(expected + 1)?)
        .bind(stored.updated_at())
        .bind(stored.id())
        .bind(revision_to_db(expected)?)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<(i64,)> = sqlx::query_as("SELECT revision FROM orders WHERE id = $1")
                .bind(stored.id())
                .fetch_optional(&mut *tx)
                .await?;
            return Err(match exists {
                None => StoreError::NotFound(stored.id().to_string()),
                Some(_) => StoreError::RevisionConflict { order_id: stored.id().to_string(), expected },
            });
        }
        Self::insert_outbox(&mut tx, effects).await?;
        tx.commit().await?;
        Ok(stored)
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn claim_due(&self, now: DateTime<Utc>, lease: Duration, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let lease_until = now + chrono::Duration::from_std(lease).map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows = sqlx::query_as::<_, OutboxRow>(
            "UPDATE order_outbox SET next_attempt_at = $1
             WHERE id IN (
                 SELECT id FROM order_outbox
                 WHERE status = 'pending' AND next_attempt_at <= $2
                 ORDER BY created_at
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, order_id, effect, status, attempts, next_attempt_at, last_error, created_at",
        )
        .bind(lease_until)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OutboxEntry::try_from).collect()
    }

    async fn mark_delivered(&self, entry_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE order_outbox SET status = 'delivered', attempts = attempts + 1, delivered_at = NOW() WHERE id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_failure(&self, entry_id: Uuid, error: &str, next_attempt_at: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        let (status, next) = match next_attempt_at {
            Some(at) => (OutboxStatus::Pending, at),
            None => (OutboxStatus::Abandoned, Utc::now()),
        };
        sqlx::query(
            "UPDATE order_outbox SET attempts = attempts + 1, last_error = $1, status = $2, next_attempt_at = $3
             WHERE id = $4",
        )
        .bind(error)
        .bind(status.as_str())
        .bind(next)
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WebhookLedger for PgStore {
    async fn claim(&self, event_id: &str, event_type: &str) -> Result<bool, StoreError> {
        // INSERT first and check rows_affected; no separate existence check.
        let result = sqlx::query(
            "INSERT INTO processed_webhook_events (event_id, event_type, processed_at)
             VALUES ($1, $2, NOW()) ON CONFLICT DO NOTHING",
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, event_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM processed_webhook_events WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

//! Durable side effects.
//!
//! Calls into services this engine does not own are recorded next to the
//! order write that caused them, attempted once inline, and retried by
//! [`OutboxWorker`] until they land or run out of attempts. The primary
//! order mutation never waits on, or rolls back because of, any of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::clients::{CartClient, ClientError, EarningsClient, InventoryClient, LedgerClient};
use crate::domain::value_objects::Money;
use crate::store::OutboxStore;

/// How long an entry stays reserved for whoever is dispatching it.
pub const DISPATCH_LEASE: Duration = Duration::from_secs(60);
const BACKOFF_BASE_SECS: u64 = 2;
const BACKOFF_CAP_SECS: u64 = 600;
const CLAIM_BATCH: usize = 50;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffect {
    DecrementStock { product_id: String, quantity: u32, variant_index: u32 },
    ClearCart {
        buyer_id: String,
        #[serde(skip_serializing, default)]
        auth_token: Option<String>,
    },
    RecordEarning {
        order_id: String,
        #[serde(skip_serializing, default)]
        auth_token: Option<String>,
    },
    CreditRefund {
        buyer_id: String,
        amount: Money,
        memo: String,
        #[serde(skip_serializing, default)]
        auth_token: Option<String>,
    },
}

impl SideEffect {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DecrementStock { .. } => "decrement_stock",
            Self::ClearCart { .. } => "clear_cart",
            Self::RecordEarning { .. } => "record_earning",
            Self::CreditRefund { .. } => "credit_refund",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus { Pending, Delivered, Abandoned }

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Pending => "pending", Self::Delivered => "delivered", Self::Abandoned => "abandoned" }
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub order_id: String,
    pub effect: SideEffect,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    /// New entries start leased to the inline dispatcher.
    pub fn new(order_id: impl Into<String>, effect: SideEffect) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            order_id: order_id.into(),
            effect,
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: now + lease(),
            last_error: None,
            created_at: now,
        }
    }
}

fn lease() -> chrono::Duration {
    chrono::Duration::from_std(DISPATCH_LEASE).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

/// Delay before retry number `attempts` (1-based): 2s, 4s, 8s … capped at 10 min.
pub fn backoff(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(20);
    Duration::from_secs((BACKOFF_BASE_SECS << exp).min(BACKOFF_CAP_SECS))
}

/// The clients a side effect can target.
#[derive(Clone)]
pub struct SideEffectClients {
    pub ledger: Arc<dyn LedgerClient>,
    pub inventory: Arc<dyn InventoryClient>,
    pub earnings: Arc<dyn EarningsClient>,
    pub cart: Arc<dyn CartClient>,
}

/// Runs side effects against their clients and books the outcome.
#[derive(Clone)]
pub struct Dispatcher {
    clients: SideEffectClients,
    outbox: Arc<dyn OutboxStore>,
    timeout: Duration,
    max_attempts: u32,
}

impl Dispatcher {
    pub fn new(clients: SideEffectClients, outbox: Arc<dyn OutboxStore>, timeout: Duration, max_attempts: u32) -> Self {
        Self { clients, outbox, timeout, max_attempts: max_attempts.max(1) }
    }

    async fn invoke(&self, effect: &SideEffect) -> Result<(), ClientError> {
        let call = async {
            match effect {
                SideEffect::DecrementStock { product_id, quantity, variant_index } => {
                    self.clients.inventory.decrement_variant_stock(product_id, *quantity, *variant_index).await
                }
                SideEffect::ClearCart { buyer_id, auth_token } => {
                    self.clients.cart.clear_cart(buyer_id, auth_token.as_deref()).await
                }
                SideEffect::RecordEarning { order_id, auth_token } => {
                    self.clients.earnings.record_delivery_earning(order_id, auth_token.as_deref()).await
                }
                SideEffect::CreditRefund { buyer_id, amount, memo, auth_token } => {
                    match self.clients.ledger.credit(buyer_id, amount, memo, auth_token.as_deref()).await {
                        Ok(true) => Ok(()),
                        Ok(false) => Err(ClientError::Rejected { status: 0, body: "wallet refused credit".into() }),
                        Err(e) => Err(e),
                    }
                }
            }
        };
        tokio::time::timeout(self.timeout, call).await.map_err(|_| ClientError::Timeout)?
    }

    /// One attempt at `entry`. Failures are logged and booked for retry,
    /// never returned.
    pub async fn dispatch(&self, entry: &OutboxEntry) -> bool {
        let effect = entry.effect.name();
        match self.invoke(&entry.effect).await {
            Ok(()) => {
                if let Err(e) = self.outbox.mark_delivered(entry.id).await {
                    tracing::warn!(entry_id = %entry.id, effect, error = %e, "Failed to mark outbox entry delivered");
                }
                tracing::debug!(entry_id = %entry.id, order_id = %entry.order_id, effect, "Side effect delivered");
                true
            }
            Err(err) => {
                let attempts = entry.attempts + 1;
                let next = if attempts >= self.max_attempts {
                    tracing::error!(entry_id = %entry.id, order_id = %entry.order_id, effect, attempts, error = %err, "Side effect abandoned");
                    None
                } else {
                    tracing::warn!(entry_id = %entry.id, order_id = %entry.order_id, effect, attempts, error = %err, "Side effect failed, will retry");
                    chrono::Duration::from_std(backoff(attempts)).ok().map(|d| Utc::now() + d)
                };
                if let Err(e) = self.outbox.record_failure(entry.id, &err.to_string(), next).await {
                    tracing::warn!(entry_id = %entry.id, effect, error = %e, "Failed to record outbox failure");
                }
                false
            }
        }
    }

    /// Inline pass right after the order write. Entries are independent.
    pub async fn dispatch_all(&self, entries: &[OutboxEntry]) {
        for entry in entries {
            self.dispatch(entry).await;
        }
    }

    /// Claims and dispatches whatever is due. Returns how many were tried.
    pub async fn run_due(&self) -> usize {
        let entries = match self.outbox.claim_due(Utc::now(), DISPATCH_LEASE, CLAIM_BATCH).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to claim outbox entries");
                return 0;
            }
        };
        self.dispatch_all(&entries).await;
        entries.len()
    }
}

/// Background loop that drains the outbox.
pub struct OutboxWorker {
    dispatcher: Dispatcher,
    poll_interval: Duration,
}

impl OutboxWorker {
    pub fn new(dispatcher: Dispatcher, poll_interval: Duration) -> Self { Self { dispatcher, poll_interval } }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(poll_secs = self.poll_interval.as_secs(), "Outbox worker started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let n = self.dispatcher.run_due().await;
                    if n > 0 { tracing::debug!(count = n, "Outbox pass finished"); }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                }
            }
        }
        tracing::info!("Outbox worker stopped");
    }
}

//! Order lifecycle and payment orchestration.
//!
//! Every operation follows the same shape: authenticate and authorize the
//! actor, load the order, let the aggregate apply the change, write it back
//! together with any outbox entries, then dispatch those entries once and
//! publish the raised events. Only the first four steps can fail the call.

use std::future::Future;
use std::sync::Arc;

use crate::clients::{ClientError, LedgerClient, PaymentGateway};
use crate::config::EngineConfig;
use crate::domain::aggregates::Order;
use crate::domain::value_objects::Actor;
use crate::outbox::{Dispatcher, OutboxEntry, SideEffectClients};
use crate::publisher::EventPublisher;
use crate::store::{OrderStore, OutboxStore, WebhookLedger};
use crate::{EngineError, ForbiddenReason, Result};

mod lifecycle;
mod payment;
mod returns;

pub use lifecycle::{AddressRequest, CreateOrderRequest, OrderItemRequest, TransitionRequest};
pub use payment::{PaymentInitiation, WebhookOutcome};
pub use returns::{ProcessReturnRequest, ReturnRequestBody};

/// Collaborators the engine is wired with.
#[derive(Clone)]
pub struct EngineDeps {
    pub orders: Arc<dyn OrderStore>,
    pub outbox: Arc<dyn OutboxStore>,
    pub webhooks: Arc<dyn WebhookLedger>,
    pub clients: SideEffectClients,
    pub gateway: Arc<dyn PaymentGateway>,
    pub publisher: Arc<dyn EventPublisher>,
}

#[derive(Clone)]
pub struct OrderEngine {
    orders: Arc<dyn OrderStore>,
    webhooks: Arc<dyn WebhookLedger>,
    ledger: Arc<dyn LedgerClient>,
    gateway: Arc<dyn PaymentGateway>,
    publisher: Arc<dyn EventPublisher>,
    dispatcher: Dispatcher,
    config: EngineConfig,
}

impl OrderEngine {
    pub fn new(deps: EngineDeps, config: EngineConfig) -> Self {
        let dispatcher = Dispatcher::new(deps.clients.clone(), deps.outbox, config.client_timeout, config.outbox_max_attempts);
        Self {
            orders: deps.orders,
            webhooks: deps.webhooks,
            ledger: deps.clients.ledger,
            gateway: deps.gateway,
            publisher: deps.publisher,
            dispatcher,
            config,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher { &self.dispatcher }

    pub fn config(&self) -> &EngineConfig { &self.config }

    /// Reads an order. Visible to its buyer, its vendor, its rider and admins.
    pub async fn get_order(&self, order_id: &str, actor: Option<&Actor>) -> Result<Order> {
        let actor = require_actor(actor)?;
        let order = self.orders.get(order_id).await?;
        let visible = actor.id == order.buyer_id()
            || actor.acts_for_vendor(order.vendor_id())
            || (actor.logistics_id.is_some() && actor.logistics_id.as_deref() == order.logistics_id());
        if !visible {
            return Err(EngineError::Forbidden(ForbiddenReason::NotOrderOwner));
        }
        Ok(order)
    }

    async fn load(&self, order_id: &str) -> Result<Order> {
        Ok(self.orders.get(order_id).await?)
    }

    /// Writes a new order with its outbox entries, then runs the post-commit steps.
    async fn commit_new(&self, mut order: Order, effects: Vec<OutboxEntry>) -> Result<Order> {
        let events = order.take_events();
        let stored = self.orders.create(&order, &effects).await?;
        self.after_commit(events, &effects).await;
        Ok(stored)
    }

    /// Compare-and-swap write of a loaded order, then the post-commit steps.
    async fn commit(&self, mut order: Order, effects: Vec<OutboxEntry>) -> Result<Order> {
        let events = order.take_events();
        let stored = self.orders.update(&order, &effects).await?;
        self.after_commit(events, &effects).await;
        Ok(stored)
    }

    async fn after_commit(&self, events: Vec<crate::domain::events::OrderEvent>, effects: &[OutboxEntry]) {
        self.dispatcher.dispatch_all(effects).await;
        for event in &events {
            self.publisher.publish(event).await;
        }
    }

    /// Bounds a primary-path client call by the configured timeout.
    async fn bounded<T>(&self, call: impl Future<Output = std::result::Result<T, ClientError>>) -> std::result::Result<T, ClientError> {
        tokio::time::timeout(self.config.client_timeout, call).await.map_err(|_| ClientError::Timeout)?
    }
}

fn require_actor(actor: Option<&Actor>) -> Result<&Actor> {
    actor.ok_or(EngineError::Unauthorized)
}

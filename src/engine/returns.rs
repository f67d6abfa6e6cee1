//! Return requests and refunds.

use rust_decimal::Decimal;
use serde::Deserialize;

use super::{require_actor, OrderEngine};
use crate::domain::aggregates::{Order, OrderError, PaymentStatus, ReturnStatus};
use crate::domain::value_objects::Actor;
use crate::outbox::{OutboxEntry, SideEffect};
use crate::{EngineError, ForbiddenReason, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ReturnRequestBody {
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReturnRequest {
    pub status: String,
    /// Defaults to the order total.
    pub refund_amount: Option<Decimal>,
}

impl OrderEngine {
    pub async fn request_return(&self, order_id: &str, reason: &str, actor: Option<&Actor>) -> Result<Order> {
        let actor = require_actor(actor)?;
        let mut order = self.load(order_id).await?;
        if actor.id != order.buyer_id() {
            return Err(EngineError::Forbidden(ForbiddenReason::NotOrderOwner));
        }
        order.request_return(reason)?;
        let stored = self.commit(order, vec![]).await?;
        tracing::info!(order_id, buyer_id = %actor.id, "Return requested");
        Ok(stored)
    }

    /// Approves, rejects or refunds a return. A refund cancels the order and
    /// marks it UNPAID; if the order had been PAID it also queues the wallet
    /// credit, whose failure does not fail the call.
    pub async fn process_return(&self, order_id: &str, request: ProcessReturnRequest, actor: Option<&Actor>) -> Result<Order> {
        let new_status: ReturnStatus = request.status.parse().map_err(EngineError::InvalidStatus)?;
        if new_status == ReturnStatus::Pending {
            return Err(EngineError::InvalidStatus(request.status));
        }
        let actor = require_actor(actor)?;
        let mut order = self.load(order_id).await?;
        if !actor.acts_for_vendor(order.vendor_id()) {
            return Err(EngineError::Forbidden(ForbiddenReason::VendorMismatch));
        }

        let was_paid = order.payment_status() == PaymentStatus::Paid;
        let refund = order.process_return(new_status, request.refund_amount, &actor.id).map_err(|e| match e {
            OrderError::ReturnNotFound => EngineError::ReturnNotFound(order_id.to_string()),
            other => other.into(),
        })?;

        let mut effects = Vec::new();
        // Nothing was collected from an unpaid order, so nothing goes back.
        if let Some(amount) = refund.filter(|m| was_paid && m.amount() > Decimal::ZERO) {
            effects.push(OutboxEntry::new(order.id(), SideEffect::CreditRefund {
                buyer_id: order.buyer_id().to_string(),
                amount,
                memo: format!("Refund for order {order_id}"),
                auth_token: actor.auth_token.clone(),
            }));
        }

        let stored = self.commit(order, effects).await?;
        tracing::info!(order_id, status = new_status.as_str(), processed_by = %actor.id, "Return processed");
        Ok(stored)
    }
}

//! Payment initiation and gateway webhooks.

use uuid::Uuid;

use super::{require_actor, OrderEngine};
use crate::domain::aggregates::{Order, OrderError, PaymentMethod};
use crate::domain::value_objects::Actor;
use crate::{EngineError, ForbiddenReason, Result};

#[derive(Debug, Clone)]
pub struct PaymentInitiation {
    pub order: Order,
    /// Hosted checkout page, for card payments only.
    pub checkout_url: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    Applied(Box<Order>),
    /// The event id was processed before.
    Duplicate,
    /// Verified, but nothing to change.
    Ignored(&'static str),
}

fn synthetic_reference(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::now_v7().simple()).to_uppercase()
}

fn success_url(base: &str, order_id: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}order_id={order_id}&session_id={{CHECKOUT_SESSION_ID}}")
}

impl OrderEngine {
    /// Starts payment for an order with the given method.
    ///
    /// WALLET settles immediately; CARD returns a hosted checkout URL and
    /// waits for the webhook; BANK/TRANSFER/USSD/COD stay PENDING.
    pub async fn initiate_payment(&self, order_id: &str, method: &str, actor: Option<&Actor>) -> Result<PaymentInitiation> {
        let method: PaymentMethod = method.parse().map_err(EngineError::InvalidMethod)?;
        let actor = require_actor(actor)?;
        let mut order = self.load(order_id).await?;
        if actor.id != order.buyer_id() && !actor.is_admin() {
            return Err(EngineError::Forbidden(ForbiddenReason::NotOrderOwner));
        }
        order.ensure_payable()?;

        match method {
            PaymentMethod::Wallet => self.pay_from_wallet(order, actor).await,
            PaymentMethod::Card => {
                let success = success_url(&self.config.checkout_success_url, order.id());
                let session = self
                    .bounded(self.gateway.create_checkout_session(order.id(), order.total_amount(), &success, &self.config.checkout_cancel_url))
                    .await
                    .map_err(|e| {
                        tracing::warn!(order_id, error = %e, "Checkout session creation failed");
                        EngineError::GatewayError(e.to_string())
                    })?;
                order.await_payment(PaymentMethod::Card, None)?;
                let order = self.commit(order, vec![]).await?;
                tracing::info!(order_id, session_id = %session.session_id, "Card checkout started");
                Ok(PaymentInitiation { order, checkout_url: Some(session.url), session_id: Some(session.session_id) })
            }
            PaymentMethod::Bank | PaymentMethod::Transfer | PaymentMethod::Ussd => {
                order.await_payment(method, Some(synthetic_reference("MAN")))?;
                let order = self.commit(order, vec![]).await?;
                tracing::info!(order_id, method = %method, "Awaiting manual payment confirmation");
                Ok(PaymentInitiation { order, checkout_url: None, session_id: None })
            }
            PaymentMethod::Cod => {
                order.await_payment(PaymentMethod::Cod, None)?;
                let order = self.commit(order, vec![]).await?;
                tracing::info!(order_id, "Cash on delivery selected");
                Ok(PaymentInitiation { order, checkout_url: None, session_id: None })
            }
        }
    }

    async fn pay_from_wallet(&self, mut order: Order, actor: &Actor) -> Result<PaymentInitiation> {
        let order_id = order.id().to_string();
        let amount = order.total_amount().clone();
        let token = actor.auth_token.as_deref();

        match self.bounded(self.ledger.debit(order.buyer_id(), &amount, token)).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(order_id = %order_id, amount = %amount, "Wallet debit refused");
                return Err(EngineError::InsufficientFunds);
            }
            Err(e) => {
                tracing::warn!(order_id = %order_id, error = %e, "Wallet debit failed");
                return Err(EngineError::LedgerUnavailable(e.to_string()));
            }
        }

        let buyer_id = order.buyer_id().to_string();
        order.settle_payment(PaymentMethod::Wallet, synthetic_reference("WLT"))?;
        match self.commit(order, vec![]).await {
            Ok(order) => {
                tracing::info!(order_id = %order_id, amount = %amount, "Order paid from wallet");
                Ok(PaymentInitiation { order, checkout_url: None, session_id: None })
            }
            Err(err) => {
                // The debit landed but the order did not: hand the money back.
                let memo = format!("Reversal of payment for order {order_id}");
                match self.bounded(self.ledger.credit(&buyer_id, &amount, &memo, token)).await {
                    Ok(true) => tracing::warn!(order_id = %order_id, error = %err, "Order write failed after wallet debit; debit reversed"),
                    outcome => tracing::error!(order_id = %order_id, error = %err, reversal = ?outcome, "Order write failed after wallet debit; reversal did not land"),
                }
                Err(err)
            }
        }
    }

    /// Applies a signed gateway webhook.
    ///
    /// Each event id is applied at most once. A checkout completion marks
    /// the referenced order PAID with the payment intent as transaction id.
    pub async fn handle_payment_webhook(&self, payload: &[u8], signature_header: &str) -> Result<WebhookOutcome> {
        let event = self.gateway.verify_webhook_signature(payload, signature_header).map_err(|e| {
            tracing::warn!(error = %e, "Webhook signature verification failed");
            EngineError::InvalidSignature(e.to_string())
        })?;
        tracing::info!(event_id = %event.id, event_type = %event.event_type, "Received payment webhook");

        if !event.is_checkout_completed() {
            return Ok(WebhookOutcome::Ignored("unhandled event type"));
        }
        if !self.webhooks.claim(&event.id, &event.event_type).await? {
            tracing::info!(event_id = %event.id, "Duplicate webhook event, skipping");
            return Ok(WebhookOutcome::Duplicate);
        }

        let Some(order_id) = event.order_id() else {
            tracing::warn!(event_id = %event.id, "Checkout completion carries no order id");
            return Ok(WebhookOutcome::Ignored("no order reference"));
        };
        let transaction_id = event
            .payment_intent()
            .or_else(|| event.data.object["id"].as_str().map(String::from))
            .unwrap_or_else(|| event.id.clone());

        match self.settle_from_webhook(&order_id, transaction_id).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let Err(e) = self.webhooks.release(&event.id).await {
                    tracing::warn!(event_id = %event.id, error = %e, "Failed to release webhook claim");
                }
                Err(err)
            }
        }
    }

    async fn settle_from_webhook(&self, order_id: &str, transaction_id: String) -> Result<WebhookOutcome> {
        let mut order = match self.load(order_id).await {
            Ok(order) => order,
            Err(EngineError::OrderNotFound(_)) => {
                tracing::warn!(order_id, "Webhook references unknown order");
                return Ok(WebhookOutcome::Ignored("unknown order"));
            }
            Err(e) => return Err(e),
        };
        match order.settle_payment(PaymentMethod::Card, transaction_id) {
            Ok(true) => {}
            Ok(false) => return Ok(WebhookOutcome::Ignored("already paid")),
            Err(OrderError::PaymentClosed) => {
                tracing::warn!(order_id, "Payment confirmed for a refunded order");
                return Ok(WebhookOutcome::Ignored("order refunded"));
            }
            Err(e) => return Err(e.into()),
        }
        let order = self.commit(order, vec![]).await?;
        tracing::info!(order_id, transaction_id = order.transaction_id().unwrap_or_default(), "Card payment confirmed");
        Ok(WebhookOutcome::Applied(Box::new(order)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_url_embeds_order() {
        assert_eq!(
            success_url("https://shop.example/paid", "ord-1"),
            "https://shop.example/paid?order_id=ord-1&session_id={CHECKOUT_SESSION_ID}"
        );
        assert!(success_url("https://shop.example/paid?src=app", "ord-1").contains("?src=app&order_id=ord-1"));
    }

    #[test]
    fn test_synthetic_reference_prefix() {
        let r = synthetic_reference("WLT");
        assert!(r.starts_with("WLT-"));
        assert_eq!(r.len(), 4 + 32);
    }
}

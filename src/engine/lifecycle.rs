//! Order creation and fulfillment transitions.

use rust_decimal::Decimal;
use serde::Deserialize;
use validator::{Validate, ValidationError};

use super::{require_actor, OrderEngine};
use crate::domain::aggregates::{Address, FulfillmentStatus, LineItem, NewOrder, Order, PaymentMethod, PaymentStatus};
use crate::domain::value_objects::{Actor, Money};
use crate::outbox::{OutboxEntry, SideEffect};
use crate::{EngineError, ForbiddenReason, Result};

const MAX_ITEMS: usize = 100;
const MAX_UNIT_PRICE: i64 = 1_000_000_000;

fn non_negative(value: &Decimal) -> std::result::Result<(), ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(ValidationError::new("negative_amount"));
    }
    Ok(())
}

fn unit_price_in_range(value: &Decimal) -> std::result::Result<(), ValidationError> {
    non_negative(value)?;
    if *value > Decimal::from(MAX_UNIT_PRICE) {
        return Err(ValidationError::new("unit_price_too_large"));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemRequest {
    #[validate(length(min = 1))]
    pub product_id: String,
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(custom = "unit_price_in_range")]
    pub unit_price: Decimal,
    #[validate(range(min = 1, max = 1000))]
    pub quantity: u32,
    #[serde(default)]
    pub variant_index: u32,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddressRequest {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(length(min = 7, max = 20))]
    pub phone: String,
    #[validate(length(min = 1))]
    pub street1: String,
    pub street2: Option<String>,
    #[validate(length(min = 1))]
    pub city: String,
    pub state: Option<String>,
    #[validate(length(min = 2))]
    pub country: String,
}

impl From<AddressRequest> for Address {
    fn from(r: AddressRequest) -> Self {
        Address { name: r.name, phone: r.phone, street1: r.street1, street2: r.street2, city: r.city, state: r.state, country: r.country }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    /// Admins entering an order on a buyer's behalf; defaults to the caller.
    #[validate(length(min = 1))]
    pub buyer_id: Option<String>,
    #[validate(length(min = 1))]
    pub vendor_id: String,
    #[validate]
    pub items: Vec<OrderItemRequest>,
    #[validate]
    pub shipping_address: AddressRequest,
    pub payment_method: Option<String>,
    /// Manual entry only; admins may record an order as already settled.
    pub payment_status: Option<PaymentStatus>,
    pub coupon_code: Option<String>,
    #[serde(default)]
    #[validate(custom = "non_negative")]
    pub discount: Decimal,
    pub total_amount: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRequest {
    pub status: String,
    pub order_progress: Option<String>,
    pub logistics_id: Option<String>,
}

impl TransitionRequest {
    pub fn to(status: FulfillmentStatus) -> Self {
        Self { status: status.as_str().to_string(), order_progress: None, logistics_id: None }
    }
}

impl OrderEngine {
    /// Places an order for the calling buyer, or for `buyer_id` when an
    /// admin enters it.
    ///
    /// Stock decrements (one per line) and cart clearing are queued in the
    /// same write and attempted right after it; their failures never fail
    /// the order.
    pub async fn create_order(&self, request: CreateOrderRequest, actor: Option<&Actor>) -> Result<Order> {
        let actor = require_actor(actor)?;
        request.validate()?;
        if request.items.len() > MAX_ITEMS {
            return Err(EngineError::ValidationFailed(format!("at most {MAX_ITEMS} items per order")));
        }
        let payment_method = request
            .payment_method
            .as_deref()
            .map(|m| m.parse::<PaymentMethod>().map_err(EngineError::InvalidMethod))
            .transpose()?;
        if matches!(request.payment_status, Some(s) if s != PaymentStatus::Pending) && !actor.is_admin() {
            return Err(EngineError::ValidationFailed("paymentStatus may only be set by an admin".into()));
        }
        let buyer_id = match request.buyer_id {
            Some(id) if id != actor.id && !actor.is_admin() => {
                return Err(EngineError::Forbidden(ForbiddenReason::NotOrderOwner));
            }
            Some(id) => id,
            None => actor.id.clone(),
        };

        let currency = self.config.currency.as_str();
        let items: Vec<LineItem> = request
            .items
            .into_iter()
            .map(|i| LineItem {
                product_id: i.product_id,
                name: i.name,
                unit_price: Money::new(i.unit_price, currency),
                quantity: i.quantity,
                variant_index: i.variant_index,
            })
            .collect();

        let order = Order::place(NewOrder {
            buyer_id,
            vendor_id: request.vendor_id,
            items,
            shipping_address: request.shipping_address.into(),
            payment_method,
            payment_status: request.payment_status,
            coupon_code: request.coupon_code.filter(|c| !c.trim().is_empty()),
            discount: request.discount,
            claimed_total: request.total_amount,
            currency: currency.to_string(),
        })?;

        let mut effects: Vec<OutboxEntry> = order
            .items()
            .iter()
            .map(|item| {
                OutboxEntry::new(order.id(), SideEffect::DecrementStock {
                    product_id: item.product_id.clone(),
                    quantity: item.quantity,
                    variant_index: item.variant_index,
                })
            })
            .collect();
        // Orders entered for someone else did not come from their cart.
        if order.buyer_id() == actor.id {
            effects.push(OutboxEntry::new(order.id(), SideEffect::ClearCart {
                buyer_id: actor.id.clone(),
                auth_token: actor.auth_token.clone(),
            }));
        }

        let stored = self.commit_new(order, effects).await?;
        tracing::info!(order_id = stored.id(), buyer_id = stored.buyer_id(), total = %stored.total_amount(), "Order created");
        Ok(stored)
    }

    /// Moves an order to `request.status`.
    ///
    /// `assigned`/`dispatched` are for the order's vendor (or an admin);
    /// `delivered`/`canceled` only for the rider bound to the order.
    pub async fn transition_status(&self, order_id: &str, request: TransitionRequest, actor: Option<&Actor>) -> Result<Order> {
        let target: FulfillmentStatus = request.status.parse().map_err(EngineError::InvalidStatus)?;
        let actor = require_actor(actor)?;
        let mut order = self.load(order_id).await?;
        authorize_transition(&order, target, actor)?;

        let change = order.transition(
            target,
            request.order_progress,
            request.logistics_id,
            &actor.id,
            self.config.delivery_window,
        )?;

        let mut effects = Vec::new();
        if target == FulfillmentStatus::Delivered {
            effects.push(OutboxEntry::new(order.id(), SideEffect::RecordEarning {
                order_id: order.id().to_string(),
                auth_token: actor.auth_token.clone(),
            }));
        }

        let stored = self.commit(order, effects).await?;
        tracing::info!(order_id, from = %change.from, to = %change.to, actor_id = %actor.id, "Order status updated");
        Ok(stored)
    }
}

fn authorize_transition(order: &Order, target: FulfillmentStatus, actor: &Actor) -> Result<()> {
    match target {
        FulfillmentStatus::Assigned | FulfillmentStatus::Dispatched => {
            if !actor.acts_for_vendor(order.vendor_id()) {
                return Err(EngineError::Forbidden(ForbiddenReason::VendorMismatch));
            }
        }
        FulfillmentStatus::Delivered | FulfillmentStatus::Canceled => {
            let matches = matches!((actor.logistics_id.as_deref(), order.logistics_id()), (Some(a), Some(b)) if a == b);
            if !matches {
                return Err(EngineError::Forbidden(ForbiddenReason::LogisticsMismatch));
            }
        }
        // Nothing moves back to inprogress; the graph check rejects it.
        FulfillmentStatus::Inprogress => {}
    }
    Ok(())
}

//! Domain events
use crate::domain::aggregates::{FulfillmentStatus, PaymentMethod, ReturnStatus};
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    Created { order_id: String, buyer_id: String, total: Decimal },
    StatusChanged { order_id: String, from: FulfillmentStatus, to: FulfillmentStatus, actor_id: String },
    PaymentPending { order_id: String, method: PaymentMethod },
    Paid { order_id: String, method: PaymentMethod, transaction_id: String },
    ReturnRequested { order_id: String, buyer_id: String },
    ReturnProcessed { order_id: String, status: ReturnStatus, processed_by: String },
    Refunded { order_id: String, amount: Decimal },
}

impl OrderEvent {
    /// Subject suffix used when publishing, e.g. `orders.status_changed`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::StatusChanged { .. } => "status_changed",
            Self::PaymentPending { .. } => "payment_pending",
            Self::Paid { .. } => "paid",
            Self::ReturnRequested { .. } => "return_requested",
            Self::ReturnProcessed { .. } => "return_processed",
            Self::Refunded { .. } => "refunded",
        }
    }

    pub fn order_id(&self) -> &str {
        match self {
            Self::Created { order_id, .. }
            | Self::StatusChanged { order_id, .. }
            | Self::PaymentPending { order_id, .. }
            | Self::Paid { order_id, .. }
            | Self::ReturnRequested { order_id, .. }
            | Self::ReturnProcessed { order_id, .. }
            | Self::Refunded { order_id, .. } => order_id,
        }
    }
}

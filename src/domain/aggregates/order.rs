//! Order Aggregate
//!
//! Holds the fulfillment state machine, the payment axis and the embedded
//! return request. Authorization lives in the engine; everything here is
//! pure state and its invariants.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::value_objects::{AuthenticationCode, Money, MoneyError};
use crate::domain::events::OrderEvent;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    id: String,
    buyer_id: String,
    vendor_id: String,
    logistics_id: Option<String>,
    items: Vec<LineItem>,
    subtotal: Money,
    discount: Money,
    total_amount: Money,
    coupon_code: Option<String>,
    payment_method: Option<PaymentMethod>,
    payment_status: PaymentStatus,
    transaction_id: Option<String>,
    status: FulfillmentStatus,
    delivery_status: DeliveryStatus,
    status_history: Vec<StatusHistoryEntry>,
    authentication_code: Option<AuthenticationCode>,
    order_progress: String,
    delivery_timeline: Option<String>,
    shipping_address: Address,
    is_return_requested: bool,
    return_request: Option<ReturnRequest>,
    revision: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    events: Vec<OrderEvent>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem { pub product_id: String, pub name: String, pub unit_price: Money, pub quantity: u32, pub variant_index: u32 }

impl LineItem {
    pub fn line_total(&self) -> Result<Money, MoneyError> { self.unit_price.multiply(self.quantity) }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address { pub name: String, pub phone: String, pub street1: String, pub street2: Option<String>, pub city: String, pub state: Option<String>, pub country: String }

/// One immutable line of the audit trail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry { pub status: FulfillmentStatus, pub timestamp: DateTime<Utc>, pub actor_id: String }

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnRequest {
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    pub status: ReturnStatus,
    pub refund_amount: Option<Money>,
    pub processed_by: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FulfillmentStatus { #[default] Inprogress, Assigned, Dispatched, Delivered, Canceled }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    #[default]
    Pending,
    #[serde(rename = "Out for Delivery")]
    OutForDelivery,
    Delivered,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentMethod { Wallet, Card, Bank, Transfer, Ussd, Cod }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus { #[default] Pending, Paid, Unpaid }

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnStatus { Pending, Approved, Rejected, Refunded }

impl FulfillmentStatus {
    pub const ALL: [FulfillmentStatus; 5] = [Self::Inprogress, Self::Assigned, Self::Dispatched, Self::Delivered, Self::Canceled];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inprogress => "inprogress",
            Self::Assigned => "assigned",
            Self::Dispatched => "dispatched",
            Self::Delivered => "delivered",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool { matches!(self, Self::Delivered | Self::Canceled) }

    /// Customer-facing label derived from the fulfillment state.
    pub fn delivery_status(&self) -> DeliveryStatus {
        match self {
            Self::Inprogress => DeliveryStatus::Pending,
            Self::Assigned | Self::Dispatched => DeliveryStatus::OutForDelivery,
            Self::Delivered => DeliveryStatus::Delivered,
            Self::Canceled => DeliveryStatus::Failed,
        }
    }

    pub fn can_transition_to(&self, target: FulfillmentStatus) -> bool {
        use FulfillmentStatus::*;
        matches!(
            (self, target),
            (Inprogress, Assigned) | (Inprogress, Canceled)
                | (Assigned, Assigned) | (Assigned, Dispatched) | (Assigned, Canceled)
                | (Dispatched, Delivered) | (Dispatched, Canceled)
        )
    }
}

impl std::fmt::Display for FulfillmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

impl std::str::FromStr for FulfillmentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|status| status.as_str() == s).ok_or_else(|| s.to_string())
    }
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Pending => "Pending", Self::OutForDelivery => "Out for Delivery", Self::Delivered => "Delivered", Self::Failed => "Failed" }
    }
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Wallet => "WALLET", Self::Card => "CARD", Self::Bank => "BANK", Self::Transfer => "TRANSFER", Self::Ussd => "USSD", Self::Cod => "COD" }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

impl std::str::FromStr for PaymentMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WALLET" => Ok(Self::Wallet),
            "CARD" => Ok(Self::Card),
            "BANK" => Ok(Self::Bank),
            "TRANSFER" => Ok(Self::Transfer),
            "USSD" => Ok(Self::Ussd),
            "COD" => Ok(Self::Cod),
            _ => Err(s.to_string()),
        }
    }
}

impl ReturnStatus {
    // Approved and Rejected share a rank: neither can follow the other.
    fn rank(&self) -> u8 {
        match self { Self::Pending => 0, Self::Approved | Self::Rejected => 1, Self::Refunded => 2 }
    }

    pub fn as_str(&self) -> &'static str {
        match self { Self::Pending => "Pending", Self::Approved => "Approved", Self::Rejected => "Rejected", Self::Refunded => "Refunded" }
    }
}

impl std::str::FromStr for ReturnStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Approved" => Ok(Self::Approved),
            "Rejected" => Ok(Self::Rejected),
            "Refunded" => Ok(Self::Refunded),
            _ => Err(s.to_string()),
        }
    }
}

/// Input to [`Order::place`].
#[derive(Clone, Debug)]
pub struct NewOrder {
    pub buyer_id: String,
    pub vendor_id: String,
    pub items: Vec<LineItem>,
    pub shipping_address: Address,
    pub payment_method: Option<PaymentMethod>,
    /// Only set for legacy or manually entered orders.
    pub payment_status: Option<PaymentStatus>,
    pub coupon_code: Option<String>,
    pub discount: Decimal,
    /// Total the client computed; checked against the server-side total.
    pub claimed_total: Option<Decimal>,
    pub currency: String,
}

/// What a successful `transition` changed, for logging and side effects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition { pub from: FulfillmentStatus, pub to: FulfillmentStatus }

impl Order {
    pub fn place(draft: NewOrder) -> Result<Self, OrderError> {
        if draft.items.is_empty() { return Err(OrderError::NoItems); }
        if draft.items.iter().any(|i| i.quantity == 0) { return Err(OrderError::InvalidQuantity); }
        if draft.discount.is_sign_negative() && !draft.discount.is_zero() { return Err(OrderError::InvalidDiscount); }
        let currency = draft.currency.as_str();
        let subtotal = draft.items.iter().try_fold(Money::zero(currency), |acc, i| acc.add(&i.line_total()?))?;
        let discount = Money::new(draft.discount, currency);
        let total = subtotal.saturating_sub(&discount)?;
        if let Some(claimed) = draft.claimed_total {
            if claimed != total.amount() {
                return Err(OrderError::TotalMismatch { claimed, derived: total.amount() });
            }
        }

        let id = Uuid::now_v7().to_string();
        let now = Utc::now();
        let mut order = Self {
            id: id.clone(), buyer_id: draft.buyer_id, vendor_id: draft.vendor_id, logistics_id: None,
            items: draft.items, subtotal, discount, total_amount: total, coupon_code: draft.coupon_code,
            payment_method: draft.payment_method, payment_status: draft.payment_status.unwrap_or_default(),
            transaction_id: None, status: FulfillmentStatus::Inprogress, delivery_status: DeliveryStatus::Pending,
            status_history: vec![], authentication_code: None, order_progress: "Awaiting Confirmation".into(),
            delivery_timeline: None, shipping_address: draft.shipping_address, is_return_requested: false,
            return_request: None, revision: 0, created_at: now, updated_at: now, events: vec![],
        };
        order.raise_event(OrderEvent::Created { order_id: id, buyer_id: order.buyer_id.clone(), total: order.total_amount.amount() });
        Ok(order)
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn buyer_id(&self) -> &str { &self.buyer_id }
    pub fn vendor_id(&self) -> &str { &self.vendor_id }
    pub fn logistics_id(&self) -> Option<&str> { self.logistics_id.as_deref() }
    pub fn items(&self) -> &[LineItem] { &self.items }
    pub fn subtotal(&self) -> &Money { &self.subtotal }
    pub fn discount(&self) -> &Money { &self.discount }
    pub fn total_amount(&self) -> &Money { &self.total_amount }
    pub fn coupon_code(&self) -> Option<&str> { self.coupon_code.as_deref() }
    pub fn payment_method(&self) -> Option<PaymentMethod> { self.payment_method }
    pub fn payment_status(&self) -> PaymentStatus { self.payment_status }
    pub fn transaction_id(&self) -> Option<&str> { self.transaction_id.as_deref() }
    pub fn status(&self) -> FulfillmentStatus { self.status }
    pub fn delivery_status(&self) -> DeliveryStatus { self.delivery_status }
    pub fn status_history(&self) -> &[StatusHistoryEntry] { &self.status_history }
    pub fn authentication_code(&self) -> Option<&AuthenticationCode> { self.authentication_code.as_ref() }
    pub fn order_progress(&self) -> &str { &self.order_progress }
    pub fn delivery_timeline(&self) -> Option<&str> { self.delivery_timeline.as_deref() }
    pub fn shipping_address(&self) -> &Address { &self.shipping_address }
    pub fn is_return_requested(&self) -> bool { self.is_return_requested }
    pub fn return_request(&self) -> Option<&ReturnRequest> { self.return_request.as_ref() }
    pub fn revision(&self) -> u64 { self.revision }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

    /// Moves the order along the fulfillment graph and appends to history.
    ///
    /// Entering `assigned` binds the logistics agent (once), and writes the
    /// authentication code and delivery timeline (once).
    pub fn transition(
        &mut self,
        target: FulfillmentStatus,
        progress_label: Option<String>,
        logistics_id: Option<String>,
        actor_id: &str,
        delivery_window: Duration,
    ) -> Result<Transition, OrderError> {
        if !self.status.can_transition_to(target) {
            return Err(OrderError::InvalidTransition { from: self.status, to: target });
        }
        if target == FulfillmentStatus::Assigned {
            let logistics_id = logistics_id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty());
            match (&self.logistics_id, logistics_id) {
                (None, None) => return Err(OrderError::LogisticsRequired),
                (None, Some(agent)) => self.logistics_id = Some(agent),
                (Some(current), Some(agent)) if *current != agent => return Err(OrderError::LogisticsAlreadyAssigned),
                (Some(_), _) => {}
            }
            if self.authentication_code.is_none() {
                self.authentication_code = Some(AuthenticationCode::generate());
            }
            if self.delivery_timeline.is_none() {
                let eta = Utc::now() + delivery_window;
                self.delivery_timeline = Some(format!("Expected by {}", eta.format("%Y-%m-%d %H:%M UTC")));
            }
        }

        let from = self.status;
        self.apply_status(target, actor_id);
        self.order_progress = progress_label
            .filter(|label| !label.trim().is_empty())
            .unwrap_or_else(|| format!("Order marked as {target}"));
        Ok(Transition { from, to: target })
    }

    /// Records a confirmed payment. Returns false when the order was already
    /// paid; the first transaction id is kept.
    pub fn settle_payment(&mut self, method: PaymentMethod, transaction_id: impl Into<String>) -> Result<bool, OrderError> {
        match self.payment_status {
            PaymentStatus::Paid => return Ok(false),
            PaymentStatus::Unpaid => return Err(OrderError::PaymentClosed),
            PaymentStatus::Pending => {}
        }
        let transaction_id = transaction_id.into();
        self.payment_method = Some(method);
        self.payment_status = PaymentStatus::Paid;
        self.transaction_id = Some(transaction_id.clone());
        self.touch();
        self.raise_event(OrderEvent::Paid { order_id: self.id.clone(), method, transaction_id });
        Ok(true)
    }

    /// Selects a payment method whose confirmation arrives later.
    pub fn await_payment(&mut self, method: PaymentMethod, transaction_id: Option<String>) -> Result<(), OrderError> {
        self.ensure_payable()?;
        self.payment_method = Some(method);
        self.payment_status = PaymentStatus::Pending;
        if transaction_id.is_some() { self.transaction_id = transaction_id; }
        self.touch();
        self.raise_event(OrderEvent::PaymentPending { order_id: self.id.clone(), method });
        Ok(())
    }

    pub fn ensure_payable(&self) -> Result<(), OrderError> {
        if self.payment_status == PaymentStatus::Paid { return Err(OrderError::AlreadyPaid); }
        if self.status == FulfillmentStatus::Canceled { return Err(OrderError::OrderCanceled); }
        Ok(())
    }

    pub fn request_return(&mut self, reason: &str) -> Result<(), OrderError> {
        if self.is_return_requested { return Err(OrderError::ReturnAlreadyRequested); }
        let reason = reason.trim();
        if reason.is_empty() { return Err(OrderError::EmptyReason); }
        self.is_return_requested = true;
        self.return_request = Some(ReturnRequest {
            reason: reason.to_string(), requested_at: Utc::now(), status: ReturnStatus::Pending,
            refund_amount: None, processed_by: None, processed_at: None,
        });
        self.touch();
        self.raise_event(OrderEvent::ReturnRequested { order_id: self.id.clone(), buyer_id: self.buyer_id.clone() });
        Ok(())
    }

    /// Advances the return request. On `Refunded` the order is canceled and
    /// marked UNPAID, and the amount to credit back is returned.
    pub fn process_return(&mut self, new_status: ReturnStatus, refund_amount: Option<Decimal>, processed_by: &str) -> Result<Option<Money>, OrderError> {
        let current = self.return_request.as_ref().ok_or(OrderError::ReturnNotFound)?.status;
        if new_status.rank() <= current.rank() {
            return Err(OrderError::ReturnAlreadyProcessed { from: current, to: new_status });
        }
        let refund = match refund_amount {
            Some(amount) => Money::new(amount, self.total_amount.currency()),
            None => self.total_amount.clone(),
        };
        if refund.amount() < Decimal::ZERO || refund.amount() > self.total_amount.amount() {
            return Err(OrderError::InvalidRefundAmount(refund.amount()));
        }

        if let Some(request) = self.return_request.as_mut() {
            request.status = new_status;
            request.refund_amount = Some(refund.clone());
            request.processed_by = Some(processed_by.to_string());
            request.processed_at = Some(Utc::now());
        }
        self.raise_event(OrderEvent::ReturnProcessed { order_id: self.id.clone(), status: new_status, processed_by: processed_by.to_string() });

        if new_status != ReturnStatus::Refunded {
            self.touch();
            return Ok(None);
        }
        self.payment_status = PaymentStatus::Unpaid;
        if self.status != FulfillmentStatus::Canceled {
            self.apply_status(FulfillmentStatus::Canceled, processed_by);
        }
        self.order_progress = "Order refunded".into();
        self.raise_event(OrderEvent::Refunded { order_id: self.id.clone(), amount: refund.amount() });
        Ok(Some(refund))
    }

    fn apply_status(&mut self, target: FulfillmentStatus, actor_id: &str) {
        let from = self.status;
        let now = Utc::now();
        self.status_history.push(StatusHistoryEntry { status: target, timestamp: now, actor_id: actor_id.to_string() });
        self.status = target;
        self.delivery_status = target.delivery_status();
        self.updated_at = now;
        self.raise_event(OrderEvent::StatusChanged { order_id: self.id.clone(), from, to: target, actor_id: actor_id.to_string() });
    }

    /// Store hook: stamps the revision a write produced.
    pub(crate) fn set_revision(&mut self, revision: u64) { self.revision = revision; }

    pub fn take_events(&mut self) -> Vec<OrderEvent> { std::mem::take(&mut self.events) }
    fn raise_event(&mut self, e: OrderEvent) { self.events.push(e); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

/// Rebuilds `(status, deliveryStatus)` from an audit trail.
pub fn replay_history(history: &[StatusHistoryEntry]) -> (FulfillmentStatus, DeliveryStatus) {
    let status = history.iter().fold(FulfillmentStatus::Inprogress, |_, entry| entry.status);
    (status, status.delivery_status())
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderError {
    NoItems,
    InvalidQuantity,
    InvalidDiscount,
    CurrencyMismatch,
    AmountOverflow,
    TotalMismatch { claimed: Decimal, derived: Decimal },
    InvalidTransition { from: FulfillmentStatus, to: FulfillmentStatus },
    LogisticsRequired,
    LogisticsAlreadyAssigned,
    AlreadyPaid,
    PaymentClosed,
    OrderCanceled,
    ReturnAlreadyRequested,
    ReturnNotFound,
    ReturnAlreadyProcessed { from: ReturnStatus, to: ReturnStatus },
    InvalidRefundAmount(Decimal),
    EmptyReason,
}

impl From<MoneyError> for OrderError {
    fn from(e: MoneyError) -> Self {
        match e {
            MoneyError::CurrencyMismatch => Self::CurrencyMismatch,
            MoneyError::Overflow => Self::AmountOverflow,
        }
    }
}

impl std::error::Error for OrderError {}
impl std::fmt::Display for OrderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoItems => write!(f, "Order has no items"),
            Self::InvalidQuantity => write!(f, "Item quantity must be at least 1"),
            Self::InvalidDiscount => write!(f, "Discount cannot be negative"),
            Self::CurrencyMismatch => write!(f, "Currency mismatch"),
            Self::AmountOverflow => write!(f, "Order amount out of range"),
            Self::TotalMismatch { claimed, derived } => write!(f, "Total {claimed} does not match computed total {derived}"),
            Self::InvalidTransition { from, to } => write!(f, "Cannot move order from {from} to {to}"),
            Self::LogisticsRequired => write!(f, "A logistics agent must be assigned"),
            Self::LogisticsAlreadyAssigned => write!(f, "Order already has a different logistics agent"),
            Self::AlreadyPaid => write!(f, "Order is already paid"),
            Self::PaymentClosed => write!(f, "Order payment was refunded"),
            Self::OrderCanceled => write!(f, "Order is canceled"),
            Self::ReturnAlreadyRequested => write!(f, "Return already requested"),
            Self::ReturnNotFound => write!(f, "No return request on this order"),
            Self::ReturnAlreadyProcessed { from, to } => write!(f, "Return cannot move from {} to {}", from.as_str(), to.as_str()),
            Self::InvalidRefundAmount(amount) => write!(f, "Invalid refund amount {amount}"),
            Self::EmptyReason => write!(f, "Return reason is required"),
        }
    }
}

//! Leaf clients for services this engine does not own.
//!
//! Every call is a single attempt. Retrying is the outbox worker's job, not
//! the client's.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::value_objects::Money;

pub mod http;
pub mod stripe;

pub use http::{HttpCartClient, HttpEarningsClient, HttpInventoryClient, HttpLedgerClient, RestClient};
pub use stripe::{CheckoutSession, GatewayEvent, SignatureError, StripeGateway};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() { Self::Timeout } else { Self::Transport(e.to_string()) }
    }
}

/// Wallet service. `Ok(false)` means the wallet refused the movement
/// (e.g. balance too low); `Err` means the answer is unknown.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn debit(&self, buyer_id: &str, amount: &Money, auth_token: Option<&str>) -> Result<bool, ClientError>;
    async fn credit(&self, buyer_id: &str, amount: &Money, memo: &str, auth_token: Option<&str>) -> Result<bool, ClientError>;
}

/// Product service stock keeping.
#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn decrement_variant_stock(&self, product_id: &str, quantity: u32, variant_index: u32) -> Result<(), ClientError>;
}

/// Logistics service rider earnings.
#[async_trait]
pub trait EarningsClient: Send + Sync {
    async fn record_delivery_earning(&self, order_id: &str, auth_token: Option<&str>) -> Result<(), ClientError>;
}

/// Cart service; the buyer's cart is emptied once an order is placed.
#[async_trait]
pub trait CartClient: Send + Sync {
    async fn clear_cart(&self, buyer_id: &str, auth_token: Option<&str>) -> Result<(), ClientError>;
}

/// Hosted card checkout provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(
        &self,
        order_id: &str,
        amount: &Money,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutSession, ClientError>;

    /// Authenticates a raw webhook body and parses it into an event.
    fn verify_webhook_signature(&self, payload: &[u8], signature_header: &str) -> Result<GatewayEvent, SignatureError>;
}

//! Grocer Orders
//!
//! Order lifecycle and payment orchestration for a grocery delivery platform.
//!
//! ## Features
//! - Fulfillment state machine with role and ownership gating
//! - Wallet, card (hosted checkout), bank/transfer/USSD and cash-on-delivery payments
//! - Signed payment webhooks with at-most-once application
//! - Return requests and refunds back to the buyer's wallet
//! - Outbox-backed side effects on inventory, cart, ledger and logistics services

use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

pub mod api;
pub mod clients;
pub mod config;
pub mod domain;
pub mod engine;
pub mod outbox;
pub mod publisher;
pub mod store;

pub use config::{Config, EngineConfig};
pub use domain::aggregates::{Order, OrderError};
pub use domain::value_objects::{Actor, ActorRole};
pub use engine::OrderEngine;

// =============================================================================
// Error Types
// =============================================================================

/// Why an authenticated actor was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ForbiddenReason {
    VendorMismatch,
    LogisticsMismatch,
    NotOrderOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictReason {
    AlreadyRequested,
    ReturnAlreadyProcessed,
    AlreadyPaid,
    LogisticsAlreadyAssigned,
    ConcurrentModification,
}

impl std::fmt::Display for ForbiddenReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::VendorMismatch => "vendorMismatch",
            Self::LogisticsMismatch => "logisticsMismatch",
            Self::NotOrderOwner => "notOrderOwner",
        })
    }
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::AlreadyRequested => "alreadyRequested",
            Self::ReturnAlreadyProcessed => "returnAlreadyProcessed",
            Self::AlreadyPaid => "alreadyPaid",
            Self::LogisticsAlreadyAssigned => "logisticsAlreadyAssigned",
            Self::ConcurrentModification => "concurrentModification",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Return request not found for order {0}")]
    ReturnNotFound(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid payment method: {0}")]
    InvalidMethod(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(ForbiddenReason),

    #[error("Conflict: {0}")]
    Conflict(ConflictReason),

    #[error("Insufficient wallet balance")]
    InsufficientFunds,

    #[error("Wallet service unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Payment gateway error: {0}")]
    GatewayError(String),

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),
}

impl EngineError {
    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::ReturnNotFound(_) => "RETURN_NOT_FOUND",
            Self::InvalidStatus(_) => "INVALID_STATUS",
            Self::InvalidMethod(_) => "INVALID_METHOD",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::LedgerUnavailable(_) => "LEDGER_UNAVAILABLE",
            Self::GatewayError(_) => "GATEWAY_ERROR",
            Self::InvalidSignature(_) => "INVALID_SIGNATURE",
            Self::PersistenceFailed(_) => "PERSISTENCE_FAILED",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::ValidationFailed(_)
            | Self::InvalidStatus(_)
            | Self::InvalidMethod(_)
            | Self::InvalidSignature(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::OrderNotFound(_) | Self::ReturnNotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::LedgerUnavailable(_) | Self::GatewayError(_) => StatusCode::BAD_GATEWAY,
            Self::PersistenceFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<OrderError> for EngineError {
    fn from(e: OrderError) -> Self {
        match e {
            OrderError::InvalidTransition { .. } | OrderError::OrderCanceled | OrderError::PaymentClosed => {
                Self::InvalidStatus(e.to_string())
            }
            OrderError::LogisticsAlreadyAssigned => Self::Conflict(ConflictReason::LogisticsAlreadyAssigned),
            OrderError::AlreadyPaid => Self::Conflict(ConflictReason::AlreadyPaid),
            OrderError::ReturnAlreadyRequested => Self::Conflict(ConflictReason::AlreadyRequested),
            OrderError::ReturnAlreadyProcessed { .. } => Self::Conflict(ConflictReason::ReturnAlreadyProcessed),
            OrderError::NoItems
            | OrderError::InvalidQuantity
            | OrderError::InvalidDiscount
            | OrderError::CurrencyMismatch
            | OrderError::AmountOverflow
            | OrderError::TotalMismatch { .. }
            | OrderError::LogisticsRequired
            | OrderError::InvalidRefundAmount(_)
            | OrderError::EmptyReason => Self::ValidationFailed(e.to_string()),
            // Callers with the order id at hand map this themselves.
            OrderError::ReturnNotFound => Self::ReturnNotFound(String::new()),
        }
    }
}

impl From<store::StoreError> for EngineError {
    fn from(e: store::StoreError) -> Self {
        match e {
            store::StoreError::NotFound(id) => Self::OrderNotFound(id),
            store::StoreError::RevisionConflict { .. } => Self::Conflict(ConflictReason::ConcurrentModification),
            store::StoreError::Backend(msg) => Self::PersistenceFailed(msg),
        }
    }
}

impl From<validator::ValidationErrors> for EngineError {
    fn from(e: validator::ValidationErrors) -> Self { Self::ValidationFailed(e.to_string()) }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(EngineError::Unauthorized.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(EngineError::Forbidden(ForbiddenReason::LogisticsMismatch).http_status(), StatusCode::FORBIDDEN);
        assert_eq!(EngineError::OrderNotFound("o".into()).http_status(), StatusCode::NOT_FOUND);
        assert_eq!(EngineError::Conflict(ConflictReason::AlreadyRequested).http_status(), StatusCode::CONFLICT);
        assert_eq!(EngineError::PersistenceFailed("db".into()).http_status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_order_error_mapping() {
        let e: EngineError = OrderError::ReturnAlreadyRequested.into();
        assert_eq!(e, EngineError::Conflict(ConflictReason::AlreadyRequested));
        let e: EngineError = OrderError::NoItems.into();
        assert_eq!(e.code(), "VALIDATION_FAILED");
    }
}

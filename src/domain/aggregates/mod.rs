//! Aggregates module
pub mod order;

pub use order::{
    replay_history, Address, DeliveryStatus, FulfillmentStatus, LineItem, NewOrder, Order, OrderError,
    PaymentMethod, PaymentStatus, ReturnRequest, ReturnStatus, StatusHistoryEntry, Transition,
};

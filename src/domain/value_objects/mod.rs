//! Value Objects for the order engine

use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Money value object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money { amount: Decimal, currency: String }

impl Money {
    pub fn new(amount: Decimal, currency: &str) -> Self { Self { amount, currency: currency.to_string() } }
    pub fn zero(currency: &str) -> Self { Self::new(Decimal::ZERO, currency) }
    pub fn amount(&self) -> Decimal { self.amount }
    pub fn currency(&self) -> &str { &self.currency }
    pub fn is_negative(&self) -> bool { self.amount.is_sign_negative() && !self.amount.is_zero() }
    pub fn add(&self, other: &Money) -> Result<Money, MoneyError> {
        if self.currency != other.currency { return Err(MoneyError::CurrencyMismatch); }
        let amount = self.amount.checked_add(other.amount).ok_or(MoneyError::Overflow)?;
        Ok(Money::new(amount, &self.currency))
    }
    /// Subtracts, clamping at zero. Discounts never push a total negative.
    pub fn saturating_sub(&self, other: &Money) -> Result<Money, MoneyError> {
        if self.currency != other.currency { return Err(MoneyError::CurrencyMismatch); }
        Ok(Money::new((self.amount - other.amount).max(Decimal::ZERO), &self.currency))
    }
    pub fn multiply(&self, qty: u32) -> Result<Money, MoneyError> {
        let amount = self.amount.checked_mul(Decimal::from(qty)).ok_or(MoneyError::Overflow)?;
        Ok(Money::new(amount, &self.currency))
    }
    /// Amount in minor units (kobo, cents), rounded half away from zero.
    pub fn minor_units(&self) -> Option<i64> {
        use rust_decimal::prelude::ToPrimitive;
        use rust_decimal::RoundingStrategy;
        self.amount.checked_mul(Decimal::from(100))?.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero).to_i64()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{} {:.2}", self.currency, self.amount) }
}

#[derive(Debug, Clone, PartialEq, Eq)] pub enum MoneyError { CurrencyMismatch, Overflow }
impl std::error::Error for MoneyError {}
impl fmt::Display for MoneyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CurrencyMismatch => write!(f, "Currency mismatch"),
            Self::Overflow => write!(f, "Amount out of range"),
        }
    }
}

/// Four digit code handed to the buyer and checked by the rider at drop-off.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthenticationCode(String);

impl AuthenticationCode {
    pub fn generate() -> Self { Self(rand::thread_rng().gen_range(1000..=9999).to_string()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for AuthenticationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole { Buyer, Vendor, Logistics, Admin }

impl std::str::FromStr for ActorRole {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buyer" | "user" | "customer" => Ok(Self::Buyer),
            "vendor" | "store" => Ok(Self::Vendor),
            "logistics" | "rider" => Ok(Self::Logistics),
            "admin" => Ok(Self::Admin),
            _ => Err(()),
        }
    }
}

/// The authenticated caller of an engine operation.
///
/// Identity is always passed in explicitly; the engine never looks it up from
/// ambient request state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: ActorRole,
    pub vendor_id: Option<String>,
    pub logistics_id: Option<String>,
    /// Bearer token forwarded to downstream services on the actor's behalf.
    pub auth_token: Option<String>,
}

impl Actor {
    pub fn buyer(id: impl Into<String>) -> Self {
        Self { id: id.into(), role: ActorRole::Buyer, vendor_id: None, logistics_id: None, auth_token: None }
    }
    pub fn vendor(id: impl Into<String>, vendor_id: impl Into<String>) -> Self {
        Self { id: id.into(), role: ActorRole::Vendor, vendor_id: Some(vendor_id.into()), logistics_id: None, auth_token: None }
    }
    pub fn logistics(id: impl Into<String>, logistics_id: impl Into<String>) -> Self {
        Self { id: id.into(), role: ActorRole::Logistics, vendor_id: None, logistics_id: Some(logistics_id.into()), auth_token: None }
    }
    pub fn admin(id: impl Into<String>) -> Self {
        Self { id: id.into(), role: ActorRole::Admin, vendor_id: None, logistics_id: None, auth_token: None }
    }
    pub fn with_token(mut self, token: impl Into<String>) -> Self { self.auth_token = Some(token.into()); self }
    pub fn is_admin(&self) -> bool { self.role == ActorRole::Admin }

    /// Vendor staff acting for `vendor_id`, or platform admin.
    pub fn acts_for_vendor(&self, vendor_id: &str) -> bool {
        self.is_admin() || (self.role == ActorRole::Vendor && self.vendor_id.as_deref() == Some(vendor_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_money_saturating_sub() {
        let a = Money::new(Decimal::new(500, 2), "NGN");
        let b = Money::new(Decimal::new(800, 2), "NGN");
        assert_eq!(a.saturating_sub(&b).unwrap().amount(), Decimal::ZERO);
        assert_eq!(b.saturating_sub(&a).unwrap().amount(), Decimal::new(300, 2));
        assert_eq!(a.add(&Money::zero("USD")), Err(MoneyError::CurrencyMismatch));
    }
    #[test]
    fn test_arithmetic_overflow_is_an_error() {
        let huge = Money::new(Decimal::MAX, "NGN");
        assert_eq!(huge.multiply(2), Err(MoneyError::Overflow));
        assert_eq!(huge.add(&Money::new(Decimal::ONE, "NGN")), Err(MoneyError::Overflow));
        assert_eq!(huge.minor_units(), None);
        assert_eq!(Money::new(Decimal::new(300, 2), "NGN").multiply(2).unwrap().amount(), Decimal::new(600, 2));
    }
    #[test]
    fn test_minor_units() {
        assert_eq!(Money::new(Decimal::new(1105, 2), "USD").minor_units(), Some(1105));
        assert_eq!(Money::new(Decimal::new(10005, 3), "USD").minor_units(), Some(1001));
    }
    #[test]
    fn test_authentication_code_is_four_digits() {
        for _ in 0..200 {
            let code = AuthenticationCode::generate();
            assert_eq!(code.as_str().len(), 4);
            assert!(code.as_str().chars().all(|c| c.is_ascii_digit()));
            assert_ne!(code.as_str().as_bytes()[0], b'0');
        }
    }
    #[test]
    fn test_vendor_scope() {
        assert!(Actor::vendor("u1", "store-1").acts_for_vendor("store-1"));
        assert!(!Actor::vendor("u1", "store-2").acts_for_vendor("store-1"));
        assert!(Actor::admin("root").acts_for_vendor("store-1"));
        assert!(!Actor::buyer("b1").acts_for_vendor("store-1"));
    }
}

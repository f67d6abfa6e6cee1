//! Stripe Checkout integration via REST API (no SDK dependency)

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

use super::{ClientError, PaymentGateway};
use crate::domain::value_objects::Money;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub session_id: String,
    pub url: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed signature header")]
    MalformedHeader,
    #[error("signature mismatch")]
    Mismatch,
    #[error("timestamp outside tolerance")]
    Expired,
    #[error("payload is not a valid event: {0}")]
    InvalidPayload(String),
}

/// A verified webhook event.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: EventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub object: serde_json::Value,
}

impl GatewayEvent {
    pub fn is_checkout_completed(&self) -> bool { self.event_type == CHECKOUT_COMPLETED }

    /// Order id carried in the success redirect URL, falling back to the
    /// session's client reference.
    pub fn order_id(&self) -> Option<String> {
        let obj = &self.data.object;
        obj["success_url"]
            .as_str()
            .and_then(|raw| reqwest::Url::parse(raw).ok())
            .and_then(|url| url.query_pairs().find(|(k, _)| k == "order_id").map(|(_, v)| v.into_owned()))
            .filter(|id| !id.is_empty())
            .or_else(|| obj["client_reference_id"].as_str().map(String::from))
            .or_else(|| obj["metadata"]["order_id"].as_str().map(String::from))
    }

    pub fn payment_intent(&self) -> Option<String> {
        self.data.object["payment_intent"].as_str().map(String::from)
    }
}

/// Verify Stripe webhook signature (HMAC-SHA256) and parse the event.
///
/// `now` is unix seconds; events whose signed timestamp is further than
/// `tolerance` from it are rejected to stop replays.
pub fn verify_webhook_signature(
    payload: &[u8],
    sig_header: &str,
    secret: &str,
    tolerance: Duration,
    now: i64,
) -> Result<GatewayEvent, SignatureError> {
    let mut timestamp = "";
    let mut signatures = Vec::new();
    for part in sig_header.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = t;
        } else if let Some(v) = part.strip_prefix("v1=") {
            signatures.push(v);
        }
    }
    if timestamp.is_empty() || signatures.is_empty() {
        return Err(SignatureError::MalformedHeader);
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::MalformedHeader)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);

    // Several v1 entries appear while a secret is being rolled.
    let matched = signatures.iter().any(|sig| {
        hex::decode(sig).map(|bytes| mac.clone().verify_slice(&bytes).is_ok()).unwrap_or(false)
    });
    if !matched {
        return Err(SignatureError::Mismatch);
    }

    let ts: i64 = timestamp.parse().map_err(|_| SignatureError::MalformedHeader)?;
    if (now - ts).unsigned_abs() > tolerance.as_secs() {
        return Err(SignatureError::Expired);
    }

    serde_json::from_slice(payload).map_err(|e| SignatureError::InvalidPayload(e.to_string()))
}

pub struct StripeGateway {
    http: reqwest::Client,
    api_base: String,
    secret_key: String,
    webhook_secret: String,
    tolerance: Duration,
}

impl StripeGateway {
    pub fn new(
        api_base: impl Into<String>,
        secret_key: impl Into<String>,
        webhook_secret: impl Into<String>,
        timeout: Duration,
        tolerance: Duration,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
            webhook_secret: webhook_secret.into(),
            tolerance,
        })
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout_session(
        &self,
        order_id: &str,
        amount: &Money,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutSession, ClientError> {
        let unit_amount = amount
            .minor_units()
            .ok_or_else(|| ClientError::InvalidResponse(format!("amount {amount} out of range")))?
            .to_string();
        let currency = amount.currency().to_ascii_lowercase();
        let product_name = format!("Grocery order {order_id}");

        let resp = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&[
                ("mode", "payment"),
                ("line_items[0][price_data][currency]", currency.as_str()),
                ("line_items[0][price_data][unit_amount]", unit_amount.as_str()),
                ("line_items[0][price_data][product_data][name]", product_name.as_str()),
                ("line_items[0][quantity]", "1"),
                ("success_url", success_url),
                ("cancel_url", cancel_url),
                ("client_reference_id", order_id),
                ("metadata[order_id]", order_id),
            ])
            .send()
            .await?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error").to_string();
            return Err(ClientError::Rejected { status: status.as_u16(), body: message });
        }
        match (body["id"].as_str(), body["url"].as_str()) {
            (Some(id), Some(url)) => Ok(CheckoutSession { session_id: id.to_string(), url: url.to_string() }),
            _ => Err(ClientError::InvalidResponse(format!("checkout session missing id/url: {body}"))),
        }
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature_header: &str) -> Result<GatewayEvent, SignatureError> {
        verify_webhook_signature(payload, signature_header, &self.webhook_secret, self.tolerance, chrono::Utc::now().timestamp())
    }
}

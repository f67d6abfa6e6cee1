//! REST implementations of the leaf clients.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use std::time::Duration;

use super::{CartClient, ClientError, EarningsClient, InventoryClient, LedgerClient};
use crate::domain::value_objects::Money;

/// Shared HTTP plumbing: base URL, timeout and bearer auth.
#[derive(Clone, Debug)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    service_token: Option<String>,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration, service_token: Option<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url: base_url.into().trim_end_matches('/').to_string(), service_token })
    }

    fn url(&self, path: &str) -> String { format!("{}{}", self.base_url, path) }

    fn authorize(&self, req: reqwest::RequestBuilder, auth_token: Option<&str>) -> reqwest::RequestBuilder {
        match auth_token.or(self.service_token.as_deref()) {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, auth_token: Option<&str>) -> Result<reqwest::Response, ClientError> {
        Ok(self.authorize(req, auth_token).send().await?)
    }

    async fn expect_success(resp: reqwest::Response) -> Result<(), ClientError> {
        let status = resp.status();
        if status.is_success() { return Ok(()); }
        let body = resp.text().await.unwrap_or_default();
        Err(ClientError::Rejected { status: status.as_u16(), body })
    }
}

/// Maps a wallet response onto the accepted/refused/unknown split.
async fn ledger_outcome(resp: reqwest::Response) -> Result<bool, ClientError> {
    match resp.status() {
        s if s.is_success() => Ok(true),
        StatusCode::BAD_REQUEST | StatusCode::PAYMENT_REQUIRED | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!(body = %body, "Wallet refused movement");
            Ok(false)
        }
        status => {
            let body = resp.text().await.unwrap_or_default();
            Err(ClientError::Rejected { status: status.as_u16(), body })
        }
    }
}

pub struct HttpLedgerClient { rest: RestClient }

impl HttpLedgerClient {
    pub fn new(rest: RestClient) -> Self { Self { rest } }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn debit(&self, buyer_id: &str, amount: &Money, auth_token: Option<&str>) -> Result<bool, ClientError> {
        let req = self.rest.http.post(self.rest.url("/wallet/debit")).json(&json!({
            "userId": buyer_id,
            "amount": amount.amount(),
            "currency": amount.currency(),
        }));
        ledger_outcome(self.rest.send(req, auth_token).await?).await
    }

    async fn credit(&self, buyer_id: &str, amount: &Money, memo: &str, auth_token: Option<&str>) -> Result<bool, ClientError> {
        let req = self.rest.http.post(self.rest.url("/wallet/credit")).json(&json!({
            "userId": buyer_id,
            "amount": amount.amount(),
            "currency": amount.currency(),
            "memo": memo,
        }));
        ledger_outcome(self.rest.send(req, auth_token).await?).await
    }
}

pub struct HttpInventoryClient { rest: RestClient }

impl HttpInventoryClient {
    pub fn new(rest: RestClient) -> Self { Self { rest } }
}

#[async_trait]
impl InventoryClient for HttpInventoryClient {
    async fn decrement_variant_stock(&self, product_id: &str, quantity: u32, variant_index: u32) -> Result<(), ClientError> {
        let path = format!("/products/{product_id}/variants/{variant_index}/stock");
        let req = self.rest.http.patch(self.rest.url(&path)).json(&json!({ "decrement": quantity }));
        RestClient::expect_success(self.rest.send(req, None).await?).await
    }
}

pub struct HttpEarningsClient { rest: RestClient }

impl HttpEarningsClient {
    pub fn new(rest: RestClient) -> Self { Self { rest } }
}

#[async_trait]
impl EarningsClient for HttpEarningsClient {
    async fn record_delivery_earning(&self, order_id: &str, auth_token: Option<&str>) -> Result<(), ClientError> {
        let req = self.rest.http.post(self.rest.url("/earnings")).json(&json!({ "orderId": order_id }));
        RestClient::expect_success(self.rest.send(req, auth_token).await?).await
    }
}

pub struct HttpCartClient { rest: RestClient }

impl HttpCartClient {
    pub fn new(rest: RestClient) -> Self { Self { rest } }
}

#[async_trait]
impl CartClient for HttpCartClient {
    async fn clear_cart(&self, buyer_id: &str, auth_token: Option<&str>) -> Result<(), ClientError> {
        let req = self.rest.http.delete(self.rest.url(&format!("/carts/{buyer_id}")));
        let resp = self.rest.send(req, auth_token).await?;
        // Nothing to clear is as good as cleared.
        if resp.status() == StatusCode::NOT_FOUND { return Ok(()); }
        RestClient::expect_success(resp).await
    }
}

//! HTTP surface over [`OrderEngine`].

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::domain::aggregates::Order;
use crate::domain::value_objects::{Actor, ActorRole};
use crate::engine::{CreateOrderRequest, OrderEngine, ProcessReturnRequest, ReturnRequestBody, TransitionRequest, WebhookOutcome};
use crate::EngineError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<OrderEngine>,
}

type ApiResult<T> = Result<T, EngineError>;

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.code(), "message": self.to_string() }))).into_response()
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
}

/// Builds the caller from the identity headers set by the API gateway.
/// No `x-user-id` means an anonymous caller.
pub fn actor_from_headers(headers: &HeaderMap) -> Option<Actor> {
    let id = header(headers, "x-user-id")?;
    let role = header(headers, "x-user-role").and_then(|r| r.parse::<ActorRole>().ok()).unwrap_or(ActorRole::Buyer);
    Some(Actor {
        id: id.to_string(),
        role,
        vendor_id: header(headers, "x-vendor-id").map(String::from),
        logistics_id: header(headers, "x-logistics-id").map(String::from),
        auth_token: header(headers, "authorization").and_then(|v| v.strip_prefix("Bearer ")).map(|t| t.trim().to_string()),
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(json!({"status": "healthy", "service": "grocer-orders"})) }))
        .route("/api/v1/orders", post(create_order))
        .route("/api/v1/orders/:id", get(get_order))
        .route("/api/v1/orders/:id/status", post(transition_status))
        .route("/api/v1/orders/:id/payment", post(initiate_payment))
        .route("/api/v1/orders/:id/return", post(request_return))
        .route("/api/v1/orders/:id/return/process", post(process_return))
        .route("/api/v1/payments/webhook", post(payment_webhook))
        .layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()).with_state(state)
}

async fn create_order(State(s): State<AppState>, headers: HeaderMap, Json(r): Json<CreateOrderRequest>) -> ApiResult<(StatusCode, Json<Order>)> {
    let order = s.engine.create_order(r, actor_from_headers(&headers).as_ref()).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn get_order(State(s): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> ApiResult<Json<Order>> {
    Ok(Json(s.engine.get_order(&id, actor_from_headers(&headers).as_ref()).await?))
}

async fn transition_status(State(s): State<AppState>, headers: HeaderMap, Path(id): Path<String>, Json(r): Json<TransitionRequest>) -> ApiResult<Json<Order>> {
    Ok(Json(s.engine.transition_status(&id, r, actor_from_headers(&headers).as_ref()).await?))
}

#[derive(Debug, Deserialize)] pub struct PaymentRequest { pub method: String }

async fn initiate_payment(State(s): State<AppState>, headers: HeaderMap, Path(id): Path<String>, Json(r): Json<PaymentRequest>) -> ApiResult<Json<serde_json::Value>> {
    let started = s.engine.initiate_payment(&id, &r.method, actor_from_headers(&headers).as_ref()).await?;
    Ok(Json(json!({ "order": started.order, "checkoutUrl": started.checkout_url, "sessionId": started.session_id })))
}

async fn payment_webhook(State(s): State<AppState>, headers: HeaderMap, body: Bytes) -> ApiResult<Json<serde_json::Value>> {
    let signature = header(&headers, "stripe-signature").ok_or_else(|| EngineError::InvalidSignature("missing stripe-signature header".into()))?;
    let outcome = match s.engine.handle_payment_webhook(&body, signature).await? {
        WebhookOutcome::Applied(order) => json!({ "received": true, "outcome": "applied", "orderId": order.id() }),
        WebhookOutcome::Duplicate => json!({ "received": true, "outcome": "duplicate" }),
        WebhookOutcome::Ignored(why) => json!({ "received": true, "outcome": "ignored", "reason": why }),
    };
    Ok(Json(outcome))
}

async fn request_return(State(s): State<AppState>, headers: HeaderMap, Path(id): Path<String>, Json(r): Json<ReturnRequestBody>) -> ApiResult<Json<Order>> {
    Ok(Json(s.engine.request_return(&id, &r.reason, actor_from_headers(&headers).as_ref()).await?))
}

async fn process_return(State(s): State<AppState>, headers: HeaderMap, Path(id): Path<String>, Json(r): Json<ProcessReturnRequest>) -> ApiResult<Json<Order>> {
    Ok(Json(s.engine.process_return(&id, r, actor_from_headers(&headers).as_ref()).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_actor_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(actor_from_headers(&headers).is_none());

        headers.insert("x-user-id", HeaderValue::from_static("rider-7"));
        headers.insert("x-user-role", HeaderValue::from_static("logistics"));
        headers.insert("x-logistics-id", HeaderValue::from_static("lg-1"));
        headers.insert("authorization", HeaderValue::from_static("Bearer abc123"));
        let actor = actor_from_headers(&headers).unwrap();
        assert_eq!(actor.role, ActorRole::Logistics);
        assert_eq!(actor.logistics_id.as_deref(), Some("lg-1"));
        assert_eq!(actor.auth_token.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_unknown_role_falls_back_to_buyer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("u1"));
        headers.insert("x-user-role", HeaderValue::from_static("superuser"));
        assert_eq!(actor_from_headers(&headers).unwrap().role, ActorRole::Buyer);
    }
}

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use grocer_orders::api::{self, AppState};
use grocer_orders::clients::{HttpCartClient, HttpEarningsClient, HttpInventoryClient, HttpLedgerClient, RestClient, StripeGateway};
use grocer_orders::engine::{EngineDeps, OrderEngine};
use grocer_orders::outbox::SideEffectClients;
use grocer_orders::publisher::LogPublisher;
use grocer_orders::store::InMemoryStore;
use grocer_orders::EngineConfig;

// Nothing in these tests reaches a leaf service, so the URLs never resolve.
fn app() -> axum::Router {
    let rest = || RestClient::new("http://unreachable.invalid", Duration::from_millis(50), None).unwrap();
    let store = Arc::new(InMemoryStore::new());
    let deps = EngineDeps {
        orders: store.clone(),
        outbox: store.clone(),
        webhooks: store,
        clients: SideEffectClients {
            ledger: Arc::new(HttpLedgerClient::new(rest())),
            inventory: Arc::new(HttpInventoryClient::new(rest())),
            earnings: Arc::new(HttpEarningsClient::new(rest())),
            cart: Arc::new(HttpCartClient::new(rest())),
        },
        gateway: Arc::new(
            StripeGateway::new("http://unreachable.invalid", "sk_test", "whsec_test", Duration::from_millis(50), Duration::from_secs(300)).unwrap(),
        ),
        publisher: Arc::new(LogPublisher),
    };
    api::router(AppState { engine: Arc::new(OrderEngine::new(deps, EngineConfig::default())) })
}

async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let resp = app().oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["status"], "healthy");
}

#[tokio::test]
async fn test_missing_identity_is_unauthorized() {
    let resp = app().oneshot(Request::get("/api/v1/orders/abc").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(resp).await["error"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_unknown_order_is_not_found() {
    let req = Request::get("/api/v1/orders/abc").header("x-user-id", "buyer-1").body(Body::empty()).unwrap();
    let resp = app().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(resp).await["error"], "ORDER_NOT_FOUND");
}

#[tokio::test]
async fn test_webhook_without_signature_is_rejected() {
    let req = Request::post("/api/v1/payments/webhook").body(Body::from("{}")).unwrap();
    let resp = app().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["error"], "INVALID_SIGNATURE");
}

#[tokio::test]
async fn test_create_order_returns_created() {
    let body = serde_json::json!({
        "vendorId": "store-1",
        "items": [{ "productId": "p1", "name": "Bread", "unitPrice": "2.50", "quantity": 2 }],
        "shippingAddress": { "name": "Ada", "phone": "08012345678", "street1": "1 Marina", "city": "Lagos", "country": "NG" }
    });
    let req = Request::post("/api/v1/orders")
        .header("content-type", "application/json")
        .header("x-user-id", "buyer-1")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let order = json_body(resp).await;
    assert_eq!(order["status"], "inprogress");
    assert_eq!(order["deliveryStatus"], "Pending");
    assert_eq!(order["paymentStatus"], "PENDING");
}

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use grocer_orders::clients::{
    stripe, CartClient, CheckoutSession, ClientError, EarningsClient, GatewayEvent, InventoryClient, LedgerClient,
    PaymentGateway, SignatureError,
};
use grocer_orders::domain::aggregates::{replay_history, DeliveryStatus, FulfillmentStatus, PaymentMethod, PaymentStatus, ReturnStatus};
use grocer_orders::domain::value_objects::{Actor, Money};
use grocer_orders::engine::{CreateOrderRequest, EngineDeps, OrderEngine, ProcessReturnRequest, TransitionRequest, WebhookOutcome};
use grocer_orders::outbox::{OutboxStatus, SideEffect, SideEffectClients};
use grocer_orders::publisher::LogPublisher;
use grocer_orders::store::{InMemoryStore, OrderStore};
use grocer_orders::{ConflictReason, EngineConfig, EngineError, ForbiddenReason, Order};

const WEBHOOK_SECRET: &str = "whsec_integration";
const VENDOR: &str = "store-1";
const RIDER: &str = "lg-9";

// =============================================================================
// Fakes
// =============================================================================

#[derive(Default)]
struct FakeLedger {
    balance: Mutex<Decimal>,
    credits: Mutex<Vec<(String, Decimal)>>,
    fail_credit: AtomicBool,
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn debit(&self, _buyer_id: &str, amount: &Money, _auth_token: Option<&str>) -> Result<bool, ClientError> {
        let mut balance = self.balance.lock().unwrap();
        if *balance < amount.amount() {
            return Ok(false);
        }
        *balance -= amount.amount();
        Ok(true)
    }

    async fn credit(&self, buyer_id: &str, amount: &Money, _memo: &str, _auth_token: Option<&str>) -> Result<bool, ClientError> {
        if self.fail_credit.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("wallet down".into()));
        }
        self.credits.lock().unwrap().push((buyer_id.to_string(), amount.amount()));
        *self.balance.lock().unwrap() += amount.amount();
        Ok(true)
    }
}

#[derive(Default)]
struct FakeInventory {
    calls: Mutex<Vec<(String, u32, u32)>>,
    failing: AtomicBool,
}

#[async_trait]
impl InventoryClient for FakeInventory {
    async fn decrement_variant_stock(&self, product_id: &str, quantity: u32, variant_index: u32) -> Result<(), ClientError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ClientError::Rejected { status: 503, body: "unavailable".into() });
        }
        self.calls.lock().unwrap().push((product_id.to_string(), quantity, variant_index));
        Ok(())
    }
}

#[derive(Default)]
struct FakeEarnings {
    recorded: Mutex<Vec<String>>,
    failing: AtomicBool,
}

#[async_trait]
impl EarningsClient for FakeEarnings {
    async fn record_delivery_earning(&self, order_id: &str, _auth_token: Option<&str>) -> Result<(), ClientError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ClientError::Timeout);
        }
        self.recorded.lock().unwrap().push(order_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakeCart {
    cleared: AtomicUsize,
}

#[async_trait]
impl CartClient for FakeCart {
    async fn clear_cart(&self, _buyer_id: &str, _auth_token: Option<&str>) -> Result<(), ClientError> {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeGateway {
    success_urls: Mutex<Vec<String>>,
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout_session(&self, order_id: &str, _amount: &Money, success_url: &str, _cancel_url: &str) -> Result<CheckoutSession, ClientError> {
        self.success_urls.lock().unwrap().push(success_url.to_string());
        Ok(CheckoutSession { session_id: format!("cs_{order_id}"), url: format!("https://checkout.test/pay/cs_{order_id}") })
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature_header: &str) -> Result<GatewayEvent, SignatureError> {
        stripe::verify_webhook_signature(payload, signature_header, WEBHOOK_SECRET, Duration::from_secs(300), chrono::Utc::now().timestamp())
    }
}

struct Harness {
    engine: OrderEngine,
    store: Arc<InMemoryStore>,
    ledger: Arc<FakeLedger>,
    inventory: Arc<FakeInventory>,
    earnings: Arc<FakeEarnings>,
    cart: Arc<FakeCart>,
    gateway: Arc<FakeGateway>,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let ledger = Arc::new(FakeLedger::default());
    let inventory = Arc::new(FakeInventory::default());
    let earnings = Arc::new(FakeEarnings::default());
    let cart = Arc::new(FakeCart::default());
    let gateway = Arc::new(FakeGateway::default());
    let deps = EngineDeps {
        orders: store.clone(),
        outbox: store.clone(),
        webhooks: store.clone(),
        clients: SideEffectClients { ledger: ledger.clone(), inventory: inventory.clone(), earnings: earnings.clone(), cart: cart.clone() },
        gateway: gateway.clone(),
        publisher: Arc::new(LogPublisher),
    };
    let engine = OrderEngine::new(deps, EngineConfig::default());
    Harness { engine, store, ledger, inventory, earnings, cart, gateway }
}

fn dec(s: &str) -> Decimal { Decimal::from_str(s).unwrap() }

fn buyer() -> Actor { Actor::buyer("buyer-1").with_token("buyer-token") }
fn vendor() -> Actor { Actor::vendor("vendor-staff", VENDOR) }
fn rider() -> Actor { Actor::logistics("rider-1", RIDER) }

fn groceries_request() -> CreateOrderRequest {
    serde_json::from_value(serde_json::json!({
        "vendorId": VENDOR,
        "items": [
            { "productId": "tomatoes", "name": "Tomatoes", "unitPrice": "3.00", "quantity": 2, "variantIndex": 1 },
            { "productId": "rice", "name": "Rice 1kg", "unitPrice": "5.00", "quantity": 1 }
        ],
        "shippingAddress": { "name": "Ada", "phone": "08012345678", "street1": "1 Marina", "city": "Lagos", "country": "NG" },
        "totalAmount": "11.00"
    }))
    .unwrap()
}

impl Harness {
    async fn place(&self) -> Order {
        self.engine.create_order(groceries_request(), Some(&buyer())).await.unwrap()
    }

    async fn assign(&self, order_id: &str) -> Order {
        let request = TransitionRequest { logistics_id: Some(RIDER.into()), ..TransitionRequest::to(FulfillmentStatus::Assigned) };
        self.engine.transition_status(order_id, request, Some(&vendor())).await.unwrap()
    }

    async fn deliver(&self, order_id: &str) -> Order {
        self.assign(order_id).await;
        self.engine.transition_status(order_id, TransitionRequest::to(FulfillmentStatus::Dispatched), Some(&vendor())).await.unwrap();
        self.engine.transition_status(order_id, TransitionRequest::to(FulfillmentStatus::Delivered), Some(&rider())).await.unwrap()
    }
}

fn signed(payload: &str) -> String {
    let ts = chrono::Utc::now().timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(format!("{ts}.{payload}").as_bytes());
    format!("t={ts},v1={}", hex::encode(mac.finalize().into_bytes()))
}

fn checkout_completed(event_id: &str, order_id: &str, payment_intent: &str) -> String {
    serde_json::json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": format!("cs_{order_id}"),
            "payment_intent": payment_intent,
            "success_url": format!("https://shop.test/paid?order_id={order_id}&session_id=cs_{order_id}"),
            "client_reference_id": order_id
        } }
    })
    .to_string()
}

// =============================================================================
// Creation
// =============================================================================

#[tokio::test]
async fn test_create_order_starts_inprogress() {
    let h = harness();
    let order = h.place().await;

    assert_eq!(order.status(), FulfillmentStatus::Inprogress);
    assert_eq!(order.delivery_status(), DeliveryStatus::Pending);
    assert!(order.status_history().is_empty());
    assert_eq!(order.total_amount().amount(), dec("11.00"));
    assert_eq!(order.payment_status(), PaymentStatus::Pending);

    assert_eq!(h.inventory.calls.lock().unwrap().clone(), vec![("tomatoes".to_string(), 2, 1), ("rice".to_string(), 1, 0)]);
    assert_eq!(h.cart.cleared.load(Ordering::SeqCst), 1);
    let entries = h.store.outbox_entries().await;
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.status == OutboxStatus::Delivered));
}

#[tokio::test]
async fn test_create_order_rejects_wrong_total() {
    let h = harness();
    let mut request = groceries_request();
    request.total_amount = Some(dec("9.00"));
    let err = h.engine.create_order(request, Some(&buyer())).await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION_FAILED");
    assert!(h.store.outbox_entries().await.is_empty());
}

#[tokio::test]
async fn test_create_order_requires_actor() {
    let h = harness();
    let err = h.engine.create_order(groceries_request(), None).await.unwrap_err();
    assert_eq!(err, EngineError::Unauthorized);
}

#[tokio::test]
async fn test_manual_payment_status_is_admin_only() {
    let h = harness();
    let mut request = groceries_request();
    request.payment_status = Some(PaymentStatus::Paid);
    let err = h.engine.create_order(request.clone(), Some(&buyer())).await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION_FAILED");

    request.buyer_id = Some("buyer-1".into());
    let order = h.engine.create_order(request, Some(&Actor::admin("ops"))).await.unwrap();
    assert_eq!(order.payment_status(), PaymentStatus::Paid);
    assert_eq!(order.buyer_id(), "buyer-1");
    // The admin's own cart is left alone.
    assert_eq!(h.cart.cleared.load(Ordering::SeqCst), 0);

    // Buyer-owned actions bind to the buyer, not the admin who entered it.
    let returned = h.engine.request_return(order.id(), "Missing items", Some(&buyer())).await.unwrap();
    assert!(returned.is_return_requested());
}

#[tokio::test]
async fn test_only_admin_orders_for_someone_else() {
    let h = harness();
    let mut request = groceries_request();
    request.buyer_id = Some("buyer-2".into());
    let err = h.engine.create_order(request.clone(), Some(&buyer())).await.unwrap_err();
    assert_eq!(err, EngineError::Forbidden(ForbiddenReason::NotOrderOwner));

    request.buyer_id = Some("buyer-1".into());
    let own = h.engine.create_order(request, Some(&buyer())).await.unwrap();
    assert_eq!(own.buyer_id(), "buyer-1");
}

#[tokio::test]
async fn test_oversized_price_is_rejected() {
    let h = harness();
    let mut request = groceries_request();
    request.items[0].unit_price = dec("79228162514264337593543950335");
    request.total_amount = None;
    let err = h.engine.create_order(request, Some(&buyer())).await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION_FAILED");
    assert!(h.store.outbox_entries().await.is_empty());
}

#[tokio::test]
async fn test_stock_failure_does_not_fail_order_and_is_retried() {
    let h = harness();
    h.inventory.failing.store(true, Ordering::SeqCst);
    let order = h.place().await;
    assert_eq!(order.status(), FulfillmentStatus::Inprogress);

    let pending: Vec<_> = h.store.outbox_entries().await.into_iter().filter(|e| e.status == OutboxStatus::Pending).collect();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|e| e.attempts == 1 && e.last_error.is_some()));
    // Not due yet: the first retry waits out its backoff.
    assert_eq!(h.engine.dispatcher().run_due().await, 0);

    h.inventory.failing.store(false, Ordering::SeqCst);
    for entry in &pending {
        assert!(h.engine.dispatcher().dispatch(entry).await);
    }
    assert!(h.store.outbox_entries().await.iter().all(|e| e.status == OutboxStatus::Delivered));
    assert_eq!(h.inventory.calls.lock().unwrap().len(), 2);
}

// =============================================================================
// Fulfillment
// =============================================================================

#[tokio::test]
async fn test_history_grows_and_replays() {
    let h = harness();
    let order = h.place().await;

    let mut last_len = 0;
    let steps = [
        (FulfillmentStatus::Assigned, vendor()),
        (FulfillmentStatus::Dispatched, vendor()),
        (FulfillmentStatus::Delivered, rider()),
    ];
    for (status, actor) in steps {
        let request = TransitionRequest { logistics_id: Some(RIDER.into()), ..TransitionRequest::to(status) };
        let updated = h.engine.transition_status(order.id(), request, Some(&actor)).await.unwrap();
        assert!(updated.status_history().len() > last_len);
        last_len = updated.status_history().len();
        assert_eq!(replay_history(updated.status_history()), (updated.status(), updated.delivery_status()));
    }

    let delivered = h.engine.get_order(order.id(), Some(&buyer())).await.unwrap();
    assert_eq!(delivered.delivery_status(), DeliveryStatus::Delivered);
    assert_eq!(delivered.status_history().last().unwrap().actor_id, "rider-1");
    assert_eq!(h.earnings.recorded.lock().unwrap().clone(), vec![order.id().to_string()]);
    // COD-style orders stay PENDING through delivery.
    assert_eq!(delivered.payment_status(), PaymentStatus::Pending);
}

#[tokio::test]
async fn test_authentication_code_is_written_once() {
    let h = harness();
    let order = h.place().await;

    let first = h.assign(order.id()).await;
    let code = first.authentication_code().cloned().unwrap();
    let n: u32 = code.as_str().parse().unwrap();
    assert!((1000..=9999).contains(&n));

    let again = h.assign(order.id()).await;
    assert_eq!(again.authentication_code(), Some(&code));
    assert_eq!(again.delivery_timeline(), first.delivery_timeline());
    assert_eq!(again.status_history().len(), 2);
}

#[tokio::test]
async fn test_wrong_rider_cannot_deliver() {
    let h = harness();
    let order = h.place().await;
    h.assign(order.id()).await;
    let before = h.engine.transition_status(order.id(), TransitionRequest::to(FulfillmentStatus::Dispatched), Some(&vendor())).await.unwrap();

    let stranger = Actor::logistics("rider-2", "lg-other");
    let err = h.engine.transition_status(order.id(), TransitionRequest::to(FulfillmentStatus::Delivered), Some(&stranger)).await.unwrap_err();
    assert_eq!(err, EngineError::Forbidden(ForbiddenReason::LogisticsMismatch));

    let after = h.store.get(order.id()).await.unwrap();
    assert_eq!(after.status(), FulfillmentStatus::Dispatched);
    assert_eq!(after.revision(), before.revision());
    assert!(h.earnings.recorded.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_blank_logistics_id_is_rejected() {
    let h = harness();
    let order = h.place().await;
    for blank in ["", "  "] {
        let request = TransitionRequest { logistics_id: Some(blank.into()), ..TransitionRequest::to(FulfillmentStatus::Assigned) };
        let err = h.engine.transition_status(order.id(), request, Some(&vendor())).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }
    let after = h.store.get(order.id()).await.unwrap();
    assert_eq!(after.logistics_id(), None);
    assert_eq!(after.status(), FulfillmentStatus::Inprogress);

    // The order can still be assigned to a real rider and delivered.
    let delivered = h.deliver(order.id()).await;
    assert_eq!(delivered.status(), FulfillmentStatus::Delivered);
}

#[tokio::test]
async fn test_earnings_failure_does_not_block_delivery() {
    let h = harness();
    let order = h.place().await;
    h.earnings.failing.store(true, Ordering::SeqCst);

    let delivered = h.deliver(order.id()).await;
    assert_eq!(delivered.status(), FulfillmentStatus::Delivered);
    assert_eq!(h.store.get(order.id()).await.unwrap().status(), FulfillmentStatus::Delivered);

    let earning = h.store.outbox_entries().await.into_iter().find(|e| matches!(e.effect, SideEffect::RecordEarning { .. })).unwrap();
    assert_eq!(earning.status, OutboxStatus::Pending);
    assert_eq!(earning.attempts, 1);
    assert!(earning.last_error.is_some());

    h.earnings.failing.store(false, Ordering::SeqCst);
    assert!(h.engine.dispatcher().dispatch(&earning).await);
    assert_eq!(h.earnings.recorded.lock().unwrap().clone(), vec![order.id().to_string()]);
}

#[tokio::test]
async fn test_other_vendor_cannot_assign() {
    let h = harness();
    let order = h.place().await;
    let request = TransitionRequest { logistics_id: Some(RIDER.into()), ..TransitionRequest::to(FulfillmentStatus::Assigned) };
    let err = h.engine.transition_status(order.id(), request, Some(&Actor::vendor("x", "store-2"))).await.unwrap_err();
    assert_eq!(err, EngineError::Forbidden(ForbiddenReason::VendorMismatch));
}

#[tokio::test]
async fn test_invalid_transitions() {
    let h = harness();
    let order = h.place().await;

    let err = h.engine.transition_status(order.id(), TransitionRequest::to(FulfillmentStatus::Dispatched), Some(&vendor())).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATUS");

    let err = h.engine.transition_status(order.id(), TransitionRequest::to(FulfillmentStatus::Assigned), Some(&vendor())).await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION_FAILED");

    let bogus = TransitionRequest { status: "shipped".into(), order_progress: None, logistics_id: None };
    let err = h.engine.transition_status(order.id(), bogus, Some(&vendor())).await.unwrap_err();
    assert_eq!(err, EngineError::InvalidStatus("shipped".into()));

    h.assign(order.id()).await;
    let other = TransitionRequest { logistics_id: Some("lg-other".into()), ..TransitionRequest::to(FulfillmentStatus::Assigned) };
    let err = h.engine.transition_status(order.id(), other, Some(&vendor())).await.unwrap_err();
    assert_eq!(err, EngineError::Conflict(ConflictReason::LogisticsAlreadyAssigned));
}

#[tokio::test]
async fn test_stale_write_is_rejected() {
    let h = harness();
    let order = h.place().await;
    let stale = h.store.get(order.id()).await.unwrap();
    h.assign(order.id()).await;

    let err: EngineError = h.store.update(&stale, &[]).await.unwrap_err().into();
    assert_eq!(err, EngineError::Conflict(ConflictReason::ConcurrentModification));
}

#[tokio::test]
async fn test_get_order_visibility() {
    let h = harness();
    let order = h.place().await;
    assert!(h.engine.get_order(order.id(), Some(&vendor())).await.is_ok());
    let err = h.engine.get_order(order.id(), Some(&Actor::buyer("someone-else"))).await.unwrap_err();
    assert_eq!(err, EngineError::Forbidden(ForbiddenReason::NotOrderOwner));
    let err = h.engine.get_order("missing", Some(&buyer())).await.unwrap_err();
    assert_eq!(err, EngineError::OrderNotFound("missing".into()));
}

// =============================================================================
// Payment
// =============================================================================

#[tokio::test]
async fn test_wallet_payment_settles() {
    let h = harness();
    *h.ledger.balance.lock().unwrap() = dec("20.00");
    let order = h.place().await;

    let paid = h.engine.initiate_payment(order.id(), "WALLET", Some(&buyer())).await.unwrap().order;
    assert_eq!(paid.payment_status(), PaymentStatus::Paid);
    assert_eq!(paid.payment_method(), Some(PaymentMethod::Wallet));
    assert!(paid.transaction_id().unwrap().starts_with("WLT-"));
    assert_eq!(*h.ledger.balance.lock().unwrap(), dec("9.00"));

    let err = h.engine.initiate_payment(order.id(), "WALLET", Some(&buyer())).await.unwrap_err();
    assert_eq!(err, EngineError::Conflict(ConflictReason::AlreadyPaid));
}

#[tokio::test]
async fn test_wallet_insufficient_funds_leaves_order() {
    let h = harness();
    *h.ledger.balance.lock().unwrap() = dec("4.00");
    let order = h.place().await;

    let err = h.engine.initiate_payment(order.id(), "wallet", Some(&buyer())).await.unwrap_err();
    assert_eq!(err, EngineError::InsufficientFunds);
    let after = h.store.get(order.id()).await.unwrap();
    assert_eq!(after.payment_status(), order.payment_status());
    assert_eq!(after.revision(), order.revision());
}

#[tokio::test]
async fn test_payment_rejects_unknown_method_and_strangers() {
    let h = harness();
    let order = h.place().await;
    let err = h.engine.initiate_payment(order.id(), "BITCOIN", Some(&buyer())).await.unwrap_err();
    assert_eq!(err, EngineError::InvalidMethod("BITCOIN".into()));
    let err = h.engine.initiate_payment(order.id(), "COD", Some(&Actor::buyer("intruder"))).await.unwrap_err();
    assert_eq!(err, EngineError::Forbidden(ForbiddenReason::NotOrderOwner));
}

#[tokio::test]
async fn test_manual_methods_stay_pending() {
    let h = harness();
    let order = h.place().await;
    let ussd = h.engine.initiate_payment(order.id(), "USSD", Some(&buyer())).await.unwrap().order;
    assert_eq!(ussd.payment_status(), PaymentStatus::Pending);
    assert_eq!(ussd.payment_method(), Some(PaymentMethod::Ussd));
    assert!(ussd.transaction_id().unwrap().starts_with("MAN-"));

    let cod = h.engine.initiate_payment(order.id(), "COD", Some(&buyer())).await.unwrap().order;
    assert_eq!(cod.payment_method(), Some(PaymentMethod::Cod));
    assert_eq!(cod.payment_status(), PaymentStatus::Pending);
}

#[tokio::test]
async fn test_card_checkout_then_webhook_twice() {
    let h = harness();
    let order = h.place().await;

    let started = h.engine.initiate_payment(order.id(), "CARD", Some(&buyer())).await.unwrap();
    assert_eq!(started.order.payment_status(), PaymentStatus::Pending);
    assert_eq!(started.checkout_url.as_deref(), Some(format!("https://checkout.test/pay/cs_{}", order.id()).as_str()));
    assert!(h.gateway.success_urls.lock().unwrap()[0].contains(&format!("order_id={}", order.id())));

    let payload = checkout_completed("evt_1", order.id(), "pi_123");
    let first = h.engine.handle_payment_webhook(payload.as_bytes(), &signed(&payload)).await.unwrap();
    assert!(matches!(first, WebhookOutcome::Applied(_)));
    let second = h.engine.handle_payment_webhook(payload.as_bytes(), &signed(&payload)).await.unwrap();
    assert!(matches!(second, WebhookOutcome::Duplicate));

    // A distinct event for the same session must not replace the transaction id.
    let replay = checkout_completed("evt_2", order.id(), "pi_other");
    let third = h.engine.handle_payment_webhook(replay.as_bytes(), &signed(&replay)).await.unwrap();
    assert!(matches!(third, WebhookOutcome::Ignored(_)));

    let paid = h.store.get(order.id()).await.unwrap();
    assert_eq!(paid.payment_status(), PaymentStatus::Paid);
    assert_eq!(paid.transaction_id(), Some("pi_123"));
    assert_eq!(h.store.processed_events().await, 2);
}

#[tokio::test]
async fn test_webhook_with_bad_signature() {
    let h = harness();
    let order = h.place().await;
    let payload = checkout_completed("evt_1", order.id(), "pi_123");
    let err = h.engine.handle_payment_webhook(payload.as_bytes(), "t=1,v1=deadbeef").await.unwrap_err();
    assert_eq!(err.code(), "INVALID_SIGNATURE");
    assert_eq!(h.store.processed_events().await, 0);
}

#[tokio::test]
async fn test_webhook_for_unknown_order_is_acknowledged() {
    let h = harness();
    let payload = checkout_completed("evt_9", "no-such-order", "pi_9");
    let outcome = h.engine.handle_payment_webhook(payload.as_bytes(), &signed(&payload)).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
}

// =============================================================================
// Returns
// =============================================================================

#[tokio::test]
async fn test_second_return_request_conflicts() {
    let h = harness();
    let order = h.place().await;
    h.deliver(order.id()).await;

    let first = h.engine.request_return(order.id(), "Bruised tomatoes", Some(&buyer())).await.unwrap();
    let record = first.return_request().cloned().unwrap();
    assert_eq!(record.status, ReturnStatus::Pending);

    let err = h.engine.request_return(order.id(), "Changed my mind", Some(&buyer())).await.unwrap_err();
    assert_eq!(err, EngineError::Conflict(ConflictReason::AlreadyRequested));
    let after = h.store.get(order.id()).await.unwrap();
    assert_eq!(after.return_request(), Some(&record));
}

#[tokio::test]
async fn test_only_buyer_requests_return() {
    let h = harness();
    let order = h.place().await;
    let err = h.engine.request_return(order.id(), "Damaged", Some(&vendor())).await.unwrap_err();
    assert_eq!(err, EngineError::Forbidden(ForbiddenReason::NotOrderOwner));
}

#[tokio::test]
async fn test_refund_survives_ledger_failure() {
    let h = harness();
    *h.ledger.balance.lock().unwrap() = dec("20.00");
    let order = h.place().await;
    h.engine.initiate_payment(order.id(), "WALLET", Some(&buyer())).await.unwrap();
    h.deliver(order.id()).await;
    h.engine.request_return(order.id(), "Spoiled milk", Some(&buyer())).await.unwrap();
    h.ledger.fail_credit.store(true, Ordering::SeqCst);

    let request = ProcessReturnRequest { status: "Refunded".into(), refund_amount: None };
    let refunded = h.engine.process_return(order.id(), request, Some(&vendor())).await.unwrap();
    assert_eq!(refunded.payment_status(), PaymentStatus::Unpaid);
    assert_eq!(refunded.status(), FulfillmentStatus::Canceled);
    assert_eq!(replay_history(refunded.status_history()), (FulfillmentStatus::Canceled, DeliveryStatus::Failed));
    let record = refunded.return_request().unwrap();
    assert_eq!(record.status, ReturnStatus::Refunded);
    assert_eq!(record.refund_amount.as_ref().map(|m| m.amount()), Some(dec("11.00")));

    let credit = h.store.outbox_entries().await.into_iter().find(|e| matches!(e.effect, SideEffect::CreditRefund { .. })).unwrap();
    assert_eq!(credit.status, OutboxStatus::Pending);
    assert_eq!(credit.attempts, 1);

    h.ledger.fail_credit.store(false, Ordering::SeqCst);
    assert!(h.engine.dispatcher().dispatch(&credit).await);
    assert_eq!(h.ledger.credits.lock().unwrap().clone(), vec![("buyer-1".to_string(), dec("11.00"))]);
}

#[tokio::test]
async fn test_refund_of_unpaid_order_credits_nothing() {
    let h = harness();
    let order = h.place().await;
    h.engine.initiate_payment(order.id(), "COD", Some(&buyer())).await.unwrap();
    h.deliver(order.id()).await;
    h.engine.request_return(order.id(), "Wrong order", Some(&buyer())).await.unwrap();

    let request = ProcessReturnRequest { status: "Refunded".into(), refund_amount: None };
    let refunded = h.engine.process_return(order.id(), request, Some(&vendor())).await.unwrap();
    assert_eq!(refunded.status(), FulfillmentStatus::Canceled);
    assert_eq!(refunded.payment_status(), PaymentStatus::Unpaid);
    assert!(!h.store.outbox_entries().await.iter().any(|e| matches!(e.effect, SideEffect::CreditRefund { .. })));
    assert!(h.ledger.credits.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_return_state_only_moves_forward() {
    let h = harness();
    let order = h.place().await;
    h.engine.request_return(order.id(), "Wrong brand", Some(&buyer())).await.unwrap();

    let approve = ProcessReturnRequest { status: "Approved".into(), refund_amount: Some(dec("5.00")) };
    h.engine.process_return(order.id(), approve, Some(&vendor())).await.unwrap();

    let reject = ProcessReturnRequest { status: "Rejected".into(), refund_amount: None };
    let err = h.engine.process_return(order.id(), reject, Some(&vendor())).await.unwrap_err();
    assert_eq!(err, EngineError::Conflict(ConflictReason::ReturnAlreadyProcessed));

    let too_much = ProcessReturnRequest { status: "Refunded".into(), refund_amount: Some(dec("50.00")) };
    let err = h.engine.process_return(order.id(), too_much, Some(&vendor())).await.unwrap_err();
    assert_eq!(err.code(), "VALIDATION_FAILED");
}

#[tokio::test]
async fn test_process_return_errors() {
    let h = harness();
    let order = h.place().await;

    let request = ProcessReturnRequest { status: "Approved".into(), refund_amount: None };
    let err = h.engine.process_return(order.id(), request.clone(), Some(&vendor())).await.unwrap_err();
    assert_eq!(err, EngineError::ReturnNotFound(order.id().to_string()));

    let err = h.engine.process_return(order.id(), request, Some(&buyer())).await.unwrap_err();
    assert_eq!(err, EngineError::Forbidden(ForbiddenReason::VendorMismatch));

    let pending = ProcessReturnRequest { status: "Pending".into(), refund_amount: None };
    let err = h.engine.process_return(order.id(), pending, Some(&vendor())).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATUS");
}

//! Grocer Orders - order lifecycle and payment service

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use grocer_orders::api::{self, AppState};
use grocer_orders::clients::{
    HttpCartClient, HttpEarningsClient, HttpInventoryClient, HttpLedgerClient, RestClient, StripeGateway,
};
use grocer_orders::engine::{EngineDeps, OrderEngine};
use grocer_orders::outbox::{OutboxWorker, SideEffectClients};
use grocer_orders::publisher::{EventPublisher, LogPublisher, NatsPublisher};
use grocer_orders::store::{InMemoryStore, OrderStore, OutboxStore, PgStore, WebhookLedger};
use grocer_orders::Config;

type Stores = (Arc<dyn OrderStore>, Arc<dyn OutboxStore>, Arc<dyn WebhookLedger>);

async fn open_stores(config: &Config) -> Result<Stores> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            let store = Arc::new(PgStore::new(pool));
            store.migrate().await?;
            let stores: Stores = (store.clone(), store.clone(), store);
            Ok(stores)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; orders are kept in memory and lost on restart");
            let store = Arc::new(InMemoryStore::new());
            let stores: Stores = (store.clone(), store.clone(), store);
            Ok(stores)
        }
    }
}

async fn open_publisher(config: &Config) -> Arc<dyn EventPublisher> {
    let Some(url) = &config.nats_url else { return Arc::new(LogPublisher) };
    match async_nats::connect(url.as_str()).await {
        Ok(client) => Arc::new(NatsPublisher::new(client)),
        Err(e) => {
            tracing::warn!(error = %e, "NATS unavailable; events will only be logged");
            Arc::new(LogPublisher)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let (orders, outbox, webhooks) = open_stores(&config).await?;
    let publisher = open_publisher(&config).await;

    let timeout = config.engine.client_timeout;
    let token = config.service_token.clone();
    let clients = SideEffectClients {
        ledger: Arc::new(HttpLedgerClient::new(RestClient::new(&config.wallet_service_url, timeout, token.clone())?)),
        inventory: Arc::new(HttpInventoryClient::new(RestClient::new(&config.product_service_url, timeout, token.clone())?)),
        earnings: Arc::new(HttpEarningsClient::new(RestClient::new(&config.logistics_service_url, timeout, token.clone())?)),
        cart: Arc::new(HttpCartClient::new(RestClient::new(&config.cart_service_url, timeout, token)?)),
    };
    let gateway = Arc::new(StripeGateway::new(
        &config.stripe_api_base,
        &config.stripe_secret_key,
        &config.stripe_webhook_secret,
        timeout,
        config.engine.webhook_tolerance,
    )?);

    let engine = OrderEngine::new(EngineDeps { orders, outbox, webhooks, clients, gateway, publisher }, config.engine.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = OutboxWorker::new(engine.dispatcher().clone(), config.outbox_poll_interval);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    let app = api::router(AppState { engine: Arc::new(engine) });
    tracing::info!("Grocer Orders listening on 0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async { tokio::signal::ctrl_c().await.ok(); })
        .await?;

    shutdown_tx.send(true).ok();
    worker_handle.await.ok();
    Ok(())
}

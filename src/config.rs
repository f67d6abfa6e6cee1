//! Service configuration

use std::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Process-level configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL; without it orders live in memory
    pub database_url: Option<String>,
    /// NATS URL for domain event publishing
    pub nats_url: Option<String>,
    pub port: u16,
    /// Wallet (ledger) service base URL
    pub wallet_service_url: String,
    /// Product (inventory) service base URL
    pub product_service_url: String,
    /// Logistics (earnings) service base URL
    pub logistics_service_url: String,
    /// Cart service base URL
    pub cart_service_url: String,
    /// Token used for service-to-service calls when no caller token exists
    pub service_token: Option<String>,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub stripe_api_base: String,
    pub outbox_poll_interval: Duration,
    pub engine: EngineConfig,
}

/// Settings the engine itself reads.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub currency: String,
    /// Where the hosted checkout sends the buyer after paying
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    /// Upper bound on any single leaf-client call
    pub client_timeout: Duration,
    /// Accepted clock skew for webhook timestamps
    pub webhook_tolerance: Duration,
    /// Promised delivery window, used for the timeline label
    pub delivery_window: chrono::Duration,
    pub outbox_max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            currency: "NGN".into(),
            checkout_success_url: "http://localhost:3000/payment/success".into(),
            checkout_cancel_url: "http://localhost:3000/payment/cancel".into(),
            client_timeout: Duration::from_secs(5),
            webhook_tolerance: Duration::from_secs(300),
            delivery_window: chrono::Duration::minutes(45),
            outbox_max_attempts: 8,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Require a secret env var: must be set and non-empty outside development.
    fn require_secret(name: &str, environment: &str) -> Result<String, BoxError> {
        match std::env::var(name) {
            Ok(v) if !v.is_empty() => Ok(v),
            _ if environment == "development" => Ok(format!("dev-{name}-not-for-production")),
            _ => Err(format!("{name} must be set in {environment} environment").into()),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, BoxError> {
        let environment = env_or("ENVIRONMENT", "development");
        let defaults = EngineConfig::default();

        let engine = EngineConfig {
            currency: env_or("CURRENCY", &defaults.currency),
            checkout_success_url: env_or("CHECKOUT_SUCCESS_URL", &defaults.checkout_success_url),
            checkout_cancel_url: env_or("CHECKOUT_CANCEL_URL", &defaults.checkout_cancel_url),
            client_timeout: Duration::from_secs(env_parse("CLIENT_TIMEOUT_SECS", 5)),
            webhook_tolerance: Duration::from_secs(env_parse("WEBHOOK_TOLERANCE_SECS", 300)),
            delivery_window: chrono::Duration::minutes(env_parse("DELIVERY_WINDOW_MINUTES", 45)),
            outbox_max_attempts: env_parse("OUTBOX_MAX_ATTEMPTS", defaults.outbox_max_attempts),
        };

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            nats_url: std::env::var("NATS_URL").ok().filter(|s| !s.is_empty()),
            port: env_parse("PORT", 8083),
            wallet_service_url: env_or("WALLET_SERVICE_URL", "http://localhost:8081"),
            product_service_url: env_or("PRODUCT_SERVICE_URL", "http://localhost:8082"),
            logistics_service_url: env_or("LOGISTICS_SERVICE_URL", "http://localhost:8084"),
            cart_service_url: env_or("CART_SERVICE_URL", "http://localhost:8085"),
            service_token: std::env::var("SERVICE_TOKEN").ok().filter(|s| !s.is_empty()),
            stripe_secret_key: Self::require_secret("STRIPE_SECRET_KEY", &environment)?,
            stripe_webhook_secret: Self::require_secret("STRIPE_WEBHOOK_SECRET", &environment)?,
            stripe_api_base: env_or("STRIPE_API_BASE", "https://api.stripe.com"),
            outbox_poll_interval: Duration::from_secs(env_parse("OUTBOX_POLL_SECS", 5)),
            engine,
        })
    }
}

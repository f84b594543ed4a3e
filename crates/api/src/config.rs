//! Configuration loaded from environment variables

use std::time::Duration;

use tutorlink_billing::GatewayConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string
    pub database_url: String,
    /// Server bind address (e.g., "0.0.0.0:8080")
    pub bind_address: String,
    /// Payment gateway charge endpoint
    pub payment_gateway_url: String,
    /// Payment gateway API key
    pub payment_gateway_api_key: String,
    /// Per-charge gateway timeout in seconds
    pub payment_timeout_secs: u64,
    /// ISO 4217 currency code used for all charges
    pub currency: String,
    /// Comma-separated CORS origin allowlist
    pub allowed_origins: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let payment_gateway_url = std::env::var("PAYMENT_GATEWAY_URL")
            .map_err(|_| anyhow::anyhow!("PAYMENT_GATEWAY_URL must be set"))?;

        let payment_gateway_api_key = std::env::var("PAYMENT_GATEWAY_API_KEY")
            .map_err(|_| anyhow::anyhow!("PAYMENT_GATEWAY_API_KEY must be set"))?;

        let payment_timeout_secs = std::env::var("PAYMENT_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| anyhow::anyhow!("PAYMENT_TIMEOUT_SECS must be an integer"))?;

        let currency = std::env::var("CURRENCY").unwrap_or_else(|_| "EUR".to_string());

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string());

        Ok(Self {
            database_url,
            bind_address,
            payment_gateway_url,
            payment_gateway_api_key,
            payment_timeout_secs,
            currency,
            allowed_origins,
        })
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            charge_url: self.payment_gateway_url.clone(),
            api_key: self.payment_gateway_api_key.clone(),
            timeout: Duration::from_secs(self.payment_timeout_secs),
        }
    }
}

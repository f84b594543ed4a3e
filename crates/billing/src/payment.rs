//! Payment gateway collaborator.
//!
//! The gateway captures funds; it is an external collaborator and this
//! crate only owns the interface. Amounts are integer cents and the
//! idempotency key is forwarded so the processor can deduplicate
//! retries on its side as well.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Charge request passed to the gateway
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub payment_method_ref: String,
    pub idempotency_key: String,
}

/// Successful capture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub transaction_id: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Capture `amount_cents` from the referenced payment method.
    ///
    /// Failures (including timeouts) map to
    /// [`BillingError::PaymentFailed`] and leave no billing state
    /// change; the caller may retry with the same idempotency key.
    async fn charge(&self, request: &ChargeRequest) -> BillingResult<ChargeReceipt>;
}

/// Configuration for the HTTP gateway client
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub charge_url: String,
    pub api_key: String,
    pub timeout: std::time::Duration,
}

/// HTTP client for the payment gateway
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    transaction_id: String,
    success: bool,
}

impl HttpPaymentGateway {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::PaymentFailed(format!("gateway client: {}", e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn charge(&self, request: &ChargeRequest) -> BillingResult<ChargeReceipt> {
        let response = self
            .client
            .post(&self.config.charge_url)
            .bearer_auth(&self.config.api_key)
            .header("idempotency-key", &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                // A timeout is indeterminate on the gateway side; the ledger
                // entry keeps the key so a retry resolves it either way.
                if e.is_timeout() {
                    BillingError::PaymentFailed("gateway timeout".to_string())
                } else {
                    BillingError::PaymentFailed(format!("gateway unreachable: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Payment gateway rejected charge");
            return Err(BillingError::PaymentFailed(format!(
                "gateway returned {}: {}",
                status, body
            )));
        }

        let parsed: ChargeResponse = response
            .json()
            .await
            .map_err(|e| BillingError::PaymentFailed(format!("malformed gateway response: {}", e)))?;

        if !parsed.success {
            return Err(BillingError::PaymentFailed("charge declined".to_string()));
        }

        Ok(ChargeReceipt {
            transaction_id: parsed.transaction_id,
        })
    }
}

#[cfg(any(test, feature = "test-store"))]
pub mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Recording gateway for tests: counts calls, remembers requests and
    /// can be scripted to fail.
    #[derive(Default)]
    pub struct MockGateway {
        calls: AtomicUsize,
        fail_next: AtomicUsize,
        requests: Mutex<Vec<ChargeRequest>>,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `n` charges fail with `PaymentFailed`
        pub fn fail_next(&self, n: usize) {
            self.fail_next.store(n, Ordering::SeqCst);
        }

        pub fn charge_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn requests(&self) -> Vec<ChargeRequest> {
            #[allow(clippy::unwrap_used)]
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn charge(&self, request: &ChargeRequest) -> BillingResult<ChargeReceipt> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            #[allow(clippy::unwrap_used)]
            self.requests.lock().unwrap().push(request.clone());

            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
                return Err(BillingError::PaymentFailed("scripted failure".to_string()));
            }

            Ok(ChargeReceipt {
                transaction_id: format!("txn_{}", call + 1),
            })
        }
    }
}

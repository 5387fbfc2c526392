//! AI fallback scorer: consulted only when rule-based matching produces no
//! candidate above the fuzzy floor. Treated as untrusted — its confidence is
//! capped below the auto-apply threshold and its failures never block the
//! pipeline.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::AiFallbackConfig;
use crate::matching::NormalizedTransaction;
use crate::models::{Customer, Invoice};

// ============================================================================
// Wire Contract
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TransactionSummary {
    pub transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub reference: String,
    pub counterparty: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateSummary {
    pub invoice_id: String,
    pub customer_id: String,
    pub customer_name: Option<String>,
    pub outstanding_balance: Decimal,
    pub due_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct FallbackRequest {
    pub transaction: TransactionSummary,
    pub candidates: Vec<CandidateSummary>,
}

impl FallbackRequest {
    pub fn build(
        txn: &NormalizedTransaction,
        invoices: &[Invoice],
        customer_of: impl Fn(&str) -> Option<Customer>,
    ) -> Self {
        Self {
            transaction: TransactionSummary {
                transaction_id: txn.transaction_id.clone(),
                amount: txn.amount,
                currency: txn.currency.clone(),
                reference: txn.reference.clone(),
                counterparty: txn.counterparty.clone(),
            },
            candidates: invoices
                .iter()
                .map(|inv| CandidateSummary {
                    invoice_id: inv.invoice_id.clone(),
                    customer_id: inv.customer_id.clone(),
                    customer_name: customer_of(&inv.customer_id).map(|c| c.canonical_name),
                    outstanding_balance: inv.outstanding_balance,
                    due_date: inv.due_date,
                })
                .collect(),
        }
    }
}

/// A positive suggestion from the fallback scorer. `None` from the trait
/// means the scorer saw no plausible match.
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackSuggestion {
    pub invoice_id: String,
    pub confidence: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Deserialize)]
struct FallbackResponse {
    invoice_id: Option<String>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    rationale: String,
}

// ============================================================================
// Scorer Seam
// ============================================================================

#[async_trait]
pub trait FallbackScorer: Send + Sync {
    /// Whether the fallback is configured at all. When false the pipeline
    /// skips the call entirely.
    fn enabled(&self) -> bool {
        true
    }

    async fn score(&self, request: &FallbackRequest) -> Result<Option<FallbackSuggestion>, AppError>;
}

/// No-op scorer used when no fallback endpoint is configured.
pub struct DisabledFallback;

#[async_trait]
impl FallbackScorer for DisabledFallback {
    fn enabled(&self) -> bool {
        false
    }

    async fn score(
        &self,
        _request: &FallbackRequest,
    ) -> Result<Option<FallbackSuggestion>, AppError> {
        Ok(None)
    }
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Opens after a run of consecutive failures and rejects calls until the
/// cooldown elapses, degrading the pipeline to rule-based-only.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
    open_until: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            consecutive_failures: AtomicU32::new(0),
            open_until: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        let mut open_until = self.open_until.lock().unwrap_or_else(|e| e.into_inner());
        match *open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Cooldown elapsed: half-open, allow the next probe through.
                *open_until = None;
                false
            }
            None => false,
        }
    }

    pub fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub fn on_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.threshold {
            let mut open_until = self.open_until.lock().unwrap_or_else(|e| e.into_inner());
            *open_until = Some(Instant::now() + self.cooldown);
            tracing::warn!(
                consecutive_failures = failures,
                cooldown_secs = self.cooldown.as_secs(),
                "AI fallback circuit breaker opened"
            );
        }
    }
}

// ============================================================================
// HTTP Client
// ============================================================================

/// JSON client for the external assist collaborator. Hard request timeout,
/// at most one retry per transaction, breaker on repeated failures.
pub struct HttpFallbackScorer {
    client: reqwest::Client,
    url: String,
    retry: RetryConfig,
    breaker: CircuitBreaker,
}

impl HttpFallbackScorer {
    pub fn new(config: &AiFallbackConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("AI client build failed: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            retry: RetryConfig {
                max_retries: 1,
                initial_backoff: Duration::from_millis(100),
                ..RetryConfig::default()
            },
            breaker: CircuitBreaker::new(
                config.breaker_threshold,
                Duration::from_secs(config.breaker_cooldown_secs),
            ),
        })
    }

    async fn post_once(&self, request: &FallbackRequest) -> Result<FallbackResponse, AppError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| AppError::ExternalServiceError(format!("ai fallback send: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::ExternalServiceError(format!(
                "ai fallback status {}",
                response.status()
            )));
        }

        response
            .json::<FallbackResponse>()
            .await
            .map_err(|e| AppError::ExternalServiceError(format!("ai fallback decode: {}", e)))
    }
}

#[async_trait]
impl FallbackScorer for HttpFallbackScorer {
    async fn score(&self, request: &FallbackRequest) -> Result<Option<FallbackSuggestion>, AppError> {
        if self.breaker.is_open() {
            return Err(AppError::ServiceUnavailable);
        }

        let result = retry_with_backoff(
            &self.retry,
            "ai_fallback_score",
            |e: &AppError| matches!(e, AppError::ExternalServiceError(_)),
            || self.post_once(request),
        )
        .await;

        match result {
            Ok(response) => {
                self.breaker.on_success();
                Ok(response.invoice_id.map(|invoice_id| FallbackSuggestion {
                    invoice_id,
                    confidence: response.confidence.clamp(0.0, 1.0),
                    rationale: response.rationale,
                }))
            }
            Err(e) => {
                self.breaker.on_failure();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold_and_recloses_after_cooldown() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(20));
        assert!(!breaker.is_open());

        breaker.on_failure();
        breaker.on_failure();
        assert!(!breaker.is_open());

        breaker.on_failure();
        assert!(breaker.is_open());

        std::thread::sleep(Duration::from_millis(30));
        assert!(!breaker.is_open());
    }

    #[test]
    fn success_resets_failure_run() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn disabled_fallback_is_inert() {
        let fallback = DisabledFallback;
        assert!(!fallback.enabled());
        let request = FallbackRequest {
            transaction: TransactionSummary {
                transaction_id: "TXN-1".to_string(),
                amount: Decimal::ONE,
                currency: "UGX".to_string(),
                reference: "ref".to_string(),
                counterparty: "acme".to_string(),
            },
            candidates: vec![],
        };
        assert!(fallback.score(&request).await.unwrap().is_none());
    }
}

//! Common test utilities for reconciliation-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Once;
use std::sync::Arc;

use reconciliation_service::ai::{
    DisabledFallback, FallbackRequest, FallbackScorer, FallbackSuggestion,
};
use reconciliation_service::config::ReconciliationConfig;
use reconciliation_service::models::{Customer, Invoice, InvoiceStatus, Transaction};
use reconciliation_service::pipeline::Orchestrator;
use reconciliation_service::services::{MemoryStore, ReconciliationStore};
use service_core::config::Config as CommonConfig;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,reconciliation_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Test configuration: in-memory store, AI fallback disabled, port 0.
pub fn test_config() -> ReconciliationConfig {
    let mut config = ReconciliationConfig::from_env().expect("config from env");
    config.common = CommonConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        environment: "test".to_string(),
    };
    config.database.url = String::new();
    config.ai_fallback.url = String::new();
    config
}

/// Orchestrator over a fresh in-memory store with the AI fallback disabled.
pub fn orchestrator() -> (Arc<Orchestrator>, Arc<MemoryStore>) {
    orchestrator_with_fallback(Arc::new(DisabledFallback))
}

pub fn orchestrator_with_fallback(
    fallback: Arc<dyn FallbackScorer>,
) -> (Arc<Orchestrator>, Arc<MemoryStore>) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone() as Arc<dyn ReconciliationStore>,
        fallback,
        test_config(),
    ));
    (orchestrator, store)
}

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

pub fn due(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn transaction(
    id: &str,
    amount: Decimal,
    reference: &str,
    counterparty: &str,
    timestamp: DateTime<Utc>,
) -> Transaction {
    Transaction {
        transaction_id: id.to_string(),
        amount,
        currency: "UGX".to_string(),
        reference: reference.to_string(),
        counterparty_name: counterparty.to_string(),
        timestamp,
        channel: "mobile_money".to_string(),
        ingested_utc: Utc::now(),
    }
}

pub async fn seed_customer(
    store: &MemoryStore,
    customer_id: &str,
    name: &str,
    aliases: &[&str],
) -> Customer {
    store
        .upsert_customer(Customer {
            customer_id: customer_id.to_string(),
            canonical_name: name.to_string(),
            name_aliases: aliases.iter().map(|s| s.to_string()).collect(),
            created_utc: Utc::now(),
        })
        .await
        .expect("seed customer")
}

pub async fn seed_invoice(
    store: &MemoryStore,
    invoice_id: &str,
    customer_id: &str,
    amount: Decimal,
    due_date: NaiveDate,
) -> Invoice {
    store
        .create_invoice(Invoice {
            invoice_id: invoice_id.to_string(),
            customer_id: customer_id.to_string(),
            original_amount: amount,
            outstanding_balance: amount,
            due_date,
            status: InvoiceStatus::Open.as_str().to_string(),
            version: 1,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        })
        .await
        .expect("seed invoice")
}

/// Fallback stub returning a fixed suggestion.
pub struct StubFallback {
    pub invoice_id: String,
    pub confidence: f64,
}

#[async_trait]
impl FallbackScorer for StubFallback {
    async fn score(
        &self,
        _request: &FallbackRequest,
    ) -> Result<Option<FallbackSuggestion>, AppError> {
        Ok(Some(FallbackSuggestion {
            invoice_id: self.invoice_id.clone(),
            confidence: self.confidence,
            rationale: "stubbed suggestion".to_string(),
        }))
    }
}

/// Fallback stub that always fails, as a timed-out or unreachable scorer does.
pub struct FailingFallback;

#[async_trait]
impl FallbackScorer for FailingFallback {
    async fn score(
        &self,
        _request: &FallbackRequest,
    ) -> Result<Option<FallbackSuggestion>, AppError> {
        Err(AppError::ExternalServiceError(
            "ai fallback send: operation timed out".to_string(),
        ))
    }
}

/// Fallback stub that reports no plausible match.
pub struct NoMatchFallback;

#[async_trait]
impl FallbackScorer for NoMatchFallback {
    async fn score(
        &self,
        _request: &FallbackRequest,
    ) -> Result<Option<FallbackSuggestion>, AppError> {
        Ok(None)
    }
}

//! Request handlers and their DTOs.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use validator::Validate;

use crate::models::{Customer, Invoice, InvoiceStatus, Transaction};
use crate::startup::AppState;

// ============================================================================
// Transaction Ingestion
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IngestTransactionRequest {
    #[validate(length(min = 1, message = "transaction_id is required"))]
    pub transaction_id: String,

    pub amount: Decimal,

    #[validate(length(min = 3, max = 3, message = "currency must be an ISO 4217 code"))]
    pub currency: String,

    #[serde(default)]
    pub reference: String,

    #[serde(default)]
    pub counterparty_name: String,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub channel: String,
}

impl IngestTransactionRequest {
    fn into_transaction(self) -> Result<Transaction, AppError> {
        if self.amount <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "amount must be positive"
            )));
        }
        Ok(Transaction {
            transaction_id: self.transaction_id,
            amount: self.amount,
            currency: self.currency,
            reference: self.reference,
            counterparty_name: self.counterparty_name,
            timestamp: self.timestamp,
            channel: self.channel,
            ingested_utc: Utc::now(),
        })
    }
}

pub async fn ingest_transaction(
    State(state): State<AppState>,
    Json(req): Json<IngestTransactionRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let txn = req.into_transaction()?;
    tracing::info!(transaction_id = %txn.transaction_id, "Ingesting transaction");

    let record = state.orchestrator.ingest(txn).await?;
    Ok((StatusCode::OK, Json(record)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct IngestBatchRequest {
    #[validate(
        length(min = 1, message = "batch must contain at least one transaction"),
        nested
    )]
    pub transactions: Vec<IngestTransactionRequest>,
}

pub async fn ingest_batch(
    State(state): State<AppState>,
    Json(req): Json<IngestBatchRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let transactions = req
        .transactions
        .into_iter()
        .map(IngestTransactionRequest::into_transaction)
        .collect::<Result<Vec<_>, _>>()?;

    tracing::info!(batch_size = transactions.len(), "Running batch reconciliation");

    // Batches stop dequeuing when the service begins shutting down;
    // in-flight transactions still run to completion.
    let cancel = state.shutdown.child_token();
    let summary = state.orchestrator.clone().run_batch(transactions, cancel).await?;
    Ok((StatusCode::OK, Json(summary)))
}

// ============================================================================
// Records and Reviews
// ============================================================================

pub async fn get_record(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let record = state
        .store
        .get_record(&transaction_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("no record for transaction {}", transaction_id))
        })?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct ListReviewsParams {
    #[serde(default = "default_review_limit")]
    pub limit: i64,
}

fn default_review_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct PendingReviewsResponse {
    pub reviews: Vec<crate::models::ReconciliationRecord>,
}

pub async fn list_reviews(
    State(state): State<AppState>,
    Query(params): Query<ListReviewsParams>,
) -> Result<impl IntoResponse, AppError> {
    let reviews = state.store.pending_reviews(params.limit).await?;
    Ok(Json(PendingReviewsResponse { reviews }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResolveReviewRequest {
    #[serde(default)]
    pub chosen_invoice_ids: Vec<String>,

    #[validate(length(min = 1, message = "reviewer_id is required"))]
    pub reviewer_id: String,

    pub approve: bool,
}

pub async fn resolve_review(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
    Json(req): Json<ResolveReviewRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    tracing::info!(
        transaction_id = %transaction_id,
        reviewer_id = %req.reviewer_id,
        approve = req.approve,
        "Resolving manual review"
    );

    let record = state
        .orchestrator
        .resolve(
            &transaction_id,
            req.chosen_invoice_ids,
            &req.reviewer_id,
            req.approve,
        )
        .await?;
    Ok(Json(record))
}

// ============================================================================
// Collaborator Seams: Customers and Invoices
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCustomerRequest {
    #[validate(length(min = 1, message = "customer_id is required"))]
    pub customer_id: String,

    #[validate(length(min = 1, message = "canonical_name is required"))]
    pub canonical_name: String,

    #[serde(default)]
    pub name_aliases: Vec<String>,
}

pub async fn create_customer(
    State(state): State<AppState>,
    Json(req): Json<CreateCustomerRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let customer = state
        .store
        .upsert_customer(Customer {
            customer_id: req.customer_id,
            canonical_name: req.canonical_name,
            name_aliases: req.name_aliases,
            created_utc: Utc::now(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(customer)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateInvoiceRequest {
    #[validate(length(min = 1, message = "invoice_id is required"))]
    pub invoice_id: String,

    #[validate(length(min = 1, message = "customer_id is required"))]
    pub customer_id: String,

    pub original_amount: Decimal,

    pub due_date: NaiveDate,
}

pub async fn create_invoice(
    State(state): State<AppState>,
    Json(req): Json<CreateInvoiceRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    if req.original_amount <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "original_amount must be positive"
        )));
    }

    let now = Utc::now();
    let invoice = state
        .store
        .create_invoice(Invoice {
            invoice_id: req.invoice_id,
            customer_id: req.customer_id,
            original_amount: req.original_amount,
            outstanding_balance: req.original_amount,
            due_date: req.due_date,
            status: InvoiceStatus::Open.as_str().to_string(),
            version: 1,
            created_utc: now,
            updated_utc: now,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let invoice = state
        .store
        .get_invoice(&invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("invoice {} not found", invoice_id)))?;
    Ok(Json(invoice))
}

// ============================================================================
// Audit
// ============================================================================

#[derive(Debug, Serialize)]
pub struct AuditTrailResponse {
    pub entries: Vec<crate::models::AuditEntry>,
}

pub async fn get_audit_trail(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let entries = state.store.audit_trail(&transaction_id).await?;
    Ok(Json(AuditTrailResponse { entries }))
}

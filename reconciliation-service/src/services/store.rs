//! Persistence seam for the reconciliation pipeline.

use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;

use crate::matching::CustomerSnapshot;
use crate::models::{
    AuditEntry, Customer, CustomerCredit, Invoice, ReconciliationRecord, Transaction,
};

/// Outcome of the idempotent transaction insert.
#[derive(Debug)]
pub enum TransactionInsert {
    /// First sighting of this `transaction_id`; the pipeline should run.
    Inserted,
    /// Identical payload already stored; the caller should return the
    /// existing record (or resume processing if none was written yet).
    Existing(Box<Transaction>),
}

/// Durable state shared by the orchestrator, the allocation engine, and the
/// HTTP surface. Two implementations: Postgres for production, in-memory for
/// tests and local development. Semantics (idempotency, version CAS,
/// append-only audit) are identical across both.
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // =========================================================================
    // Reference data (invoicing collaborator seam)
    // =========================================================================

    async fn upsert_customer(&self, customer: Customer) -> Result<Customer, AppError>;

    async fn create_invoice(&self, invoice: Invoice) -> Result<Invoice, AppError>;

    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>, AppError>;

    /// Open (open or partially paid) invoices for one customer, oldest due
    /// date first. Waterfall allocation relies on this ordering.
    async fn open_invoices_for_customer(&self, customer_id: &str)
        -> Result<Vec<Invoice>, AppError>;

    /// Read-only snapshot of all customers and open invoices for a batch run.
    async fn snapshot(&self) -> Result<CustomerSnapshot, AppError>;

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Insert a transaction, enforcing the idempotency key. A re-submission
    /// with identical fields returns `Existing`; a conflicting re-submission
    /// (same id, different fields) is rejected with `AppError::Conflict`.
    async fn insert_transaction(&self, txn: &Transaction) -> Result<TransactionInsert, AppError>;

    async fn get_transaction(&self, transaction_id: &str)
        -> Result<Option<Transaction>, AppError>;

    // =========================================================================
    // Invoice balance (compare-and-swap)
    // =========================================================================

    /// Apply a payment against an invoice iff its version still matches.
    /// Returns the updated invoice; `AppError::VersionConflict` when another
    /// writer got there first. Never lets the balance go negative.
    async fn apply_invoice_payment(
        &self,
        invoice_id: &str,
        amount: Decimal,
        expected_version: i64,
    ) -> Result<Invoice, AppError>;

    // =========================================================================
    // Reconciliation records
    // =========================================================================

    /// Insert the unique per-transaction record. `AppError::Conflict` if one
    /// already exists.
    async fn insert_record(&self, record: &ReconciliationRecord) -> Result<(), AppError>;

    /// Amend a record with its manual-review resolution. Rejects records that
    /// are not pending review.
    async fn update_record_resolution(
        &self,
        record: &ReconciliationRecord,
    ) -> Result<(), AppError>;

    async fn get_record(
        &self,
        transaction_id: &str,
    ) -> Result<Option<ReconciliationRecord>, AppError>;

    /// Pending manual-review queue, oldest decision first.
    async fn pending_reviews(&self, limit: i64) -> Result<Vec<ReconciliationRecord>, AppError>;

    // =========================================================================
    // Credits and audit
    // =========================================================================

    async fn record_credit(&self, credit: &CustomerCredit) -> Result<(), AppError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), AppError>;

    async fn audit_trail(&self, transaction_id: &str) -> Result<Vec<AuditEntry>, AppError>;
}

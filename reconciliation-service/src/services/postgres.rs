//! Postgres implementation of the reconciliation store.

#![allow(clippy::too_many_arguments)]

use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::time::Duration;
use tracing::{info, instrument};

use crate::matching::CustomerSnapshot;
use crate::models::{
    Allocation, AuditEntry, Customer, CustomerCredit, Invoice, ReconciliationRecord, Transaction,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{ReconciliationStore, TransactionInsert};

const INVOICE_COLUMNS: &str = "invoice_id, customer_id, original_amount, outstanding_balance, due_date, status, version, created_utc, updated_utc";
const RECORD_COLUMNS: &str = "transaction_id, decision, match_type, confidence, allocations, unallocated_amount, rationale, decided_utc, reviewer_id, resolution, resolved_utc";

/// Row adapter: allocations and rationale live in JSONB columns.
#[derive(Debug, FromRow)]
struct RecordRow {
    transaction_id: String,
    decision: String,
    match_type: Option<String>,
    confidence: f64,
    allocations: Json<Vec<Allocation>>,
    unallocated_amount: Decimal,
    rationale: Json<serde_json::Value>,
    decided_utc: chrono::DateTime<chrono::Utc>,
    reviewer_id: Option<String>,
    resolution: Option<String>,
    resolved_utc: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<RecordRow> for ReconciliationRecord {
    fn from(row: RecordRow) -> Self {
        Self {
            transaction_id: row.transaction_id,
            decision: row.decision,
            match_type: row.match_type,
            confidence: row.confidence,
            allocations: row.allocations.0,
            unallocated_amount: row.unallocated_amount,
            rationale: row.rationale.0,
            decided_utc: row.decided_utc,
            reviewer_id: row.reviewer_id,
            resolution: row.resolution,
            resolved_utc: row.resolved_utc,
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "reconciliation-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

fn db_err(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}

#[async_trait]
impl ReconciliationStore for PgStore {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, customer), fields(customer_id = %customer.customer_id))]
    async fn upsert_customer(&self, customer: Customer) -> Result<Customer, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_customer"])
            .start_timer();

        let stored = sqlx::query_as::<_, Customer>(
            r#"
            INSERT INTO customers (customer_id, canonical_name, name_aliases, created_utc)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (customer_id)
            DO UPDATE SET canonical_name = EXCLUDED.canonical_name, name_aliases = EXCLUDED.name_aliases
            RETURNING customer_id, canonical_name, name_aliases, created_utc
            "#,
        )
        .bind(&customer.customer_id)
        .bind(&customer.canonical_name)
        .bind(&customer.name_aliases)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("Failed to upsert customer", e))?;

        timer.observe_duration();
        Ok(stored)
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id))]
    async fn create_invoice(&self, invoice: Invoice) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let query = format!(
            r#"
            INSERT INTO invoices (invoice_id, customer_id, original_amount, outstanding_balance, due_date, status, version, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            RETURNING {INVOICE_COLUMNS}
            "#
        );
        let stored = sqlx::query_as::<_, Invoice>(&query)
            .bind(&invoice.invoice_id)
            .bind(&invoice.customer_id)
            .bind(invoice.original_amount)
            .bind(invoice.outstanding_balance)
            .bind(invoice.due_date)
            .bind(&invoice.status)
            .bind(invoice.version)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict(anyhow::anyhow!(
                        "invoice {} already exists",
                        invoice.invoice_id
                    ))
                } else {
                    db_err("Failed to create invoice", e)
                }
            })?;

        timer.observe_duration();
        info!(invoice_id = %stored.invoice_id, "Invoice created");
        Ok(stored)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let query = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE invoice_id = $1");
        let invoice = sqlx::query_as::<_, Invoice>(&query)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("Failed to get invoice", e))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(customer_id = %customer_id))]
    async fn open_invoices_for_customer(
        &self,
        customer_id: &str,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["open_invoices_for_customer"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE customer_id = $1 AND status IN ('open', 'partially_paid')
            ORDER BY due_date, invoice_id
            "#
        );
        let invoices = sqlx::query_as::<_, Invoice>(&query)
            .bind(customer_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("Failed to list open invoices", e))?;

        timer.observe_duration();
        Ok(invoices)
    }

    #[instrument(skip(self))]
    async fn snapshot(&self) -> Result<CustomerSnapshot, AppError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["snapshot"]).start_timer();

        let customers = sqlx::query_as::<_, Customer>(
            "SELECT customer_id, canonical_name, name_aliases, created_utc FROM customers",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to load customers", e))?;

        let query = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE status IN ('open', 'partially_paid')"
        );
        let open_invoices = sqlx::query_as::<_, Invoice>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("Failed to load open invoices", e))?;

        timer.observe_duration();
        Ok(CustomerSnapshot::build(customers, open_invoices))
    }

    #[instrument(skip(self, txn), fields(transaction_id = %txn.transaction_id))]
    async fn insert_transaction(&self, txn: &Transaction) -> Result<TransactionInsert, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_transaction"])
            .start_timer();

        // The unique constraint on transaction_id is the idempotency
        // enforcement point; ON CONFLICT DO NOTHING makes the race benign.
        let inserted = sqlx::query(
            r#"
            INSERT INTO transactions (transaction_id, amount, currency, reference, counterparty_name, timestamp, channel, ingested_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (transaction_id) DO NOTHING
            "#,
        )
        .bind(&txn.transaction_id)
        .bind(txn.amount)
        .bind(&txn.currency)
        .bind(&txn.reference)
        .bind(&txn.counterparty_name)
        .bind(txn.timestamp)
        .bind(&txn.channel)
        .bind(txn.ingested_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to insert transaction", e))?;

        if inserted.rows_affected() == 1 {
            timer.observe_duration();
            return Ok(TransactionInsert::Inserted);
        }

        let existing = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT transaction_id, amount, currency, reference, counterparty_name, timestamp, channel, ingested_utc
            FROM transactions
            WHERE transaction_id = $1
            "#,
        )
        .bind(&txn.transaction_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("Failed to fetch existing transaction", e))?;

        timer.observe_duration();

        if existing.same_payload(txn) {
            Ok(TransactionInsert::Existing(Box::new(existing)))
        } else {
            Err(AppError::Conflict(anyhow::anyhow!(
                "transaction {} re-submitted with different fields",
                txn.transaction_id
            )))
        }
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let txn = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT transaction_id, amount, currency, reference, counterparty_name, timestamp, channel, ingested_utc
            FROM transactions
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("Failed to get transaction", e))?;

        timer.observe_duration();
        Ok(txn)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id, amount = %amount, expected_version = expected_version))]
    async fn apply_invoice_payment(
        &self,
        invoice_id: &str,
        amount: Decimal,
        expected_version: i64,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_invoice_payment"])
            .start_timer();

        let query = format!(
            r#"
            UPDATE invoices
            SET outstanding_balance = outstanding_balance - $2,
                status = CASE WHEN outstanding_balance - $2 = 0 THEN 'paid' ELSE 'partially_paid' END,
                version = version + 1,
                updated_utc = NOW()
            WHERE invoice_id = $1 AND version = $3 AND outstanding_balance >= $2 AND $2 > 0
            RETURNING {INVOICE_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, Invoice>(&query)
            .bind(invoice_id)
            .bind(amount)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("Failed to apply invoice payment", e))?;

        timer.observe_duration();

        if let Some(invoice) = updated {
            return Ok(invoice);
        }

        // Diagnose why the guarded update matched nothing.
        match self.get_invoice(invoice_id).await? {
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "invoice {} not found",
                invoice_id
            ))),
            Some(current) if current.version != expected_version => {
                Err(AppError::VersionConflict(anyhow::anyhow!(
                    "invoice {} version {} != expected {}",
                    invoice_id,
                    current.version,
                    expected_version
                )))
            }
            Some(current) => Err(AppError::BadRequest(anyhow::anyhow!(
                "payment {} out of range for invoice {} (outstanding {})",
                amount,
                invoice_id,
                current.outstanding_balance
            ))),
        }
    }

    #[instrument(skip(self, record), fields(transaction_id = %record.transaction_id))]
    async fn insert_record(&self, record: &ReconciliationRecord) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_record"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO reconciliation_records
                (transaction_id, decision, match_type, confidence, allocations, unallocated_amount, rationale, decided_utc, reviewer_id, resolution, resolved_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&record.transaction_id)
        .bind(&record.decision)
        .bind(&record.match_type)
        .bind(record.confidence)
        .bind(Json(&record.allocations))
        .bind(record.unallocated_amount)
        .bind(Json(&record.rationale))
        .bind(record.decided_utc)
        .bind(&record.reviewer_id)
        .bind(&record.resolution)
        .bind(record.resolved_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!(
                    "record for transaction {} already exists",
                    record.transaction_id
                ))
            } else {
                db_err("Failed to insert record", e)
            }
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, record), fields(transaction_id = %record.transaction_id))]
    async fn update_record_resolution(
        &self,
        record: &ReconciliationRecord,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_record_resolution"])
            .start_timer();

        let updated = sqlx::query(
            r#"
            UPDATE reconciliation_records
            SET allocations = $2,
                unallocated_amount = $3,
                rationale = $4,
                reviewer_id = $5,
                resolution = $6,
                resolved_utc = $7
            WHERE transaction_id = $1 AND decision = 'manual_review' AND resolution IS NULL
            "#,
        )
        .bind(&record.transaction_id)
        .bind(Json(&record.allocations))
        .bind(record.unallocated_amount)
        .bind(Json(&record.rationale))
        .bind(&record.reviewer_id)
        .bind(&record.resolution)
        .bind(record.resolved_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to update record resolution", e))?;

        timer.observe_duration();

        if updated.rows_affected() == 0 {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "record for transaction {} is not pending review",
                record.transaction_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn get_record(
        &self,
        transaction_id: &str,
    ) -> Result<Option<ReconciliationRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_record"])
            .start_timer();

        let query =
            format!("SELECT {RECORD_COLUMNS} FROM reconciliation_records WHERE transaction_id = $1");
        let row = sqlx::query_as::<_, RecordRow>(&query)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("Failed to get record", e))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn pending_reviews(&self, limit: i64) -> Result<Vec<ReconciliationRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["pending_reviews"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM reconciliation_records
            WHERE decision = 'manual_review' AND resolution IS NULL
            ORDER BY decided_utc
            LIMIT $1
            "#
        );
        let rows = sqlx::query_as::<_, RecordRow>(&query)
            .bind(limit.clamp(1, 500))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("Failed to list pending reviews", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self, credit), fields(transaction_id = %credit.transaction_id))]
    async fn record_credit(&self, credit: &CustomerCredit) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_credit"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO customer_credits (credit_id, customer_id, transaction_id, amount, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(credit.credit_id)
        .bind(&credit.customer_id)
        .bind(&credit.transaction_id)
        .bind(credit.amount)
        .bind(credit.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to record credit", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, entry), fields(transaction_id = %entry.transaction_id, stage = %entry.stage))]
    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_audit"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO audit_log (audit_id, transaction_id, stage, decision, actor, detail, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.audit_id)
        .bind(&entry.transaction_id)
        .bind(&entry.stage)
        .bind(&entry.decision)
        .bind(&entry.actor)
        .bind(Json(&entry.detail))
        .bind(entry.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to append audit entry", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn audit_trail(&self, transaction_id: &str) -> Result<Vec<AuditEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["audit_trail"])
            .start_timer();

        let entries = sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT audit_id, transaction_id, stage, decision, actor, detail, created_utc
            FROM audit_log
            WHERE transaction_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to read audit trail", e))?;

        timer.observe_duration();
        Ok(entries)
    }
}

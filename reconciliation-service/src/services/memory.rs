//! In-memory store: test and local-development implementation of
//! [`ReconciliationStore`] with the same idempotency and compare-and-swap
//! semantics as the Postgres store.

use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::matching::CustomerSnapshot;
use crate::models::{
    AuditEntry, Customer, CustomerCredit, Decision, Invoice, InvoiceStatus, ReconciliationRecord,
    Transaction,
};
use crate::services::store::{ReconciliationStore, TransactionInsert};

#[derive(Default)]
pub struct MemoryStore {
    customers: RwLock<HashMap<String, Customer>>,
    invoices: RwLock<HashMap<String, Invoice>>,
    transactions: RwLock<HashMap<String, Transaction>>,
    records: RwLock<HashMap<String, ReconciliationRecord>>,
    credits: RwLock<Vec<CustomerCredit>>,
    audit: RwLock<Vec<AuditEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded unallocated credits, oldest first. Test and dev convenience;
    /// the Postgres store exposes these through reporting queries instead.
    pub async fn credits(&self) -> Vec<CustomerCredit> {
        self.credits.read().await.clone()
    }
}

#[async_trait]
impl ReconciliationStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn upsert_customer(&self, customer: Customer) -> Result<Customer, AppError> {
        self.customers
            .write()
            .await
            .insert(customer.customer_id.clone(), customer.clone());
        Ok(customer)
    }

    async fn create_invoice(&self, invoice: Invoice) -> Result<Invoice, AppError> {
        let mut invoices = self.invoices.write().await;
        if invoices.contains_key(&invoice.invoice_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "invoice {} already exists",
                invoice.invoice_id
            )));
        }
        invoices.insert(invoice.invoice_id.clone(), invoice.clone());
        Ok(invoice)
    }

    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>, AppError> {
        Ok(self.invoices.read().await.get(invoice_id).cloned())
    }

    async fn open_invoices_for_customer(
        &self,
        customer_id: &str,
    ) -> Result<Vec<Invoice>, AppError> {
        let mut open: Vec<Invoice> = self
            .invoices
            .read()
            .await
            .values()
            .filter(|inv| inv.customer_id == customer_id && inv.is_open())
            .cloned()
            .collect();
        open.sort_by(|a, b| {
            a.due_date
                .cmp(&b.due_date)
                .then_with(|| a.invoice_id.cmp(&b.invoice_id))
        });
        Ok(open)
    }

    async fn snapshot(&self) -> Result<CustomerSnapshot, AppError> {
        let customers: Vec<Customer> = self.customers.read().await.values().cloned().collect();
        let open_invoices: Vec<Invoice> = self
            .invoices
            .read()
            .await
            .values()
            .filter(|inv| inv.is_open())
            .cloned()
            .collect();
        Ok(CustomerSnapshot::build(customers, open_invoices))
    }

    async fn insert_transaction(&self, txn: &Transaction) -> Result<TransactionInsert, AppError> {
        let mut transactions = self.transactions.write().await;
        if let Some(existing) = transactions.get(&txn.transaction_id) {
            if existing.same_payload(txn) {
                return Ok(TransactionInsert::Existing(Box::new(existing.clone())));
            }
            return Err(AppError::Conflict(anyhow::anyhow!(
                "transaction {} re-submitted with different fields",
                txn.transaction_id
            )));
        }
        transactions.insert(txn.transaction_id.clone(), txn.clone());
        Ok(TransactionInsert::Inserted)
    }

    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Transaction>, AppError> {
        Ok(self.transactions.read().await.get(transaction_id).cloned())
    }

    async fn apply_invoice_payment(
        &self,
        invoice_id: &str,
        amount: Decimal,
        expected_version: i64,
    ) -> Result<Invoice, AppError> {
        let mut invoices = self.invoices.write().await;
        let invoice = invoices
            .get_mut(invoice_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("invoice {} not found", invoice_id)))?;

        if invoice.version != expected_version {
            return Err(AppError::VersionConflict(anyhow::anyhow!(
                "invoice {} version {} != expected {}",
                invoice_id,
                invoice.version,
                expected_version
            )));
        }
        if amount <= Decimal::ZERO || amount > invoice.outstanding_balance {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "payment {} out of range for invoice {} (outstanding {})",
                amount,
                invoice_id,
                invoice.outstanding_balance
            )));
        }

        invoice.outstanding_balance -= amount;
        invoice.status = if invoice.outstanding_balance.is_zero() {
            InvoiceStatus::Paid.as_str().to_string()
        } else {
            InvoiceStatus::PartiallyPaid.as_str().to_string()
        };
        invoice.version += 1;
        invoice.updated_utc = chrono::Utc::now();

        Ok(invoice.clone())
    }

    async fn insert_record(&self, record: &ReconciliationRecord) -> Result<(), AppError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.transaction_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "record for transaction {} already exists",
                record.transaction_id
            )));
        }
        records.insert(record.transaction_id.clone(), record.clone());
        Ok(())
    }

    async fn update_record_resolution(
        &self,
        record: &ReconciliationRecord,
    ) -> Result<(), AppError> {
        let mut records = self.records.write().await;
        let existing = records.get(&record.transaction_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "record for transaction {} not found",
                record.transaction_id
            ))
        })?;
        if existing.decision() != Decision::ManualReview || existing.is_resolved() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "record for transaction {} is not pending review",
                record.transaction_id
            )));
        }
        records.insert(record.transaction_id.clone(), record.clone());
        Ok(())
    }

    async fn get_record(
        &self,
        transaction_id: &str,
    ) -> Result<Option<ReconciliationRecord>, AppError> {
        Ok(self.records.read().await.get(transaction_id).cloned())
    }

    async fn pending_reviews(&self, limit: i64) -> Result<Vec<ReconciliationRecord>, AppError> {
        let mut pending: Vec<ReconciliationRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.decision() == Decision::ManualReview && !r.is_resolved())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.decided_utc.cmp(&b.decided_utc));
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn record_credit(&self, credit: &CustomerCredit) -> Result<(), AppError> {
        self.credits.write().await.push(credit.clone());
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), AppError> {
        self.audit.write().await.push(entry.clone());
        Ok(())
    }

    async fn audit_trail(&self, transaction_id: &str) -> Result<Vec<AuditEntry>, AppError> {
        let mut trail: Vec<AuditEntry> = self
            .audit
            .read()
            .await
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect();
        trail.sort_by(|a, b| a.created_utc.cmp(&b.created_utc));
        Ok(trail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;

    fn invoice(id: &str, outstanding: Decimal) -> Invoice {
        Invoice {
            invoice_id: id.to_string(),
            customer_id: "C-1".to_string(),
            original_amount: outstanding,
            outstanding_balance: outstanding,
            due_date: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            status: InvoiceStatus::Open.as_str().to_string(),
            version: 1,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    fn txn(id: &str, amount: Decimal) -> Transaction {
        Transaction {
            transaction_id: id.to_string(),
            amount,
            currency: "UGX".to_string(),
            reference: "ref".to_string(),
            counterparty_name: "Acme".to_string(),
            timestamp: Utc::now(),
            channel: "bank".to_string(),
            ingested_utc: Utc::now(),
        }
    }

    #[tokio::test]
    async fn cas_rejects_stale_version() {
        let store = MemoryStore::new();
        store.create_invoice(invoice("INV-1", dec!(100))).await.unwrap();

        let updated = store
            .apply_invoice_payment("INV-1", dec!(40), 1)
            .await
            .unwrap();
        assert_eq!(updated.outstanding_balance, dec!(60));
        assert_eq!(updated.version, 2);
        assert_eq!(updated.status, "partially_paid");

        let stale = store.apply_invoice_payment("INV-1", dec!(60), 1).await;
        assert!(matches!(stale, Err(AppError::VersionConflict(_))));
    }

    #[tokio::test]
    async fn payment_never_exceeds_outstanding() {
        let store = MemoryStore::new();
        store.create_invoice(invoice("INV-1", dec!(100))).await.unwrap();

        let result = store.apply_invoice_payment("INV-1", dec!(150), 1).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));

        let unchanged = store.get_invoice("INV-1").await.unwrap().unwrap();
        assert_eq!(unchanged.outstanding_balance, dec!(100));
        assert_eq!(unchanged.version, 1);
    }

    #[tokio::test]
    async fn full_payment_marks_invoice_paid() {
        let store = MemoryStore::new();
        store.create_invoice(invoice("INV-1", dec!(100))).await.unwrap();

        let updated = store
            .apply_invoice_payment("INV-1", dec!(100), 1)
            .await
            .unwrap();
        assert_eq!(updated.status, "paid");
        assert!(!updated.is_open());
    }

    #[tokio::test]
    async fn duplicate_transaction_detection() {
        let store = MemoryStore::new();
        let t = txn("TXN-1", dec!(50));

        assert!(matches!(
            store.insert_transaction(&t).await.unwrap(),
            TransactionInsert::Inserted
        ));
        assert!(matches!(
            store.insert_transaction(&t).await.unwrap(),
            TransactionInsert::Existing(_)
        ));

        let mut mutated = t.clone();
        mutated.amount = dec!(51);
        assert!(matches!(
            store.insert_transaction(&mutated).await,
            Err(AppError::Conflict(_))
        ));
    }
}

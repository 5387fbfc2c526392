//! Candidate generation: bound the set of invoices each transaction is
//! scored against.

use crate::config::MatchingConfig;
use crate::matching::normalizer::{normalize_msisdn, normalize_text, NormalizedTransaction};
use crate::models::{Customer, Invoice};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Read-only view of customers and open invoices for one batch run. Built
/// from the store before the run starts and never mutated, so concurrent
/// pipelines share it freely and batches cannot leak state into each other.
#[derive(Debug, Default, Clone)]
pub struct CustomerSnapshot {
    customers: HashMap<String, Customer>,
    alias_index: HashMap<String, String>,
    invoices_by_customer: HashMap<String, Vec<Invoice>>,
    open_invoices: Vec<Invoice>,
}

impl CustomerSnapshot {
    pub fn build(customers: Vec<Customer>, open_invoices: Vec<Invoice>) -> Self {
        let mut alias_index = HashMap::new();
        for customer in &customers {
            let canonical = normalize_text(&customer.canonical_name);
            if !canonical.is_empty() {
                alias_index.insert(canonical, customer.customer_id.clone());
            }
            for alias in &customer.name_aliases {
                let normalized = normalize_text(alias);
                if !normalized.is_empty() {
                    alias_index.insert(normalized, customer.customer_id.clone());
                }
                let msisdn = normalize_msisdn(alias);
                if !msisdn.is_empty() {
                    alias_index.insert(msisdn, customer.customer_id.clone());
                }
            }
        }

        let mut invoices_by_customer: HashMap<String, Vec<Invoice>> = HashMap::new();
        for invoice in &open_invoices {
            invoices_by_customer
                .entry(invoice.customer_id.clone())
                .or_default()
                .push(invoice.clone());
        }

        Self {
            customers: customers
                .into_iter()
                .map(|c| (c.customer_id.clone(), c))
                .collect(),
            alias_index,
            invoices_by_customer,
            open_invoices,
        }
    }

    pub fn customer(&self, customer_id: &str) -> Option<&Customer> {
        self.customers.get(customer_id)
    }

    /// Resolve a counterparty to a customer via the normalized alias index,
    /// trying the name form first and the phone form second.
    pub fn resolve_counterparty(&self, txn: &NormalizedTransaction) -> Option<&Customer> {
        let by_name = self.alias_index.get(&txn.counterparty);
        let customer_id = match by_name {
            Some(id) => Some(id),
            None if !txn.counterparty_msisdn.is_empty() => {
                self.alias_index.get(&txn.counterparty_msisdn)
            }
            None => None,
        }?;
        self.customers.get(customer_id)
    }

    pub fn open_invoices_for(&self, customer_id: &str) -> &[Invoice] {
        self.invoices_by_customer
            .get(customer_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn open_invoices(&self) -> &[Invoice] {
        &self.open_invoices
    }
}

/// Output of candidate generation: a bounded invoice set in deterministic
/// order, plus the resolved customer when alias lookup succeeded.
#[derive(Debug, Clone)]
pub struct GeneratedCandidates {
    pub resolved_customer_id: Option<String>,
    pub invoices: Vec<Invoice>,
}

pub struct CandidateGenerator {
    config: MatchingConfig,
}

impl CandidateGenerator {
    pub fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    /// Select the invoices a transaction will be scored against.
    ///
    /// Resolved counterparty: every open invoice of that customer.
    /// Unresolved: all open invoices inside the amount tolerance and
    /// due-date windows. Either way the set is sorted by `invoice_id`
    /// ascending and capped, so downstream tie-breaks are reproducible.
    pub fn generate(
        &self,
        txn: &NormalizedTransaction,
        snapshot: &CustomerSnapshot,
    ) -> GeneratedCandidates {
        let resolved = snapshot.resolve_counterparty(txn);

        let mut invoices: Vec<Invoice> = match resolved {
            Some(customer) => snapshot
                .open_invoices_for(&customer.customer_id)
                .iter()
                .filter(|inv| inv.is_open())
                .cloned()
                .collect(),
            None => snapshot
                .open_invoices()
                .iter()
                .filter(|inv| {
                    inv.is_open()
                        && within_amount_tolerance(
                            txn.amount,
                            inv.outstanding_balance,
                            self.config.amount_tolerance_pct,
                        )
                        && within_due_window(txn.timestamp, inv.due_date, self.config.due_window_days)
                })
                .cloned()
                .collect(),
        };

        invoices.sort_by(|a, b| a.invoice_id.cmp(&b.invoice_id));
        invoices.truncate(self.config.candidate_cap);

        GeneratedCandidates {
            resolved_customer_id: resolved.map(|c| c.customer_id.clone()),
            invoices,
        }
    }
}

pub fn within_amount_tolerance(amount: Decimal, outstanding: Decimal, tolerance_pct: Decimal) -> bool {
    let tolerance = outstanding * tolerance_pct / Decimal::ONE_HUNDRED;
    (amount - outstanding).abs() <= tolerance
}

pub fn within_due_window(timestamp: DateTime<Utc>, due_date: NaiveDate, window_days: i64) -> bool {
    let days = (timestamp.date_naive() - due_date).num_days();
    days.abs() <= window_days
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvoiceStatus, Transaction};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn invoice(id: &str, customer: &str, outstanding: Decimal, due: NaiveDate) -> Invoice {
        Invoice {
            invoice_id: id.to_string(),
            customer_id: customer.to_string(),
            original_amount: outstanding,
            outstanding_balance: outstanding,
            due_date: due,
            status: InvoiceStatus::Open.as_str().to_string(),
            version: 1,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    fn customer(id: &str, name: &str, aliases: &[&str]) -> Customer {
        Customer {
            customer_id: id.to_string(),
            canonical_name: name.to_string(),
            name_aliases: aliases.iter().map(|s| s.to_string()).collect(),
            created_utc: Utc::now(),
        }
    }

    fn txn(amount: Decimal, counterparty: &str) -> NormalizedTransaction {
        NormalizedTransaction::from_transaction(&Transaction {
            transaction_id: "TXN-1".to_string(),
            amount,
            currency: "UGX".to_string(),
            reference: "payment".to_string(),
            counterparty_name: counterparty.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap(),
            channel: "mobile_money".to_string(),
            ingested_utc: Utc::now(),
        })
    }

    fn due(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn resolved_counterparty_limits_to_customer_invoices() {
        let snapshot = CustomerSnapshot::build(
            vec![customer("C-1", "Acme Traders Ltd", &["ACME", "+256700123456"])],
            vec![
                invoice("INV-1", "C-1", dec!(100), due(2024, 6, 10)),
                invoice("INV-2", "C-2", dec!(100), due(2024, 6, 10)),
            ],
        );
        let generator = CandidateGenerator::new(MatchingConfig::default());

        let generated = generator.generate(&txn(dec!(100), "acme traders ltd"), &snapshot);
        assert_eq!(generated.resolved_customer_id.as_deref(), Some("C-1"));
        assert_eq!(generated.invoices.len(), 1);
        assert_eq!(generated.invoices[0].invoice_id, "INV-1");
    }

    #[test]
    fn alias_and_msisdn_both_resolve() {
        let snapshot = CustomerSnapshot::build(
            vec![customer("C-1", "Acme Traders Ltd", &["ACME", "+256700123456"])],
            vec![invoice("INV-1", "C-1", dec!(100), due(2024, 6, 10))],
        );
        let generator = CandidateGenerator::new(MatchingConfig::default());

        let by_alias = generator.generate(&txn(dec!(100), "acme"), &snapshot);
        assert_eq!(by_alias.resolved_customer_id.as_deref(), Some("C-1"));

        let by_phone = generator.generate(&txn(dec!(100), "0700123456"), &snapshot);
        assert_eq!(by_phone.resolved_customer_id.as_deref(), Some("C-1"));
    }

    #[test]
    fn unresolved_counterparty_filters_by_amount_and_window() {
        let snapshot = CustomerSnapshot::build(
            vec![],
            vec![
                invoice("INV-1", "C-1", dec!(100), due(2024, 6, 10)),
                // Outside amount tolerance
                invoice("INV-2", "C-2", dec!(500), due(2024, 6, 10)),
                // Outside due window
                invoice("INV-3", "C-3", dec!(100), due(2023, 1, 1)),
            ],
        );
        let generator = CandidateGenerator::new(MatchingConfig::default());

        let generated = generator.generate(&txn(dec!(100), "unknown payer"), &snapshot);
        assert_eq!(generated.resolved_customer_id, None);
        assert_eq!(generated.invoices.len(), 1);
        assert_eq!(generated.invoices[0].invoice_id, "INV-1");
    }

    #[test]
    fn candidates_are_sorted_and_capped() {
        let mut config = MatchingConfig::default();
        config.candidate_cap = 2;
        let snapshot = CustomerSnapshot::build(
            vec![customer("C-1", "Acme", &[])],
            vec![
                invoice("INV-3", "C-1", dec!(100), due(2024, 6, 10)),
                invoice("INV-1", "C-1", dec!(100), due(2024, 6, 10)),
                invoice("INV-2", "C-1", dec!(100), due(2024, 6, 10)),
            ],
        );
        let generator = CandidateGenerator::new(config);

        let generated = generator.generate(&txn(dec!(100), "acme"), &snapshot);
        let ids: Vec<_> = generated
            .invoices
            .iter()
            .map(|i| i.invoice_id.as_str())
            .collect();
        assert_eq!(ids, vec!["INV-1", "INV-2"]);
    }
}

//! Exact matcher: all-or-nothing, confidence 1.0.

use crate::config::MatchingConfig;
use crate::matching::candidates::within_due_window;
use crate::matching::normalizer::{compact, NormalizedTransaction};
use crate::matching::Matcher;
use crate::models::{Customer, Invoice, MatchCandidate, MatchType};
use serde_json::json;

/// Qualifies a candidate only when the transaction amount equals the invoice
/// outstanding balance, the invoice number appears verbatim in the
/// (compacted) reference text, and the transaction falls inside the due-date
/// window. Any mismatch falls through to fuzzy matching.
pub struct ExactMatcher {
    due_window_days: i64,
}

impl ExactMatcher {
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            due_window_days: config.due_window_days,
        }
    }
}

impl Matcher for ExactMatcher {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn evaluate(
        &self,
        txn: &NormalizedTransaction,
        invoice: &Invoice,
        _customer: Option<&Customer>,
    ) -> Option<MatchCandidate> {
        // outstanding == original while unpaid, so a single comparison covers
        // both the unpaid and partially-paid cases.
        if txn.amount != invoice.outstanding_balance {
            return None;
        }

        let invoice_number = compact(&invoice.invoice_id);
        if invoice_number.is_empty() || !txn.reference_compact.contains(&invoice_number) {
            return None;
        }

        if !within_due_window(txn.timestamp, invoice.due_date, self.due_window_days) {
            return None;
        }

        Some(MatchCandidate {
            transaction_id: txn.transaction_id.clone(),
            invoice_id: invoice.invoice_id.clone(),
            customer_id: invoice.customer_id.clone(),
            match_type: MatchType::Exact,
            score: 1.0,
            due_date: invoice.due_date,
            rationale: json!({
                "matcher": "exact",
                "amount_equals_outstanding": true,
                "reference_contains_invoice_number": true,
                "within_due_window": true,
            }),
        })
    }
}

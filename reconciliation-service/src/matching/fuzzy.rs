//! Fuzzy matcher: weighted composite of amount, name, and time signals.

use crate::config::MatchingConfig;
use crate::matching::normalizer::{normalize_text, NormalizedTransaction};
use crate::matching::Matcher;
use crate::models::{Customer, Invoice, MatchCandidate, MatchType};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use strsim::jaro_winkler;

/// Scores each signal into [0, 1] and combines them with configurable
/// weights (default equal thirds). Composites below the floor are discarded
/// before ranking.
pub struct FuzzyMatcher {
    config: MatchingConfig,
}

impl FuzzyMatcher {
    pub fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    /// `1 - min(1, |diff| / tolerance)` where tolerance is a percentage of
    /// the invoice outstanding balance.
    fn amount_closeness(&self, amount: Decimal, outstanding: Decimal) -> f64 {
        let tolerance = outstanding * self.config.amount_tolerance_pct / Decimal::ONE_HUNDRED;
        let diff = (amount - outstanding).abs();
        if tolerance.is_zero() {
            return if diff.is_zero() { 1.0 } else { 0.0 };
        }
        let ratio = (diff / tolerance).to_f64().unwrap_or(f64::MAX);
        1.0 - ratio.min(1.0)
    }

    /// Jaro-Winkler over normalized names, maximum across the canonical name
    /// and every alias.
    fn name_similarity(&self, counterparty: &str, customer: Option<&Customer>) -> f64 {
        let Some(customer) = customer else {
            return 0.0;
        };
        if counterparty.is_empty() {
            return 0.0;
        }
        let mut best = jaro_winkler(counterparty, &normalize_text(&customer.canonical_name));
        for alias in &customer.name_aliases {
            let normalized = normalize_text(alias);
            if normalized.is_empty() {
                continue;
            }
            best = best.max(jaro_winkler(counterparty, &normalized));
        }
        best
    }

    /// `1 - min(1, days_from_due / window)`.
    fn time_proximity(&self, txn: &NormalizedTransaction, invoice: &Invoice) -> f64 {
        let days = (txn.timestamp.date_naive() - invoice.due_date).num_days().abs() as f64;
        let window = self.config.due_window_days.max(1) as f64;
        1.0 - (days / window).min(1.0)
    }
}

impl Matcher for FuzzyMatcher {
    fn name(&self) -> &'static str {
        "fuzzy"
    }

    fn evaluate(
        &self,
        txn: &NormalizedTransaction,
        invoice: &Invoice,
        customer: Option<&Customer>,
    ) -> Option<MatchCandidate> {
        let amount_score = self.amount_closeness(txn.amount, invoice.outstanding_balance);
        let name_score = self.name_similarity(&txn.counterparty, customer);
        let time_score = self.time_proximity(txn, invoice);

        let weight_sum = self.config.weight_amount + self.config.weight_name + self.config.weight_time;
        if weight_sum <= 0.0 {
            return None;
        }
        let composite = (self.config.weight_amount * amount_score
            + self.config.weight_name * name_score
            + self.config.weight_time * time_score)
            / weight_sum;

        if composite < self.config.fuzzy_floor {
            return None;
        }

        Some(MatchCandidate {
            transaction_id: txn.transaction_id.clone(),
            invoice_id: invoice.invoice_id.clone(),
            customer_id: invoice.customer_id.clone(),
            match_type: MatchType::Fuzzy,
            score: composite,
            due_date: invoice.due_date,
            rationale: json!({
                "matcher": "fuzzy",
                "amount_score": amount_score,
                "name_score": name_score,
                "time_score": time_score,
                "weights": {
                    "amount": self.config.weight_amount,
                    "name": self.config.weight_name,
                    "time": self.config.weight_time,
                },
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvoiceStatus, Transaction};
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn invoice(outstanding: Decimal, due: NaiveDate) -> Invoice {
        Invoice {
            invoice_id: "INV-1".to_string(),
            customer_id: "C-1".to_string(),
            original_amount: outstanding,
            outstanding_balance: outstanding,
            due_date: due,
            status: InvoiceStatus::Open.as_str().to_string(),
            version: 1,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    fn customer(name: &str, aliases: &[&str]) -> Customer {
        Customer {
            customer_id: "C-1".to_string(),
            canonical_name: name.to_string(),
            name_aliases: aliases.iter().map(|s| s.to_string()).collect(),
            created_utc: Utc::now(),
        }
    }

    fn txn(amount: Decimal, counterparty: &str, day: u32) -> NormalizedTransaction {
        NormalizedTransaction::from_transaction(&Transaction {
            transaction_id: "TXN-1".to_string(),
            amount,
            currency: "UGX".to_string(),
            reference: "payment".to_string(),
            counterparty_name: counterparty.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 6, day, 12, 0, 0).unwrap(),
            channel: "bank".to_string(),
            ingested_utc: Utc::now(),
        })
    }

    fn due(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    #[test]
    fn perfect_signals_score_near_one() {
        let matcher = FuzzyMatcher::new(MatchingConfig::default());
        let candidate = matcher
            .evaluate(
                &txn(dec!(100), "Acme Traders Ltd", 10),
                &invoice(dec!(100), due(10)),
                Some(&customer("Acme Traders Ltd", &[])),
            )
            .expect("above floor");
        assert!(candidate.score > 0.99, "score = {}", candidate.score);
        assert_eq!(candidate.match_type, MatchType::Fuzzy);
    }

    #[test]
    fn alias_similarity_takes_the_maximum() {
        let matcher = FuzzyMatcher::new(MatchingConfig::default());
        let with_alias = matcher
            .evaluate(
                &txn(dec!(100), "acme", 10),
                &invoice(dec!(100), due(10)),
                Some(&customer("Completely Different Name", &["ACME"])),
            )
            .expect("above floor");
        let rationale = &with_alias.rationale;
        assert!(rationale["name_score"].as_f64().unwrap() > 0.99);
    }

    #[test]
    fn amount_outside_tolerance_contributes_zero() {
        let matcher = FuzzyMatcher::new(MatchingConfig::default());
        // 2.5% of 100 is 2.5, diff of 50 saturates the signal.
        let candidate = matcher.evaluate(
            &txn(dec!(150), "Acme Traders Ltd", 10),
            &invoice(dec!(100), due(10)),
            Some(&customer("Acme Traders Ltd", &[])),
        );
        let candidate = candidate.expect("name and time keep it above floor");
        assert!(candidate.rationale["amount_score"].as_f64().unwrap() < f64::EPSILON);
    }

    #[test]
    fn unknown_customer_gets_zero_name_signal() {
        let matcher = FuzzyMatcher::new(MatchingConfig::default());
        let candidate = matcher
            .evaluate(
                &txn(dec!(100), "whoever", 10),
                &invoice(dec!(100), due(10)),
                None,
            )
            .expect("amount and time carry it");
        assert_eq!(candidate.rationale["name_score"].as_f64().unwrap(), 0.0);
    }

    #[test]
    fn floor_discards_weak_candidates() {
        let matcher = FuzzyMatcher::new(MatchingConfig::default());
        // Wrong amount, wrong name, 25 days late: every signal weak.
        let candidate = matcher.evaluate(
            &txn(dec!(999), "somebody else entirely", 30),
            &invoice(dec!(100), due(5)),
            Some(&customer("Acme Traders Ltd", &[])),
        );
        assert!(candidate.is_none());
    }
}

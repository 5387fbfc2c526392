//! Canonicalization of raw transaction and invoice text fields.
//!
//! Pure functions, no side effects. Empty input passes through empty.

use crate::models::Transaction;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Lower-case, strip punctuation, collapse whitespace into single spaces.
pub fn normalize_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_space = true;
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Lower-cased alphanumeric characters only. Used for verbatim containment
/// checks (invoice numbers embedded in free-text references survive
/// arbitrary separators: "INV-2024/001" and "inv 2024 001" compact equally).
pub fn compact(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Collapse phone-number country-code variants ("+256 700 123456",
/// "00256700123456", "0700123456") to the local significant digits.
pub fn normalize_msisdn(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let digits = digits.strip_prefix("00").unwrap_or(&digits);
    // Local significant number is the trailing 9 digits once any country
    // code or trunk prefix is removed.
    if digits.len() > 9 {
        digits[digits.len() - 9..].to_string()
    } else {
        digits.to_string()
    }
}

/// A transaction with its free-text fields canonicalized for matching.
#[derive(Debug, Clone)]
pub struct NormalizedTransaction {
    pub transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub reference: String,
    pub reference_compact: String,
    pub counterparty: String,
    pub counterparty_msisdn: String,
    pub timestamp: DateTime<Utc>,
}

impl NormalizedTransaction {
    pub fn from_transaction(txn: &Transaction) -> Self {
        Self {
            transaction_id: txn.transaction_id.clone(),
            amount: txn.amount,
            currency: txn.currency.clone(),
            reference: normalize_text(&txn.reference),
            reference_compact: compact(&txn.reference),
            counterparty: normalize_text(&txn.counterparty_name),
            counterparty_msisdn: normalize_msisdn(&txn.counterparty_name),
            timestamp: txn.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_collapses_case_punctuation_and_whitespace() {
        assert_eq!(normalize_text("  ACME   Traders, Ltd. "), "acme traders ltd");
        assert_eq!(normalize_text("MTN-MoMo/Pay#1234"), "mtn momo pay 1234");
    }

    #[test]
    fn normalize_text_empty_passthrough() {
        assert_eq!(normalize_text(""), "");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn compact_keeps_only_alphanumerics() {
        assert_eq!(compact("INV-2024/001"), "inv2024001");
        assert_eq!(compact("inv 2024 001"), "inv2024001");
    }

    #[test]
    fn msisdn_variants_collapse() {
        assert_eq!(normalize_msisdn("+256 700 123456"), "700123456");
        assert_eq!(normalize_msisdn("00256700123456"), "700123456");
        assert_eq!(normalize_msisdn("0700123456"), "700123456");
        assert_eq!(normalize_msisdn("700123456"), "700123456");
    }

    #[test]
    fn msisdn_empty_passthrough() {
        assert_eq!(normalize_msisdn("no digits here"), "");
    }
}

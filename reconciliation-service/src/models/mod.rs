//! Domain models for reconciliation-service.

#![allow(clippy::should_implement_trait)]

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Transaction Models
// ============================================================================

/// An incoming payment event from the gateway feed. Immutable once ingested;
/// `transaction_id` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub reference: String,
    pub counterparty_name: String,
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub ingested_utc: DateTime<Utc>,
}

impl Transaction {
    /// Field-level equality used by the idempotency check: two submissions of
    /// the same `transaction_id` must agree on every gateway-provided field.
    pub fn same_payload(&self, other: &Transaction) -> bool {
        self.amount == other.amount
            && self.currency == other.currency
            && self.reference == other.reference
            && self.counterparty_name == other.counterparty_name
            && self.timestamp == other.timestamp
            && self.channel == other.channel
    }
}

// ============================================================================
// Invoice Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Open,
    PartiallyPaid,
    Paid,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::PartiallyPaid => "partially_paid",
            Self::Paid => "paid",
            Self::Void => "void",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "partially_paid" => Self::PartiallyPaid,
            "paid" => Self::Paid,
            "void" => Self::Void,
            _ => Self::Open,
        }
    }
}

/// A customer obligation. `outstanding_balance` is the only hot mutable field
/// and is guarded by the `version` compare-and-swap counter.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: String,
    pub customer_id: String,
    pub original_amount: Decimal,
    pub outstanding_balance: Decimal,
    pub due_date: NaiveDate,
    pub status: String,
    pub version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_str(&self.status)
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.status(),
            InvoiceStatus::Open | InvoiceStatus::PartiallyPaid
        )
    }
}

// ============================================================================
// Customer Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Customer {
    pub customer_id: String,
    pub canonical_name: String,
    pub name_aliases: Vec<String>,
    pub created_utc: DateTime<Utc>,
}

// ============================================================================
// Match Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Exact,
    Fuzzy,
    Ai,
    Manual,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
            Self::Ai => "ai",
            Self::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "exact" => Self::Exact,
            "fuzzy" => Self::Fuzzy,
            "ai" => Self::Ai,
            "manual" => Self::Manual,
            _ => Self::Fuzzy,
        }
    }
}

/// A scored, unconfirmed (transaction, invoice) pairing. Transient: produced
/// per matching run, persisted only through the selected record.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub transaction_id: String,
    pub invoice_id: String,
    pub customer_id: String,
    pub match_type: MatchType,
    pub score: f64,
    pub due_date: NaiveDate,
    pub rationale: serde_json::Value,
}

// ============================================================================
// Reconciliation Record Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    AutoMatched,
    ManualReview,
    Unmatched,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoMatched => "auto_matched",
            Self::ManualReview => "manual_review",
            Self::Unmatched => "unmatched",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "auto_matched" => Self::AutoMatched,
            "manual_review" => Self::ManualReview,
            "unmatched" => Self::Unmatched,
            _ => Self::Unmatched,
        }
    }
}

/// One applied slice of a transaction's amount against an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub invoice_id: String,
    pub amount_applied: Decimal,
}

/// The durable, per-transaction match decision. Exactly one exists per
/// `transaction_id`; amended only by an explicit manual-review resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub transaction_id: String,
    pub decision: String,
    pub match_type: Option<String>,
    pub confidence: f64,
    pub allocations: Vec<Allocation>,
    pub unallocated_amount: Decimal,
    pub rationale: serde_json::Value,
    pub decided_utc: DateTime<Utc>,
    pub reviewer_id: Option<String>,
    pub resolution: Option<String>,
    pub resolved_utc: Option<DateTime<Utc>>,
}

impl ReconciliationRecord {
    pub fn decision(&self) -> Decision {
        Decision::from_str(&self.decision)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn total_applied(&self) -> Decimal {
        self.allocations.iter().map(|a| a.amount_applied).sum()
    }
}

// ============================================================================
// Customer Credit Models
// ============================================================================

/// Overpayment remainder that could not be applied to any open invoice.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CustomerCredit {
    pub credit_id: Uuid,
    pub customer_id: String,
    pub transaction_id: String,
    pub amount: Decimal,
    pub created_utc: DateTime<Utc>,
}

// ============================================================================
// Audit Models
// ============================================================================

/// Append-only record of every pipeline stage transition and decision.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub audit_id: Uuid,
    pub transaction_id: String,
    pub stage: String,
    pub decision: Option<String>,
    pub actor: String,
    pub detail: serde_json::Value,
    pub created_utc: DateTime<Utc>,
}

impl AuditEntry {
    pub fn system(transaction_id: &str, stage: &str, detail: serde_json::Value) -> Self {
        Self {
            audit_id: Uuid::new_v4(),
            transaction_id: transaction_id.to_string(),
            stage: stage.to_string(),
            decision: None,
            actor: "system".to_string(),
            detail,
            created_utc: Utc::now(),
        }
    }

    pub fn with_decision(mut self, decision: Decision) -> Self {
        self.decision = Some(decision.as_str().to_string());
        self
    }

    pub fn by_reviewer(mut self, reviewer_id: &str) -> Self {
        self.actor = reviewer_id.to_string();
        self
    }
}

// ============================================================================
// Pipeline Stage Models
// ============================================================================

/// Orchestrator state machine. Transitions are one-directional except
/// `ManualReview -> Resolved`, which is human-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Ingested,
    CandidatesGenerated,
    Scored,
    Decided,
    Resolved,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingested => "ingested",
            Self::CandidatesGenerated => "candidates_generated",
            Self::Scored => "scored",
            Self::Decided => "decided",
            Self::Resolved => "resolved",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn invoice_status_round_trips() {
        for status in [
            InvoiceStatus::Open,
            InvoiceStatus::PartiallyPaid,
            InvoiceStatus::Paid,
            InvoiceStatus::Void,
        ] {
            assert_eq!(InvoiceStatus::from_str(status.as_str()), status);
        }
    }

    #[test]
    fn unknown_decision_falls_back_to_unmatched() {
        assert_eq!(Decision::from_str("garbage"), Decision::Unmatched);
    }

    #[test]
    fn same_payload_ignores_ingestion_time() {
        let base = Transaction {
            transaction_id: "TXN-1".to_string(),
            amount: dec!(100),
            currency: "UGX".to_string(),
            reference: "INV-1".to_string(),
            counterparty_name: "Acme".to_string(),
            timestamp: Utc::now(),
            channel: "mobile_money".to_string(),
            ingested_utc: Utc::now(),
        };
        let mut later = base.clone();
        later.ingested_utc = later.ingested_utc + chrono::Duration::seconds(60);
        assert!(base.same_payload(&later));

        let mut tampered = base.clone();
        tampered.amount = dec!(101);
        assert!(!base.same_payload(&tampered));
    }

    #[test]
    fn record_totals_sum_allocations() {
        let record = ReconciliationRecord {
            transaction_id: "TXN-1".to_string(),
            decision: Decision::AutoMatched.as_str().to_string(),
            match_type: Some(MatchType::Exact.as_str().to_string()),
            confidence: 1.0,
            allocations: vec![
                Allocation {
                    invoice_id: "INV-1".to_string(),
                    amount_applied: dec!(100),
                },
                Allocation {
                    invoice_id: "INV-2".to_string(),
                    amount_applied: dec!(150),
                },
            ],
            unallocated_amount: Decimal::ZERO,
            rationale: serde_json::json!({}),
            decided_utc: Utc::now(),
            reviewer_id: None,
            resolution: None,
            resolved_utc: None,
        };
        assert_eq!(record.total_applied(), dec!(250));
    }
}

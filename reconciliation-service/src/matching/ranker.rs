//! Merge matcher outputs into a ranked list and apply the decision policy.

use crate::config::MatchingConfig;
use crate::models::{Decision, MatchCandidate, MatchType};

/// The ranked candidate list and the decision it implies.
#[derive(Debug, Clone)]
pub struct RankedOutcome {
    pub decision: Decision,
    pub best: Option<MatchCandidate>,
    pub ranked: Vec<MatchCandidate>,
}

pub struct Ranker {
    config: MatchingConfig,
}

impl Ranker {
    pub fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    /// Sort descending by score; ties broken by earliest due date, then
    /// lexicographically smallest invoice id. Ambiguity is a routing
    /// outcome, never an error.
    pub fn rank(&self, mut candidates: Vec<MatchCandidate>) -> Vec<MatchCandidate> {
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.due_date.cmp(&b.due_date))
                .then_with(|| a.invoice_id.cmp(&b.invoice_id))
        });
        candidates
    }

    /// Decision policy over the ranked list:
    /// - score >= auto threshold and match type exact/fuzzy -> auto_matched
    /// - review floor <= score < auto threshold, or AI-sourced -> manual_review
    /// - below the review floor, or no candidates -> unmatched
    pub fn decide(&self, candidates: Vec<MatchCandidate>) -> RankedOutcome {
        let ranked = self.rank(candidates);
        let Some(best) = ranked.first().cloned() else {
            return RankedOutcome {
                decision: Decision::Unmatched,
                best: None,
                ranked,
            };
        };

        let decision = match best.match_type {
            MatchType::Exact | MatchType::Fuzzy if best.score >= self.config.auto_threshold => {
                Decision::AutoMatched
            }
            MatchType::Ai => Decision::ManualReview,
            _ if best.score >= self.config.review_floor => Decision::ManualReview,
            _ => Decision::Unmatched,
        };

        RankedOutcome {
            decision,
            best: Some(best),
            ranked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn candidate(invoice_id: &str, score: f64, due_day: u32, match_type: MatchType) -> MatchCandidate {
        MatchCandidate {
            transaction_id: "TXN-1".to_string(),
            invoice_id: invoice_id.to_string(),
            customer_id: "C-1".to_string(),
            match_type,
            score,
            due_date: NaiveDate::from_ymd_opt(2024, 6, due_day).unwrap(),
            rationale: json!({}),
        }
    }

    fn ranker() -> Ranker {
        Ranker::new(MatchingConfig::default())
    }

    #[test]
    fn ties_break_on_due_date_then_invoice_id() {
        let outcome = ranker().decide(vec![
            candidate("INV-B", 0.8, 10, MatchType::Fuzzy),
            candidate("INV-A", 0.8, 10, MatchType::Fuzzy),
            candidate("INV-C", 0.8, 5, MatchType::Fuzzy),
        ]);
        let ids: Vec<_> = outcome.ranked.iter().map(|c| c.invoice_id.as_str()).collect();
        assert_eq!(ids, vec!["INV-C", "INV-A", "INV-B"]);
        assert_eq!(outcome.best.unwrap().invoice_id, "INV-C");
    }

    #[test]
    fn tie_break_is_reproducible_across_input_orders() {
        let a = ranker().decide(vec![
            candidate("INV-2", 0.75, 10, MatchType::Fuzzy),
            candidate("INV-1", 0.75, 10, MatchType::Fuzzy),
        ]);
        let b = ranker().decide(vec![
            candidate("INV-1", 0.75, 10, MatchType::Fuzzy),
            candidate("INV-2", 0.75, 10, MatchType::Fuzzy),
        ]);
        assert_eq!(a.best.unwrap().invoice_id, "INV-1");
        assert_eq!(b.best.unwrap().invoice_id, "INV-1");
    }

    #[test]
    fn exact_match_auto_applies() {
        let outcome = ranker().decide(vec![candidate("INV-1", 1.0, 10, MatchType::Exact)]);
        assert_eq!(outcome.decision, Decision::AutoMatched);
    }

    #[test]
    fn high_fuzzy_auto_applies() {
        let outcome = ranker().decide(vec![candidate("INV-1", 0.95, 10, MatchType::Fuzzy)]);
        assert_eq!(outcome.decision, Decision::AutoMatched);
    }

    #[test]
    fn mid_band_routes_to_review() {
        let outcome = ranker().decide(vec![candidate("INV-1", 0.6, 10, MatchType::Fuzzy)]);
        assert_eq!(outcome.decision, Decision::ManualReview);
    }

    #[test]
    fn ai_never_auto_applies_even_with_high_score() {
        let outcome = ranker().decide(vec![candidate("INV-1", 0.99, 10, MatchType::Ai)]);
        assert_eq!(outcome.decision, Decision::ManualReview);
    }

    #[test]
    fn weak_or_empty_is_unmatched() {
        let outcome = ranker().decide(vec![candidate("INV-1", 0.4, 10, MatchType::Fuzzy)]);
        assert_eq!(outcome.decision, Decision::Unmatched);

        let empty = ranker().decide(vec![]);
        assert_eq!(empty.decision, Decision::Unmatched);
        assert!(empty.best.is_none());
    }
}

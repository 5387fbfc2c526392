//! Matching pipeline: normalization, candidate generation, scoring
//! strategies, and ranking.

pub mod candidates;
pub mod exact;
pub mod fuzzy;
pub mod normalizer;
pub mod ranker;

pub use candidates::{CandidateGenerator, CustomerSnapshot, GeneratedCandidates};
pub use exact::ExactMatcher;
pub use fuzzy::FuzzyMatcher;
pub use normalizer::NormalizedTransaction;
pub use ranker::{Ranker, RankedOutcome};

use crate::models::{Customer, Invoice, MatchCandidate};

/// A scoring strategy. Implementations are pure: they inspect one
/// (transaction, invoice) pair and either produce a scored candidate or
/// decline.
pub trait Matcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(
        &self,
        txn: &NormalizedTransaction,
        invoice: &Invoice,
        customer: Option<&Customer>,
    ) -> Option<MatchCandidate>;
}

//! Reconciliation orchestrator: drives the per-transaction pipeline
//! (ingest -> candidates -> score -> decide -> allocate), enforces
//! idempotency, serializes allocation per customer, and runs batches on a
//! bounded worker pool with cooperative cancellation.

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::ai::{FallbackRequest, FallbackScorer};
use crate::allocation::AllocationEngine;
use crate::config::ReconciliationConfig;
use crate::matching::{
    CandidateGenerator, CustomerSnapshot, ExactMatcher, FuzzyMatcher, Matcher,
    NormalizedTransaction, Ranker,
};
use crate::models::{
    AuditEntry, CustomerCredit, Decision, MatchCandidate, MatchType, PipelineStage,
    ReconciliationRecord, Transaction,
};
use crate::services::metrics::{
    record_ai_fallback, record_decision, record_error, record_transaction_match,
    PIPELINE_DURATION,
};
use crate::services::store::TransactionInsert;
use crate::services::ReconciliationStore;

/// Aggregate result of one batch run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchSummary {
    pub submitted: usize,
    pub processed: usize,
    pub auto_matched: usize,
    pub manual_review: usize,
    pub unmatched: usize,
    pub failed: usize,
    /// Transactions never dequeued because cancellation was requested.
    pub cancelled: usize,
}

pub struct Orchestrator {
    store: Arc<dyn ReconciliationStore>,
    fallback: Arc<dyn FallbackScorer>,
    allocator: AllocationEngine,
    generator: CandidateGenerator,
    matchers: Vec<Box<dyn Matcher>>,
    ranker: Ranker,
    config: ReconciliationConfig,
    /// Serializes the allocation step for transactions of one customer.
    customer_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Serializes concurrent submissions of one transaction id in-process;
    /// the store unique constraint backs this across processes.
    transaction_locks: DashMap<String, Arc<Mutex<()>>>,
}

fn keyed_lock(map: &DashMap<String, Arc<Mutex<()>>>, key: &str) -> Arc<Mutex<()>> {
    map.entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ReconciliationStore>,
        fallback: Arc<dyn FallbackScorer>,
        config: ReconciliationConfig,
    ) -> Self {
        let matchers: Vec<Box<dyn Matcher>> = vec![
            Box::new(ExactMatcher::new(&config.matching)),
            Box::new(FuzzyMatcher::new(config.matching.clone())),
        ];
        Self {
            allocator: AllocationEngine::new(store.clone(), config.allocation.max_cas_retries),
            generator: CandidateGenerator::new(config.matching.clone()),
            ranker: Ranker::new(config.matching.clone()),
            matchers,
            store,
            fallback,
            config,
            customer_locks: DashMap::new(),
            transaction_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ReconciliationStore> {
        &self.store
    }

    /// Ingest a single transaction against a fresh snapshot.
    pub async fn ingest(&self, txn: Transaction) -> Result<ReconciliationRecord, AppError> {
        let snapshot = self.store.snapshot().await?;
        self.ingest_with_snapshot(&txn, &snapshot).await
    }

    /// Run the full pipeline for one transaction. Idempotent: a re-submission
    /// of an already-decided transaction id returns the stored record
    /// unchanged.
    #[instrument(skip(self, txn, snapshot), fields(transaction_id = %txn.transaction_id))]
    pub async fn ingest_with_snapshot(
        &self,
        txn: &Transaction,
        snapshot: &CustomerSnapshot,
    ) -> Result<ReconciliationRecord, AppError> {
        validate_transaction(txn)?;

        let txn_lock = keyed_lock(&self.transaction_locks, &txn.transaction_id);
        let _txn_guard = txn_lock.lock().await;

        match self.store.insert_transaction(txn).await? {
            TransactionInsert::Inserted => {
                self.store
                    .append_audit(&AuditEntry::system(
                        &txn.transaction_id,
                        PipelineStage::Ingested.as_str(),
                        json!({ "channel": txn.channel, "amount": txn.amount }),
                    ))
                    .await?;
            }
            TransactionInsert::Existing(_) => {
                if let Some(record) = self.store.get_record(&txn.transaction_id).await? {
                    info!(transaction_id = %txn.transaction_id, "Idempotent replay, returning stored record");
                    return Ok(record);
                }
                // A previous run persisted the transaction but died before
                // deciding; resume from the top of the pipeline.
                warn!(transaction_id = %txn.transaction_id, "Resuming undecided transaction");
            }
        }

        let timer = PIPELINE_DURATION.start_timer();
        let result = self.run_pipeline(txn, snapshot).await;
        timer.observe_duration();

        match &result {
            Ok(record) => {
                record_decision(&record.decision);
                if let Some(match_type) = &record.match_type {
                    record_transaction_match(match_type);
                }
            }
            Err(e) => {
                record_error("pipeline");
                warn!(transaction_id = %txn.transaction_id, error = %e, "Pipeline failed");
            }
        }
        result
    }

    async fn run_pipeline(
        &self,
        txn: &Transaction,
        snapshot: &CustomerSnapshot,
    ) -> Result<ReconciliationRecord, AppError> {
        let normalized = NormalizedTransaction::from_transaction(txn);

        // Candidate generation
        let generated = self.generator.generate(&normalized, snapshot);
        self.store
            .append_audit(&AuditEntry::system(
                &txn.transaction_id,
                PipelineStage::CandidatesGenerated.as_str(),
                json!({
                    "candidate_count": generated.invoices.len(),
                    "resolved_customer_id": generated.resolved_customer_id,
                }),
            ))
            .await?;

        // Rule-based scoring
        let mut candidates: Vec<MatchCandidate> = Vec::new();
        for invoice in &generated.invoices {
            let customer = snapshot.customer(&invoice.customer_id);
            for matcher in &self.matchers {
                if let Some(candidate) = matcher.evaluate(&normalized, invoice, customer) {
                    candidates.push(candidate);
                }
            }
        }

        // AI fallback, only when the rule-based matchers came up empty for a
        // non-empty candidate set.
        let mut unmatched_reason = if generated.invoices.is_empty() {
            "no_candidates"
        } else {
            "below_fuzzy_floor"
        };
        if candidates.is_empty() && !generated.invoices.is_empty() && self.fallback.enabled() {
            match self.consult_fallback(&normalized, &generated.invoices, snapshot).await {
                FallbackOutcome::Suggested(candidate) => candidates.push(candidate),
                FallbackOutcome::NoMatch => unmatched_reason = "ai_no_match",
                FallbackOutcome::Unavailable => unmatched_reason = "ai_unavailable",
            }
        }

        // Ranking and decision
        let outcome = self.ranker.decide(candidates);
        self.store
            .append_audit(&AuditEntry::system(
                &txn.transaction_id,
                PipelineStage::Scored.as_str(),
                json!({
                    "ranked_count": outcome.ranked.len(),
                    "best_score": outcome.best.as_ref().map(|c| c.score),
                    "best_invoice_id": outcome.best.as_ref().map(|c| c.invoice_id.clone()),
                }),
            ))
            .await?;

        let record = match (outcome.decision, outcome.best) {
            (Decision::AutoMatched, Some(best)) => self.commit_auto_match(txn, best).await?,
            (Decision::ManualReview, Some(best)) => ReconciliationRecord {
                transaction_id: txn.transaction_id.clone(),
                decision: Decision::ManualReview.as_str().to_string(),
                match_type: Some(best.match_type.as_str().to_string()),
                confidence: best.score,
                allocations: vec![],
                unallocated_amount: txn.amount,
                rationale: json!({
                    "candidate": { "invoice_id": best.invoice_id, "customer_id": best.customer_id },
                    "detail": best.rationale,
                }),
                decided_utc: Utc::now(),
                reviewer_id: None,
                resolution: None,
                resolved_utc: None,
            },
            _ => ReconciliationRecord {
                transaction_id: txn.transaction_id.clone(),
                decision: Decision::Unmatched.as_str().to_string(),
                match_type: None,
                confidence: 0.0,
                allocations: vec![],
                unallocated_amount: txn.amount,
                rationale: json!({ "reason": unmatched_reason }),
                decided_utc: Utc::now(),
                reviewer_id: None,
                resolution: None,
                resolved_utc: None,
            },
        };

        match self.store.insert_record(&record).await {
            Ok(()) => {}
            // Another process decided first; the stored record wins.
            Err(AppError::Conflict(_)) => {
                if let Some(existing) = self.store.get_record(&txn.transaction_id).await? {
                    return Ok(existing);
                }
            }
            Err(e) => return Err(e),
        }

        let decided = AuditEntry::system(
            &txn.transaction_id,
            PipelineStage::Decided.as_str(),
            record.rationale.clone(),
        )
        .with_decision(record.decision());
        self.store.append_audit(&decided).await?;

        Ok(record)
    }

    /// Allocation under the per-customer lock: two transactions for the same
    /// customer cannot race on an invoice balance, while transactions for
    /// different customers stay fully parallel.
    async fn commit_auto_match(
        &self,
        txn: &Transaction,
        best: MatchCandidate,
    ) -> Result<ReconciliationRecord, AppError> {
        let customer_lock = keyed_lock(&self.customer_locks, &best.customer_id);
        let _customer_guard = customer_lock.lock().await;

        let allocation = self
            .allocator
            .allocate(
                &txn.transaction_id,
                &best.customer_id,
                std::slice::from_ref(&best.invoice_id),
                txn.amount,
                true,
            )
            .await?;

        if allocation.conflicted {
            // Bounded retries exhausted: downgrade to manual review, keeping
            // whatever was already committed visible in the record.
            return Ok(ReconciliationRecord {
                transaction_id: txn.transaction_id.clone(),
                decision: Decision::ManualReview.as_str().to_string(),
                match_type: Some(best.match_type.as_str().to_string()),
                confidence: best.score,
                allocations: allocation.allocations,
                unallocated_amount: allocation.unallocated,
                rationale: json!({
                    "reason": "concurrent_update_conflict",
                    "candidate": { "invoice_id": best.invoice_id, "customer_id": best.customer_id },
                }),
                decided_utc: Utc::now(),
                reviewer_id: None,
                resolution: None,
                resolved_utc: None,
            });
        }

        if allocation.unallocated > Decimal::ZERO {
            self.store
                .record_credit(&CustomerCredit {
                    credit_id: Uuid::new_v4(),
                    customer_id: best.customer_id.clone(),
                    transaction_id: txn.transaction_id.clone(),
                    amount: allocation.unallocated,
                    created_utc: Utc::now(),
                })
                .await?;
        }

        Ok(ReconciliationRecord {
            transaction_id: txn.transaction_id.clone(),
            decision: Decision::AutoMatched.as_str().to_string(),
            match_type: Some(best.match_type.as_str().to_string()),
            confidence: best.score,
            allocations: allocation.allocations,
            unallocated_amount: allocation.unallocated,
            rationale: json!({
                "candidate": { "invoice_id": best.invoice_id, "customer_id": best.customer_id },
                "detail": best.rationale,
            }),
            decided_utc: Utc::now(),
            reviewer_id: None,
            resolution: None,
            resolved_utc: None,
        })
    }

    async fn consult_fallback(
        &self,
        normalized: &NormalizedTransaction,
        invoices: &[crate::models::Invoice],
        snapshot: &CustomerSnapshot,
    ) -> FallbackOutcome {
        let request = FallbackRequest::build(normalized, invoices, |customer_id| {
            snapshot.customer(customer_id).cloned()
        });

        match self.fallback.score(&request).await {
            Ok(Some(suggestion)) => {
                // Untrusted output: the suggested invoice must come from the
                // generated candidate set, and confidence is capped below the
                // auto-apply threshold.
                let Some(invoice) = invoices.iter().find(|i| i.invoice_id == suggestion.invoice_id)
                else {
                    warn!(
                        invoice_id = %suggestion.invoice_id,
                        "AI fallback suggested an invoice outside the candidate set, ignoring"
                    );
                    record_ai_fallback("rejected");
                    return FallbackOutcome::NoMatch;
                };
                record_ai_fallback("suggested");
                FallbackOutcome::Suggested(MatchCandidate {
                    transaction_id: normalized.transaction_id.clone(),
                    invoice_id: invoice.invoice_id.clone(),
                    customer_id: invoice.customer_id.clone(),
                    match_type: MatchType::Ai,
                    score: suggestion
                        .confidence
                        .min(self.config.ai_fallback.confidence_cap),
                    due_date: invoice.due_date,
                    rationale: json!({
                        "matcher": "ai",
                        "rationale": suggestion.rationale,
                        "raw_confidence": suggestion.confidence,
                    }),
                })
            }
            Ok(None) => {
                record_ai_fallback("no_match");
                FallbackOutcome::NoMatch
            }
            Err(e) => {
                record_ai_fallback("unavailable");
                warn!(error = %e, "AI fallback unavailable, degrading to rule-based only");
                FallbackOutcome::Unavailable
            }
        }
    }

    /// Resolve a pending manual review. Approval allocates across the chosen
    /// invoices; rejection closes the record. Either way a new audit entry is
    /// appended — never a silent overwrite.
    #[instrument(skip(self, chosen_invoice_ids), fields(transaction_id = %transaction_id, reviewer_id = %reviewer_id))]
    pub async fn resolve(
        &self,
        transaction_id: &str,
        chosen_invoice_ids: Vec<String>,
        reviewer_id: &str,
        approve: bool,
    ) -> Result<ReconciliationRecord, AppError> {
        let mut record = self
            .store
            .get_record(transaction_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("no record for transaction {}", transaction_id))
            })?;

        if record.decision() != Decision::ManualReview || record.is_resolved() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "transaction {} is not pending review",
                transaction_id
            )));
        }

        if !approve {
            record.reviewer_id = Some(reviewer_id.to_string());
            record.resolution = Some("rejected".to_string());
            record.resolved_utc = Some(Utc::now());
            self.store.update_record_resolution(&record).await?;
            let resolved = AuditEntry::system(
                transaction_id,
                PipelineStage::Resolved.as_str(),
                json!({ "resolution": "rejected" }),
            )
            .by_reviewer(reviewer_id);
            self.store.append_audit(&resolved).await?;
            return Ok(record);
        }

        if chosen_invoice_ids.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "approval requires at least one chosen invoice"
            )));
        }

        let txn = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("transaction {} not found", transaction_id))
            })?;

        // All chosen invoices must belong to one customer; that customer's
        // lock serializes the allocation.
        let mut customer_id: Option<String> = None;
        for invoice_id in &chosen_invoice_ids {
            let invoice = self.store.get_invoice(invoice_id).await?.ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("invoice {} not found", invoice_id))
            })?;
            match &customer_id {
                None => customer_id = Some(invoice.customer_id),
                Some(existing) if *existing != invoice.customer_id => {
                    return Err(AppError::BadRequest(anyhow::anyhow!(
                        "chosen invoices span multiple customers"
                    )));
                }
                Some(_) => {}
            }
        }
        let customer_id = customer_id.expect("at least one chosen invoice");

        let customer_lock = keyed_lock(&self.customer_locks, &customer_id);
        let _customer_guard = customer_lock.lock().await;

        let remaining = txn.amount - record.total_applied();
        let allocation = self
            .allocator
            .allocate(transaction_id, &customer_id, &chosen_invoice_ids, remaining, false)
            .await?;

        if allocation.conflicted {
            return Err(AppError::VersionConflict(anyhow::anyhow!(
                "allocation conflict while resolving transaction {}, retry the resolution",
                transaction_id
            )));
        }

        if allocation.unallocated > Decimal::ZERO {
            self.store
                .record_credit(&CustomerCredit {
                    credit_id: Uuid::new_v4(),
                    customer_id: customer_id.clone(),
                    transaction_id: transaction_id.to_string(),
                    amount: allocation.unallocated,
                    created_utc: Utc::now(),
                })
                .await?;
        }

        record.allocations.extend(allocation.allocations);
        record.unallocated_amount = allocation.unallocated;
        record.match_type = Some(MatchType::Manual.as_str().to_string());
        record.reviewer_id = Some(reviewer_id.to_string());
        record.resolution = Some("approved".to_string());
        record.resolved_utc = Some(Utc::now());
        self.store.update_record_resolution(&record).await?;

        let resolved = AuditEntry::system(
            transaction_id,
            PipelineStage::Resolved.as_str(),
            json!({
                "resolution": "approved",
                "chosen_invoice_ids": chosen_invoice_ids,
                "unallocated_amount": record.unallocated_amount,
            }),
        )
        .by_reviewer(reviewer_id);
        self.store.append_audit(&resolved).await?;

        record_transaction_match(MatchType::Manual.as_str());
        info!(transaction_id = %transaction_id, "Manual review resolved");
        Ok(record)
    }

    /// Process a batch on the bounded worker pool. Cancellation is
    /// cooperative: in-flight transactions run to completion, nothing new is
    /// dequeued once the token is cancelled.
    #[instrument(skip(self, transactions, cancel), fields(batch_size = transactions.len()))]
    pub async fn run_batch(
        self: Arc<Self>,
        transactions: Vec<Transaction>,
        cancel: CancellationToken,
    ) -> Result<BatchSummary, AppError> {
        let snapshot = Arc::new(self.store.snapshot().await?);
        let semaphore = Arc::new(Semaphore::new(self.config.pipeline.worker_count.max(1)));
        let mut join_set: JoinSet<Result<ReconciliationRecord, AppError>> = JoinSet::new();

        let mut summary = BatchSummary {
            submitted: transactions.len(),
            ..Default::default()
        };

        let mut queue = transactions.into_iter();
        for txn in queue.by_ref() {
            if cancel.is_cancelled() {
                // Put the current transaction back into the cancelled count.
                summary.cancelled += 1;
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::InternalError(anyhow::anyhow!("semaphore closed: {}", e)))?;
            let orchestrator = self.clone();
            let snapshot = snapshot.clone();
            join_set.spawn(async move {
                let _permit = permit;
                orchestrator.ingest_with_snapshot(&txn, &snapshot).await
            });
        }
        summary.cancelled += queue.count();

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(record)) => {
                    summary.processed += 1;
                    match record.decision() {
                        Decision::AutoMatched => summary.auto_matched += 1,
                        Decision::ManualReview => summary.manual_review += 1,
                        Decision::Unmatched => summary.unmatched += 1,
                    }
                }
                Ok(Err(_)) => summary.failed += 1,
                Err(e) => {
                    warn!(error = %e, "Batch worker panicked");
                    summary.failed += 1;
                }
            }
        }

        info!(
            submitted = summary.submitted,
            processed = summary.processed,
            auto_matched = summary.auto_matched,
            manual_review = summary.manual_review,
            unmatched = summary.unmatched,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Batch run complete"
        );

        Ok(summary)
    }
}

enum FallbackOutcome {
    Suggested(MatchCandidate),
    NoMatch,
    Unavailable,
}

/// Semantic validation at the pipeline boundary. Malformed input is rejected
/// before anything is persisted.
fn validate_transaction(txn: &Transaction) -> Result<(), AppError> {
    if txn.transaction_id.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "transaction_id must not be empty"
        )));
    }
    if txn.amount <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "amount must be positive"
        )));
    }
    if txn.currency.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "currency must not be empty"
        )));
    }
    Ok(())
}

//! Waterfall allocation of a matched transaction across invoices, with
//! optimistic-concurrency commits per invoice.

use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::models::{Allocation, Invoice};
use crate::services::metrics::record_allocation_conflict;
use crate::services::ReconciliationStore;

/// Result of one allocation run. `conflicted` means a version conflict
/// survived the bounded retries and the remainder was left unapplied; the
/// orchestrator downgrades such transactions to manual review.
#[derive(Debug, Clone)]
pub struct AllocationOutcome {
    pub allocations: Vec<Allocation>,
    pub unallocated: Decimal,
    pub conflicted: bool,
}

impl AllocationOutcome {
    pub fn total_applied(&self) -> Decimal {
        self.allocations.iter().map(|a| a.amount_applied).sum()
    }
}

enum StepResult {
    Applied(Allocation),
    Skipped,
    Conflicted,
}

pub struct AllocationEngine {
    store: Arc<dyn ReconciliationStore>,
    max_cas_retries: u32,
}

impl AllocationEngine {
    pub fn new(store: Arc<dyn ReconciliationStore>, max_cas_retries: u32) -> Self {
        Self {
            store,
            max_cas_retries,
        }
    }

    /// Apply `amount` across invoices: the explicit targets first (oldest due
    /// date first), then — when `spill_to_open` is set — the customer's
    /// remaining open invoices in the same order, until the amount is
    /// exhausted. Each invoice commit is a version compare-and-swap.
    ///
    /// Commits are per invoice: an exhausted-retry conflict stops the
    /// waterfall and reports what was already applied rather than losing it.
    #[instrument(skip(self, target_invoice_ids), fields(transaction_id = %transaction_id, customer_id = %customer_id, amount = %amount))]
    pub async fn allocate(
        &self,
        transaction_id: &str,
        customer_id: &str,
        target_invoice_ids: &[String],
        amount: Decimal,
        spill_to_open: bool,
    ) -> Result<AllocationOutcome, AppError> {
        let mut queue = self.build_queue(customer_id, target_invoice_ids, spill_to_open).await?;
        queue.sort_by(|a, b| {
            a.due_date
                .cmp(&b.due_date)
                .then_with(|| a.invoice_id.cmp(&b.invoice_id))
        });

        let mut remaining = amount;
        let mut allocations = Vec::new();
        let mut conflicted = false;

        for invoice in queue {
            if remaining <= Decimal::ZERO {
                break;
            }
            match self.apply_with_retry(&invoice.invoice_id, remaining).await? {
                StepResult::Applied(allocation) => {
                    remaining -= allocation.amount_applied;
                    allocations.push(allocation);
                }
                StepResult::Skipped => continue,
                StepResult::Conflicted => {
                    conflicted = true;
                    break;
                }
            }
        }

        info!(
            transaction_id = %transaction_id,
            applied = %allocations.iter().map(|a| a.amount_applied).sum::<Decimal>(),
            unallocated = %remaining,
            conflicted = conflicted,
            "Allocation run finished"
        );

        Ok(AllocationOutcome {
            allocations,
            unallocated: remaining,
            conflicted,
        })
    }

    async fn build_queue(
        &self,
        customer_id: &str,
        target_invoice_ids: &[String],
        spill_to_open: bool,
    ) -> Result<Vec<Invoice>, AppError> {
        let mut queue = Vec::new();
        for invoice_id in target_invoice_ids {
            let invoice = self.store.get_invoice(invoice_id).await?.ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("invoice {} not found", invoice_id))
            })?;
            if invoice.is_open() {
                queue.push(invoice);
            }
        }

        if spill_to_open {
            let open = self.store.open_invoices_for_customer(customer_id).await?;
            for invoice in open {
                if !target_invoice_ids.contains(&invoice.invoice_id) {
                    queue.push(invoice);
                }
            }
        }

        Ok(queue)
    }

    /// One waterfall step: re-read the invoice, apply
    /// `min(remaining, outstanding)` with a version check, retry on conflict
    /// up to the bound.
    async fn apply_with_retry(
        &self,
        invoice_id: &str,
        remaining: Decimal,
    ) -> Result<StepResult, AppError> {
        for attempt in 0..=self.max_cas_retries {
            let Some(current) = self.store.get_invoice(invoice_id).await? else {
                return Ok(StepResult::Skipped);
            };
            if !current.is_open() || current.outstanding_balance <= Decimal::ZERO {
                return Ok(StepResult::Skipped);
            }

            let applied = remaining.min(current.outstanding_balance);
            match self
                .store
                .apply_invoice_payment(invoice_id, applied, current.version)
                .await
            {
                Ok(_) => {
                    return Ok(StepResult::Applied(Allocation {
                        invoice_id: invoice_id.to_string(),
                        amount_applied: applied,
                    }));
                }
                Err(AppError::VersionConflict(_)) => {
                    record_allocation_conflict(if attempt < self.max_cas_retries {
                        "retried"
                    } else {
                        "exhausted"
                    });
                    warn!(
                        invoice_id = %invoice_id,
                        attempt = attempt + 1,
                        "Invoice version conflict during allocation"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(StepResult::Conflicted)
    }
}

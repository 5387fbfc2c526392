//! End-to-end matching behavior through the pipeline.

mod common;

use common::*;
use reconciliation_service::services::ReconciliationStore;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[tokio::test]
async fn exact_match_auto_applies_with_full_confidence() {
    let (orchestrator, store) = orchestrator();
    seed_customer(&store, "C-1", "Acme Traders Ltd", &["ACME"]).await;
    seed_invoice(&store, "INV-2024-001", "C-1", dec!(150), due(2024, 6, 10)).await;

    let record = orchestrator
        .ingest(transaction(
            "TXN-1",
            dec!(150),
            "Settlement INV-2024-001",
            "Acme Traders Ltd",
            at(2024, 6, 15),
        ))
        .await
        .unwrap();

    assert_eq!(record.decision, "auto_matched");
    assert_eq!(record.match_type.as_deref(), Some("exact"));
    assert_eq!(record.confidence, 1.0);
    assert_eq!(record.allocations.len(), 1);
    assert_eq!(record.allocations[0].invoice_id, "INV-2024-001");
    assert_eq!(record.allocations[0].amount_applied, dec!(150));
    assert_eq!(record.unallocated_amount, Decimal::ZERO);

    let invoice = store.get_invoice("INV-2024-001").await.unwrap().unwrap();
    assert_eq!(invoice.outstanding_balance, Decimal::ZERO);
    assert_eq!(invoice.status, "paid");
    assert_eq!(invoice.version, 2);
}

#[tokio::test]
async fn high_fuzzy_score_auto_applies() {
    let (orchestrator, store) = orchestrator();
    seed_customer(&store, "C-1", "Acme Traders Ltd", &[]).await;
    seed_invoice(&store, "INV-1", "C-1", dec!(1000), due(2024, 6, 15)).await;

    // Amount 5 inside the 25-unit tolerance, name identical, paid on the due
    // date: composite well above the auto threshold, no invoice number in
    // the reference so the exact matcher declines.
    let record = orchestrator
        .ingest(transaction(
            "TXN-1",
            dec!(995),
            "june payment",
            "Acme Traders Ltd",
            at(2024, 6, 15),
        ))
        .await
        .unwrap();

    assert_eq!(record.decision, "auto_matched");
    assert_eq!(record.match_type.as_deref(), Some("fuzzy"));
    assert!(record.confidence >= 0.9);
    assert_eq!(record.allocations[0].amount_applied, dec!(995));

    let invoice = store.get_invoice("INV-1").await.unwrap().unwrap();
    assert_eq!(invoice.outstanding_balance, dec!(5));
    assert_eq!(invoice.status, "partially_paid");
}

#[tokio::test]
async fn mid_band_fuzzy_routes_to_manual_review() {
    let (orchestrator, store) = orchestrator();
    seed_customer(&store, "C-1", "Acme Traders Ltd", &[]).await;
    seed_invoice(&store, "INV-1", "C-1", dec!(1000), due(2024, 6, 15)).await;

    // Amount far outside tolerance (signal 0), name and time perfect:
    // composite lands in the review band.
    let record = orchestrator
        .ingest(transaction(
            "TXN-1",
            dec!(900),
            "part payment",
            "Acme Traders Ltd",
            at(2024, 6, 15),
        ))
        .await
        .unwrap();

    assert_eq!(record.decision, "manual_review");
    assert_eq!(record.match_type.as_deref(), Some("fuzzy"));
    assert!(record.confidence >= 0.5 && record.confidence < 0.9);
    assert!(record.allocations.is_empty());

    // Nothing was applied to the invoice.
    let invoice = store.get_invoice("INV-1").await.unwrap().unwrap();
    assert_eq!(invoice.outstanding_balance, dec!(1000));
    assert_eq!(invoice.version, 1);
}

#[tokio::test]
async fn unknown_payer_with_no_plausible_invoice_is_unmatched() {
    let (orchestrator, store) = orchestrator();
    seed_customer(&store, "C-1", "Acme Traders Ltd", &[]).await;
    seed_invoice(&store, "INV-1", "C-1", dec!(1000), due(2024, 6, 15)).await;

    let record = orchestrator
        .ingest(transaction(
            "TXN-1",
            dec!(77),
            "no idea",
            "Mystery Payer",
            at(2024, 6, 15),
        ))
        .await
        .unwrap();

    assert_eq!(record.decision, "unmatched");
    assert_eq!(record.rationale["reason"], "no_candidates");
    assert!(record.allocations.is_empty());
}

#[tokio::test]
async fn equal_scores_tie_break_to_earlier_due_then_smaller_id() {
    let (orchestrator, store) = orchestrator();
    seed_customer(&store, "C-1", "Acme Traders Ltd", &[]).await;
    // Same balance and due date: identical fuzzy scores, tie falls to the
    // lexicographically smaller invoice id.
    seed_invoice(&store, "INV-B", "C-1", dec!(1000), due(2024, 6, 15)).await;
    seed_invoice(&store, "INV-A", "C-1", dec!(1000), due(2024, 6, 15)).await;

    let record = orchestrator
        .ingest(transaction(
            "TXN-1",
            dec!(900),
            "part payment",
            "Acme Traders Ltd",
            at(2024, 6, 15),
        ))
        .await
        .unwrap();
    assert_eq!(record.decision, "manual_review");
    assert_eq!(record.rationale["candidate"]["invoice_id"], "INV-A");

    // Same shape again under a different transaction: identical selection.
    let record2 = orchestrator
        .ingest(transaction(
            "TXN-2",
            dec!(900),
            "part payment",
            "Acme Traders Ltd",
            at(2024, 6, 15),
        ))
        .await
        .unwrap();
    assert_eq!(record2.rationale["candidate"]["invoice_id"], "INV-A");

    // An earlier due date beats invoice-id ordering.
    let (orchestrator, store) = common::orchestrator();
    seed_customer(&store, "C-1", "Acme Traders Ltd", &[]).await;
    seed_invoice(&store, "INV-A", "C-1", dec!(1000), due(2024, 6, 15)).await;
    seed_invoice(&store, "INV-Z", "C-1", dec!(1000), due(2024, 6, 15)).await;
    let record3 = orchestrator
        .ingest(transaction(
            "TXN-1",
            dec!(900),
            "part payment",
            "Acme Traders Ltd",
            at(2024, 6, 15),
        ))
        .await
        .unwrap();
    assert_eq!(record3.rationale["candidate"]["invoice_id"], "INV-A");
}

#[tokio::test]
async fn resubmission_returns_stored_record_without_reallocating() {
    let (orchestrator, store) = orchestrator();
    seed_customer(&store, "C-1", "Acme Traders Ltd", &[]).await;
    seed_invoice(&store, "INV-1", "C-1", dec!(150), due(2024, 6, 10)).await;

    let txn = transaction(
        "TXN-1",
        dec!(150),
        "Settlement INV-1",
        "Acme Traders Ltd",
        at(2024, 6, 12),
    );

    let first = orchestrator.ingest(txn.clone()).await.unwrap();
    let second = orchestrator.ingest(txn).await.unwrap();

    assert_eq!(first.decision, "auto_matched");
    assert_eq!(second.decision, first.decision);
    assert_eq!(second.allocations, first.allocations);
    assert_eq!(second.decided_utc, first.decided_utc);

    // Allocated exactly once.
    let invoice = store.get_invoice("INV-1").await.unwrap().unwrap();
    assert_eq!(invoice.outstanding_balance, Decimal::ZERO);
    assert_eq!(invoice.version, 2);
}

#[tokio::test]
async fn conflicting_resubmission_is_rejected() {
    let (orchestrator, store) = orchestrator();
    seed_customer(&store, "C-1", "Acme Traders Ltd", &[]).await;
    seed_invoice(&store, "INV-1", "C-1", dec!(150), due(2024, 6, 10)).await;

    let txn = transaction(
        "TXN-1",
        dec!(150),
        "Settlement INV-1",
        "Acme Traders Ltd",
        at(2024, 6, 12),
    );
    orchestrator.ingest(txn.clone()).await.unwrap();

    let mut mutated = txn;
    mutated.amount = dec!(151);
    let result = orchestrator.ingest(mutated).await;
    assert!(result.is_err(), "conflicting re-submission must be rejected");
}

#[tokio::test]
async fn malformed_transaction_never_enters_the_pipeline() {
    let (orchestrator, store) = orchestrator();

    let result = orchestrator
        .ingest(transaction("TXN-1", dec!(-5), "x", "y", at(2024, 6, 1)))
        .await;
    assert!(result.is_err());

    // Rejected before persistence: no transaction, no record, no audit.
    assert!(store.get_transaction("TXN-1").await.unwrap().is_none());
    assert!(store.get_record("TXN-1").await.unwrap().is_none());
    assert!(store.audit_trail("TXN-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn every_decision_leaves_an_audit_trail() {
    let (orchestrator, store) = orchestrator();
    seed_customer(&store, "C-1", "Acme Traders Ltd", &[]).await;
    seed_invoice(&store, "INV-1", "C-1", dec!(150), due(2024, 6, 10)).await;

    orchestrator
        .ingest(transaction(
            "TXN-1",
            dec!(150),
            "Settlement INV-1",
            "Acme Traders Ltd",
            at(2024, 6, 12),
        ))
        .await
        .unwrap();

    let trail = store.audit_trail("TXN-1").await.unwrap();
    let stages: Vec<_> = trail.iter().map(|e| e.stage.as_str()).collect();
    assert_eq!(
        stages,
        vec!["ingested", "candidates_generated", "scored", "decided"]
    );
    let decided = trail.last().unwrap();
    assert_eq!(decided.decision.as_deref(), Some("auto_matched"));
    assert_eq!(decided.actor, "system");
}

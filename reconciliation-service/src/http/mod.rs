//! HTTP surface: gateway feed, manual-review queue, collaborator seams, and
//! audit reads.

pub mod handlers;

use axum::routing::{get, post};
use axum::Router;

use crate::startup::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/api/transactions", post(handlers::ingest_transaction))
        .route("/api/batches", post(handlers::ingest_batch))
        .route("/api/records/:transaction_id", get(handlers::get_record))
        .route("/api/reviews", get(handlers::list_reviews))
        .route(
            "/api/reviews/:transaction_id/resolve",
            post(handlers::resolve_review),
        )
        .route("/api/customers", post(handlers::create_customer))
        .route("/api/invoices", post(handlers::create_invoice))
        .route("/api/invoices/:invoice_id", get(handlers::get_invoice))
        .route("/api/audit/:transaction_id", get(handlers::get_audit_trail))
}

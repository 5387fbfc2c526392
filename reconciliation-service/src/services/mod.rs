//! Service layer: persistence and metrics.

pub mod memory;
pub mod metrics;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use postgres::PgStore;
pub use store::{ReconciliationStore, TransactionInsert};

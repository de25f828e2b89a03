
pub mod core;

pub use core::{Database, LockMode, Snapshot, Transaction, TransactionState};
pub use core::errors::{Error, Result};
pub use core::database::DatabaseOptions;
pub use core::metrics::MetricsSnapshot;

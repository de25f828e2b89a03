pub mod constants;
pub mod errors;
pub mod buffer_pool;
pub mod page;
pub mod header;
pub mod tx_pages;
pub mod disk;
pub mod wal;
pub mod locks;
pub mod validation;
pub mod snapshot;
pub mod transaction;
pub mod metrics;
pub mod database;

pub use constants::*;
pub use database::{Database, DatabaseOptions};
pub use header::{HeaderPage, SharedHeader};
pub use page::{Page, PageType};
pub use snapshot::{LockMode, Snapshot};
pub use transaction::{Transaction, TransactionOptions, TransactionServices, TransactionState};
pub use tx_pages::{PagePosition, TransactionPages};
pub use wal::{WalService, WAL};
pub use metrics::{Metrics, MetricsSnapshot};

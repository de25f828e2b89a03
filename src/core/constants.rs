
pub const PAGE_SIZE: usize = 4096;

pub const PAGE_HEADER_SIZE: usize = 32;

pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

pub const VERSION: u32 = 1;

pub const MAGIC: [u8; 4] = *b"PGTX";

pub const WAL_MAGIC: [u8; 4] = *b"WLOG";

pub const WAL_HEADER_SIZE: usize = 32;

pub const WAL_FRAME_SIZE: usize = PAGE_SIZE + 28;

/// The header page always lives at page 0.
pub const HEADER_PAGE_ID: PageId = 0;

/// Sentinel for "no page": end of a linked chain, empty free list.
pub const NO_PAGE: PageId = u32::MAX;

/// Dirty pages a transaction may buffer before a safepoint spills them to the WAL.
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 60_000;

pub const MAX_COLLECTION_NAME_LEN: usize = 64;

pub type TransactionID = u64;

pub type PageId = u32;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters collected by the transaction manager.
/// All fields use atomic types for lock-free updates with minimal overhead.
#[derive(Debug)]
pub struct Metrics {
    // Transaction metrics
    transactions_begun: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    transactions_aborted: AtomicU64,
    active_transactions: AtomicUsize,

    // Page metrics
    pages_allocated: AtomicU64,
    pages_recycled: AtomicU64,
    pages_deleted: AtomicU64,
    pages_returned: AtomicU64,
    pages_flushed: AtomicU64,
    safepoint_flushes: AtomicU64,

    // WAL metrics
    wal_frames_written: AtomicU64,
    wal_bytes_written: AtomicU64,
    wal_confirms: AtomicU64,
    checkpoints: AtomicU64,
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub transactions_begun: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub transactions_aborted: u64,
    pub active_transactions: usize,
    pub commit_rate: f64,

    pub pages_allocated: u64,
    pub pages_recycled: u64,
    pub pages_deleted: u64,
    pub pages_returned: u64,
    pub pages_flushed: u64,
    pub safepoint_flushes: u64,

    pub wal_frames_written: u64,
    pub wal_bytes_written: u64,
    pub wal_confirms: u64,
    pub checkpoints: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            transactions_begun: AtomicU64::new(0),
            transactions_committed: AtomicU64::new(0),
            transactions_rolled_back: AtomicU64::new(0),
            transactions_aborted: AtomicU64::new(0),
            active_transactions: AtomicUsize::new(0),

            pages_allocated: AtomicU64::new(0),
            pages_recycled: AtomicU64::new(0),
            pages_deleted: AtomicU64::new(0),
            pages_returned: AtomicU64::new(0),
            pages_flushed: AtomicU64::new(0),
            safepoint_flushes: AtomicU64::new(0),

            wal_frames_written: AtomicU64::new(0),
            wal_bytes_written: AtomicU64::new(0),
            wal_confirms: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
        }
    }

    // Transaction metrics
    #[inline]
    pub fn transaction_begun(&self) {
        self.transactions_begun.fetch_add(1, Ordering::Relaxed);
        self.active_transactions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn transaction_committed(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn transaction_rolled_back(&self) {
        self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn transaction_aborted(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// A transaction was disposed, whatever its outcome.
    #[inline]
    pub fn transaction_finished(&self) {
        let _ = self
            .active_transactions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    // Page metrics
    #[inline]
    pub fn page_allocated(&self, recycled: bool) {
        self.pages_allocated.fetch_add(1, Ordering::Relaxed);
        if recycled {
            self.pages_recycled.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn page_deleted(&self) {
        self.pages_deleted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn pages_returned(&self, count: usize) {
        self.pages_returned.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn pages_flushed(&self, count: usize, safepoint: bool) {
        self.pages_flushed.fetch_add(count as u64, Ordering::Relaxed);
        if safepoint {
            self.safepoint_flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    // WAL metrics
    #[inline]
    pub fn wal_write(&self, frames: usize, bytes: u64) {
        self.wal_frames_written.fetch_add(frames as u64, Ordering::Relaxed);
        self.wal_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn transaction_confirmed(&self) {
        self.wal_confirms.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn checkpoint_completed(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of current metrics.
    /// Uses Relaxed ordering since we don't need strict consistency for monitoring.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let transactions_committed = self.transactions_committed.load(Ordering::Relaxed);
        let transactions_rolled_back = self.transactions_rolled_back.load(Ordering::Relaxed);
        let transactions_aborted = self.transactions_aborted.load(Ordering::Relaxed);
        let finished = transactions_committed + transactions_rolled_back;

        MetricsSnapshot {
            transactions_begun: self.transactions_begun.load(Ordering::Relaxed),
            transactions_committed,
            transactions_rolled_back,
            transactions_aborted,
            active_transactions: self.active_transactions.load(Ordering::Relaxed),
            commit_rate: if finished > 0 {
                transactions_committed as f64 / finished as f64
            } else {
                0.0
            },

            pages_allocated: self.pages_allocated.load(Ordering::Relaxed),
            pages_recycled: self.pages_recycled.load(Ordering::Relaxed),
            pages_deleted: self.pages_deleted.load(Ordering::Relaxed),
            pages_returned: self.pages_returned.load(Ordering::Relaxed),
            pages_flushed: self.pages_flushed.load(Ordering::Relaxed),
            safepoint_flushes: self.safepoint_flushes.load(Ordering::Relaxed),

            wal_frames_written: self.wal_frames_written.load(Ordering::Relaxed),
            wal_bytes_written: self.wal_bytes_written.load(Ordering::Relaxed),
            wal_confirms: self.wal_confirms.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}


use crate::core::constants::*;
use crate::core::disk::DataFile;
use crate::core::errors::*;
use crate::core::header::{HeaderPage, SharedHeader};
use crate::core::locks::LockService;
use crate::core::metrics::{Metrics, MetricsSnapshot};
use crate::core::page::{Page, PageType};
use crate::core::snapshot::read_committed_page;
use crate::core::transaction::{OnFinish, Transaction, TransactionOptions, TransactionServices};
use crate::core::wal::{WalService, WAL};
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Dirty pages a transaction buffers before a safepoint flushes them.
    /// Default: 100,000
    pub max_transaction_size: usize,
    /// How long to wait for a collection or checkpoint lock.
    /// Default: 60s
    pub lock_timeout: Duration,
    pub file_permissions: u32,
    /// Enables the transaction state assertions. Defaults to on in debug builds.
    pub check_invariants: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_transaction_size: MAX_TRANSACTION_SIZE,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            file_permissions: 0o644,
            check_invariants: cfg!(debug_assertions),
        }
    }
}

pub struct Database {
    path: String,
    disk: Arc<DataFile>,
    wal: Arc<WAL>,
    header: Arc<SharedHeader>,
    locks: Arc<LockService>,
    metrics: Arc<Metrics>,
    next_transaction_id: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    open_transactions: Arc<Mutex<HashSet<TransactionID>>>,
    lock_file: Mutex<File>,
    options: DatabaseOptions,
    closed: AtomicBool,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_options(path, DatabaseOptions::default())
    }

    pub fn open_with_options(path: &str, opts: DatabaseOptions) -> Result<Self> {
        if path.is_empty() {
            return Err(Error::Other("database path cannot be empty".to_string()));
        }

        let lock_path = format!("{}.lock", path);

        #[cfg(unix)]
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(opts.file_permissions)
            .open(&lock_path)?;

        #[cfg(not(unix))]
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)?;

        lock_file.try_lock_exclusive()?;

        let disk = Arc::new(DataFile::open(path, opts.file_permissions)?);
        let wal = Arc::new(WAL::open(path, opts.file_permissions)?);
        let metrics = Arc::new(Metrics::new());
        wal.set_metrics(Arc::clone(&metrics));

        // The newest confirmed header in the WAL wins over the data file's copy
        let stored = match wal.confirmed_position(HEADER_PAGE_ID) {
            Some(position) => HeaderPage::from_page(&wal.read_page(position)?)?,
            None => disk.read_header()?,
        };
        let mut header = HeaderPage::new();
        header.mark_stable(&stored);

        if wal.confirmed_pages() > 0 {
            wal.checkpoint(&disk)?;
        }

        // A crashed transaction may have spilled frames under an id the header never saw
        let next_transaction_id = header.last_transaction_id.max(wal.max_transaction_id()) + 1;
        info!(
            path,
            last_page_id = header.last_page_id,
            free_head = header.free_empty_page_list,
            collections = header.collections().len(),
            "database opened"
        );

        Ok(Self {
            path: path.to_string(),
            disk,
            wal,
            header: Arc::new(SharedHeader::new(header)),
            locks: Arc::new(LockService::new(opts.lock_timeout)),
            metrics,
            next_transaction_id: Arc::new(AtomicU64::new(next_transaction_id)),
            shutdown: Arc::new(AtomicBool::new(false)),
            open_transactions: Arc::new(Mutex::new(HashSet::new())),
            lock_file: Mutex::new(lock_file),
            options: opts,
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn services(&self) -> TransactionServices {
        let wal: Arc<dyn WalService> = self.wal.clone();
        TransactionServices {
            header: Arc::clone(&self.header),
            wal,
            disk: Arc::clone(&self.disk),
            locks: Arc::clone(&self.locks),
            metrics: Arc::clone(&self.metrics),
            next_transaction_id: Arc::clone(&self.next_transaction_id),
        }
    }

    /// Starts a transaction on the calling thread.
    pub fn begin(&self) -> Result<Transaction> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }

        let open = Arc::clone(&self.open_transactions);
        let on_finish: OnFinish = Box::new(move |id| {
            open.lock().recover_poison().remove(&id);
        });

        let tx = Transaction::new(
            self.services(),
            TransactionOptions {
                max_transaction_size: self.options.max_transaction_size,
                check_invariants: self.options.check_invariants,
            },
            Arc::clone(&self.shutdown),
            Some(on_finish),
        )?;

        self.open_transactions.lock().recover_poison().insert(tx.id());
        Ok(tx)
    }

    /// Ids of transactions begun and not yet disposed.
    pub fn open_transactions(&self) -> Vec<TransactionID> {
        let mut ids: Vec<TransactionID> = self
            .open_transactions
            .lock()
            .recover_poison()
            .iter()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Moves confirmed WAL pages into the data file. Waits for running
    /// transactions to finish and blocks new ones meanwhile.
    pub fn checkpoint(&self) -> Result<usize> {
        self.locks.enter_exclusive()?;
        let result = self.wal.checkpoint(&self.disk);
        self.locks.exit_exclusive();
        result
    }

    /// Copy of the live header.
    pub fn header(&self) -> Result<HeaderPage> {
        self.header.snapshot()
    }

    /// Latest committed image of a page.
    pub fn read_page(&self, page_id: PageId) -> Result<Page> {
        read_committed_page(&self.services(), page_id)
    }

    /// Walks the free list from the header, checking that it is a simple
    /// chain of empty pages.
    pub fn free_pages(&self) -> Result<Vec<PageId>> {
        let header = self.header()?;
        let services = self.services();

        let mut pages = Vec::new();
        let mut seen = HashSet::new();
        let mut current = header.free_empty_page_list;

        while current != NO_PAGE {
            if current == HEADER_PAGE_ID {
                return Err(Error::DataCorruption {
                    details: "free list reaches the header page".to_string(),
                });
            }
            if current > header.last_page_id {
                return Err(Error::DataCorruption {
                    details: format!("free list page {} is beyond last page {}", current, header.last_page_id),
                });
            }
            if !seen.insert(current) {
                return Err(Error::DataCorruption {
                    details: format!("free list visits page {} twice", current),
                });
            }

            let page = read_committed_page(&services, current)?;
            if page.page_type != PageType::Empty {
                return Err(Error::DataCorruption {
                    details: format!("free list page {} is a {:?} page", current, page.page_type),
                });
            }

            pages.push(current);
            current = page.next_page_id;
        }

        Ok(pages)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Signals running transactions to stop at their next safepoint,
    /// checkpoints if none is open, and releases the file lock.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.store(true, Ordering::SeqCst);

        if self.locks.active_transactions() == 0 {
            self.checkpoint()?;
        } else {
            warn!(
                path = %self.path,
                open = self.locks.active_transactions(),
                "closing with open transactions, skipping checkpoint"
            );
        }

        self.wal.close()?;
        self.disk.sync()?;

        let lock_file = self
            .lock_file
            .lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "database.lock_file".to_string() })?;
        FileExt::unlock(&*lock_file)?;

        info!(path = %self.path, "database closed");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path, error = %e, "error closing database");
        }
    }
}

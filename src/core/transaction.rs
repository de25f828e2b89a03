
use crate::core::constants::*;
use crate::core::disk::DataFile;
use crate::core::errors::*;
use crate::core::header::SharedHeader;
use crate::core::locks::LockService;
use crate::core::metrics::Metrics;
use crate::core::page::Page;
use crate::core::snapshot::{LockMode, Snapshot};
use crate::core::tx_pages::TransactionPages;
use crate::core::wal::WalService;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::ThreadId;
use std::time::SystemTime;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    New,
    InUse,
    Committed,
    Aborted,
    Disposed,
}

/// Handles to everything a transaction talks to. Cheap to clone.
#[derive(Clone)]
pub struct TransactionServices {
    pub header: Arc<SharedHeader>,
    pub wal: Arc<dyn WalService>,
    pub disk: Arc<DataFile>,
    pub locks: Arc<LockService>,
    pub metrics: Arc<Metrics>,
    pub next_transaction_id: Arc<AtomicU64>,
}

impl TransactionServices {
    pub fn allocate_transaction_id(&self) -> TransactionID {
        self.next_transaction_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Dirty pages buffered before a safepoint spills them to the WAL.
    pub max_transaction_size: usize,
    /// Turns on the state assertions in `safepoint`.
    pub check_invariants: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            max_transaction_size: MAX_TRANSACTION_SIZE,
            check_invariants: cfg!(debug_assertions),
        }
    }
}

pub type OnFinish = Box<dyn FnOnce(TransactionID) + Send>;

/// One unit of work over the page store.
///
/// Pages are reached through per-collection snapshots created with
/// `create_snapshot`. Nothing is visible to other transactions until
/// `commit` writes its confirm record; dropping an unfinished transaction
/// rolls it back.
pub struct Transaction {
    id: TransactionID,
    start_time: SystemTime,
    state: TransactionState,
    services: TransactionServices,
    options: TransactionOptions,
    shutdown: Arc<AtomicBool>,
    thread_id: Option<ThreadId>,
    pages: Arc<Mutex<TransactionPages>>,
    // keyed by lowercase collection name
    snapshots: HashMap<String, Arc<Snapshot>>,
    on_finish: Option<OnFinish>,
}

impl Transaction {
    /// Starts a transaction on the calling thread. Fails if the thread
    /// already runs one.
    pub fn new(
        services: TransactionServices,
        options: TransactionOptions,
        shutdown: Arc<AtomicBool>,
        on_finish: Option<OnFinish>,
    ) -> Result<Self> {
        if shutdown.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }

        let thread_id = services.locks.enter_transaction()?;
        let id = services.allocate_transaction_id();
        services.metrics.transaction_begun();
        debug!(tx_id = id, "transaction started");

        Ok(Self {
            id,
            start_time: SystemTime::now(),
            state: TransactionState::New,
            services,
            options,
            shutdown,
            thread_id: Some(thread_id),
            pages: Arc::new(Mutex::new(TransactionPages::new())),
            snapshots: HashMap::new(),
            on_finish,
        })
    }

    pub fn id(&self) -> TransactionID {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn transaction_size(&self) -> usize {
        self.pages.lock().recover_poison().transaction_size()
    }

    /// Copy of the page ledger.
    pub fn pages(&self) -> TransactionPages {
        self.pages.lock().recover_poison().clone()
    }

    pub fn snapshot(&self, collection: &str) -> Option<Arc<Snapshot>> {
        self.snapshots.get(&collection.to_lowercase()).cloned()
    }

    pub fn snapshots(&self) -> Vec<Arc<Snapshot>> {
        self.snapshots.values().cloned().collect()
    }

    fn lock_pages(&self) -> Result<MutexGuard<'_, TransactionPages>> {
        self.pages
            .lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "transaction.pages".to_string() })
    }

    /// Returns this transaction's snapshot of `collection`, creating it on
    /// first use. `LockMode::Write` takes the collection lock and, with
    /// `add_if_not_exists`, creates the collection.
    pub fn create_snapshot(
        &mut self,
        mode: LockMode,
        collection: &str,
        add_if_not_exists: bool,
    ) -> Result<Arc<Snapshot>> {
        match self.state {
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Disposed => {
                return Err(Error::invalid_state("create snapshot in", self.state));
            }
            TransactionState::New | TransactionState::InUse => {}
        }

        let key = collection.to_lowercase();
        let snapshot = match self.snapshots.get(&key) {
            Some(snapshot) => Arc::clone(snapshot),
            None => {
                let snapshot = Arc::new(Snapshot::new(
                    collection,
                    self.id,
                    self.services.clone(),
                    Arc::clone(&self.pages),
                ));
                self.snapshots.insert(key, Arc::clone(&snapshot));
                snapshot
            }
        };

        if self.state == TransactionState::New {
            self.state = TransactionState::InUse;
        }

        if mode == LockMode::Write {
            snapshot.enter_write_mode(add_if_not_exists)?;
        }

        Ok(snapshot)
    }

    /// Called between operations. Spills dirty pages to the WAL once the
    /// transaction holds `max_transaction_size` of them.
    pub fn safepoint(&mut self) -> Result<()> {
        if self.state == TransactionState::Disposed {
            return Err(Error::invalid_state("run a safepoint in", self.state));
        }
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        if self.options.check_invariants && self.state != TransactionState::InUse {
            return Err(Error::invalid_state("run a safepoint in", self.state));
        }

        if self.transaction_size() >= self.options.max_transaction_size {
            self.flush_dirty_pages(true)?;
        }
        Ok(())
    }

    /// Writes every dirty page of every snapshot to the WAL in page-id order
    /// and empties the snapshot caches.
    pub fn persist_dirty_pages(&mut self) -> Result<()> {
        if self.state == TransactionState::Disposed {
            return Err(Error::invalid_state("persist pages of", self.state));
        }
        self.flush_dirty_pages(false)
    }

    fn flush_dirty_pages(&mut self, safepoint: bool) -> Result<()> {
        let mut dirty: Vec<Page> = self
            .snapshots
            .values()
            .flat_map(|snapshot| snapshot.dirty_pages())
            .filter(|page| page.page_id != HEADER_PAGE_ID)
            .collect();
        dirty.sort_unstable_by_key(|page| page.page_id);

        for page in dirty.iter_mut() {
            page.transaction_id = self.id;
        }

        let count = dirty.len();
        if count > 0 {
            let mut positions = HashMap::with_capacity(count);
            self.services.wal.write_pages(dirty, &mut positions)?;

            let mut pages = self.lock_pages()?;
            for position in positions.into_values() {
                pages.set_wal_position(position);
            }
        }

        for snapshot in self.snapshots.values() {
            snapshot.clear_local_pages();
        }
        self.lock_pages()?.reset_transaction_size();

        self.services.metrics.pages_flushed(count, safepoint);
        debug!(tx_id = self.id, pages = count, safepoint, "persisted dirty pages");
        Ok(())
    }

    /// Makes every change of this transaction durable and visible at once.
    ///
    /// A no-op for a transaction that never started work or already
    /// committed.
    pub fn commit(&mut self) -> Result<()> {
        match self.state {
            TransactionState::New | TransactionState::Committed => return Ok(()),
            TransactionState::InUse => {}
            _ => return Err(Error::invalid_state("commit", self.state)),
        }

        self.persist_dirty_pages()?;

        {
            let mut header = self.services.header.lock()?;
            let mut pages = self.lock_pages()?;

            if !pages.is_empty() {
                let mut free_head = header.free_empty_page_list;

                if pages.deleted_pages() > 0 {
                    if header.free_empty_page_list != NO_PAGE {
                        let mut tail = self.read_flushed_page(&pages, pages.last_deleted_page())?;
                        tail.next_page_id = header.free_empty_page_list;
                        tail.transaction_id = self.id;

                        let mut positions = HashMap::with_capacity(1);
                        self.services.wal.write_pages(vec![tail], &mut positions)?;
                        for position in positions.into_values() {
                            pages.set_wal_position(position);
                        }
                    }
                    free_head = pages.first_deleted_page();
                }

                let mut confirm = header.clone();
                confirm.update(self.id, free_head, &pages);

                self.services.wal.confirm_transaction(&confirm, &pages.wal_positions())?;

                header.mark_stable(&confirm);
            }

            debug!(
                tx_id = self.id,
                pages = pages.wal_positions().len(),
                deleted = pages.deleted_pages(),
                free_head = header.free_empty_page_list,
                "transaction committed"
            );
        }

        self.dispose_snapshots();
        self.state = TransactionState::Committed;
        self.services.metrics.transaction_committed();
        Ok(())
    }

    fn read_flushed_page(&self, pages: &TransactionPages, page_id: PageId) -> Result<Page> {
        let position = pages.wal_position(page_id).ok_or_else(|| Error::DataCorruption {
            details: format!("deleted page {} was never written to the WAL", page_id),
        })?;
        self.services.wal.read_page(position.position)
    }

    /// Discards the transaction. Pages it allocated go back to the free list.
    ///
    /// A no-op for a transaction that never started work or was already
    /// rolled back.
    pub fn rollback(&mut self) -> Result<()> {
        match self.state {
            TransactionState::New | TransactionState::Aborted => return Ok(()),
            TransactionState::InUse => {}
            _ => return Err(Error::invalid_state("roll back", self.state)),
        }

        let to_return = self.lock_pages()?.pages_to_return();
        if !to_return.is_empty() {
            self.return_new_pages(&to_return)?;
        }

        self.dispose_snapshots();
        self.state = TransactionState::Aborted;
        self.services.metrics.transaction_rolled_back();
        debug!(tx_id = self.id, returned = to_return.len(), "transaction rolled back");
        Ok(())
    }

    /// Chains `page_ids` (in allocation order) in front of the free list
    /// and commits that under a fresh transaction id. The live header only
    /// changes once the confirm is durable.
    fn return_new_pages(&self, page_ids: &[PageId]) -> Result<()> {
        let return_tx_id = self.services.allocate_transaction_id();
        let mut header = self.services.header.lock()?;

        let mut records: Vec<Page> = page_ids
            .iter()
            .enumerate()
            .map(|(i, &page_id)| {
                let mut page = Page::empty(page_id);
                page.prev_page_id = if i == 0 { NO_PAGE } else { page_ids[i - 1] };
                page.next_page_id = page_ids
                    .get(i + 1)
                    .copied()
                    .unwrap_or(header.free_empty_page_list);
                page.transaction_id = return_tx_id;
                page
            })
            .collect();
        records.sort_unstable_by_key(|page| page.page_id);

        let mut positions = HashMap::with_capacity(records.len());
        self.services.wal.write_pages(records, &mut positions)?;

        let mut positions: Vec<_> = positions.into_values().collect();
        positions.sort_unstable_by_key(|p| p.page_id);

        let mut confirm = header.clone();
        confirm.mark_confirmed(return_tx_id, page_ids[0]);
        self.services.wal.confirm_transaction(&confirm, &positions)?;

        header.mark_stable(&confirm);
        drop(header);

        self.services.metrics.pages_returned(page_ids.len());
        debug!(
            tx_id = self.id,
            return_tx_id,
            pages = page_ids.len(),
            "returned new pages to free list"
        );
        Ok(())
    }

    /// Abandons the transaction without flushing, touching the header or
    /// returning allocated pages.
    pub fn abort(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Aborted => return Ok(()),
            TransactionState::New | TransactionState::InUse => {}
            _ => return Err(Error::invalid_state("abort", self.state)),
        }

        self.state = TransactionState::Aborted;
        self.dispose_snapshots();
        self.release_thread();
        self.services.metrics.transaction_aborted();
        debug!(tx_id = self.id, "transaction aborted");
        Ok(())
    }

    /// Ends the transaction, rolling it back first if it is still in use.
    /// Idempotent. The completion callback runs even when the rollback fails.
    pub fn dispose(&mut self) -> Result<()> {
        if self.state == TransactionState::Disposed {
            return Ok(());
        }

        let result = if self.state == TransactionState::InUse {
            self.rollback()
        } else {
            Ok(())
        };

        self.dispose_snapshots();
        self.state = TransactionState::Disposed;
        self.release_thread();
        self.services.metrics.transaction_finished();

        if let Some(on_finish) = self.on_finish.take() {
            on_finish(self.id);
        }

        result
    }

    fn dispose_snapshots(&self) {
        for snapshot in self.snapshots.values() {
            snapshot.dispose();
        }
    }

    fn release_thread(&mut self) {
        if let Some(thread_id) = self.thread_id.take() {
            self.services.locks.exit_transaction(thread_id);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!(tx_id = self.id, error = %e, "error disposing transaction");
        }
    }
}

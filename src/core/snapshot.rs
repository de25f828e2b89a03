
use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::page::{Page, PageType};
use crate::core::transaction::TransactionServices;
use crate::core::tx_pages::TransactionPages;
use crate::core::validation::validate_collection_name;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

struct SnapshotState {
    mode: LockMode,
    collection_page: Option<PageId>,
    local_pages: HashMap<PageId, Page>,
    disposed: bool,
}

/// A transaction's working view of one collection.
///
/// Holds every page the transaction has read or modified in this collection
/// until the next flush. Writing requires write mode, which takes the
/// collection's lock for the rest of the transaction.
pub struct Snapshot {
    collection: String,
    transaction_id: TransactionID,
    services: TransactionServices,
    pages: Arc<Mutex<TransactionPages>>,
    state: Mutex<SnapshotState>,
}

impl Snapshot {
    pub(crate) fn new(
        collection: &str,
        transaction_id: TransactionID,
        services: TransactionServices,
        pages: Arc<Mutex<TransactionPages>>,
    ) -> Self {
        Self {
            collection: collection.to_string(),
            transaction_id,
            services,
            pages,
            state: Mutex::new(SnapshotState {
                mode: LockMode::Read,
                collection_page: None,
                local_pages: HashMap::new(),
                disposed: false,
            }),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn mode(&self) -> LockMode {
        self.state.lock().recover_poison().mode
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().recover_poison().disposed
    }

    /// Root page of the collection, if it exists (committed, or created by
    /// this transaction).
    pub fn collection_page_id(&self) -> Result<Option<PageId>> {
        let state = self.live_state()?;
        if state.collection_page.is_some() {
            return Ok(state.collection_page);
        }
        drop(state);
        self.lookup_collection()
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, SnapshotState>> {
        self.state
            .lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "snapshot.state".to_string() })
    }

    fn lock_pages(&self) -> Result<MutexGuard<'_, TransactionPages>> {
        self.pages
            .lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "transaction.pages".to_string() })
    }

    fn live_state(&self) -> Result<MutexGuard<'_, SnapshotState>> {
        let state = self.lock_state()?;
        if state.disposed {
            return Err(Error::SnapshotDisposed { collection: self.collection.clone() });
        }
        Ok(state)
    }

    fn writable_state(&self) -> Result<MutexGuard<'_, SnapshotState>> {
        let state = self.live_state()?;
        if state.mode != LockMode::Write {
            return Err(Error::SnapshotReadOnly { collection: self.collection.clone() });
        }
        Ok(state)
    }

    fn lookup_collection(&self) -> Result<Option<PageId>> {
        if let Some(page_id) = self.lock_pages()?.new_collection(&self.collection) {
            return Ok(Some(page_id));
        }
        Ok(self.services.header.lock()?.collection(&self.collection))
    }

    /// Upgrades to write mode, taking the collection lock. With
    /// `create_if_missing`, a collection that does not exist yet is created
    /// with a fresh root page. On failure the snapshot stays in read mode and
    /// the lock is released.
    pub fn enter_write_mode(&self, create_if_missing: bool) -> Result<()> {
        {
            let mut state = self.live_state()?;
            if state.mode == LockMode::Write && state.collection_page.is_some() {
                return Ok(());
            }
            if state.mode == LockMode::Read {
                self.services.locks.enter_collection(&self.collection, self.transaction_id)?;
                state.mode = LockMode::Write;
            }
        }

        let opened = self.open_collection(create_if_missing);
        if opened.is_err() {
            let mut state = self.state.lock().recover_poison();
            if state.collection_page.is_none() {
                state.mode = LockMode::Read;
                self.services.locks.exit_collection(&self.collection, self.transaction_id);
            }
        }
        opened
    }

    fn open_collection(&self, create_if_missing: bool) -> Result<()> {
        if let Some(page_id) = self.lookup_collection()? {
            self.lock_state()?.collection_page = Some(page_id);
            return Ok(());
        }
        if !create_if_missing {
            return Err(Error::CollectionDoesNotExist { name: self.collection.clone() });
        }

        validate_collection_name(&self.collection)?;
        {
            let header = self.services.header.lock()?;
            let pages = self.lock_pages()?;
            if !header.has_room_for(&self.collection, pages.new_collections()) {
                return Err(Error::HeaderFull);
            }
        }

        let root = self.new_page(PageType::Collection)?;
        self.lock_pages()?.add_collection(&self.collection, root.page_id);
        self.lock_state()?.collection_page = Some(root.page_id);

        trace!(collection = %self.collection, page_id = root.page_id, "collection created");
        Ok(())
    }

    /// Reads a page through this transaction's view: local cache, then the
    /// transaction's own flushed copy, then the last confirmed copy in the
    /// WAL, then the data file.
    pub fn get_page(&self, page_id: PageId) -> Result<Page> {
        let mut state = self.live_state()?;
        if let Some(page) = state.local_pages.get(&page_id) {
            return Ok(page.clone());
        }

        let page = self.load_page(page_id)?;
        state.local_pages.insert(page_id, page.clone());
        Ok(page)
    }

    fn load_page(&self, page_id: PageId) -> Result<Page> {
        let own = self.lock_pages()?.wal_position(page_id);
        let page = match own {
            Some(position) => self.services.wal.read_page(position.position)?,
            None => read_committed_page(&self.services, page_id)?,
        };

        if page.page_id != page_id {
            return Err(Error::DataCorruption {
                details: format!("expected page {} but read page {}", page_id, page.page_id),
            });
        }
        Ok(page)
    }

    /// Stores a modified page in the local cache.
    pub fn set_page(&self, mut page: Page) -> Result<()> {
        if page.page_id == HEADER_PAGE_ID {
            return Err(Error::HeaderPageAccess { operation: "written".to_string() });
        }

        let mut state = self.writable_state()?;
        let was_dirty = state
            .local_pages
            .get(&page.page_id)
            .map(|p| p.is_dirty())
            .unwrap_or(false);

        page.mark_dirty();
        state.local_pages.insert(page.page_id, page);
        drop(state);

        if !was_dirty {
            self.lock_pages()?.add_dirty();
        }
        Ok(())
    }

    /// Allocates a page, reusing the head of the free list when there is one.
    pub fn new_page(&self, page_type: PageType) -> Result<Page> {
        let mut state = self.writable_state()?;

        let (page_id, recycled) = {
            let mut header = self.services.header.lock()?;
            if header.free_empty_page_list != NO_PAGE {
                let page_id = header.free_empty_page_list;
                let free = read_committed_page(&self.services, page_id)?;
                if free.page_type != PageType::Empty {
                    return Err(Error::DataCorruption {
                        details: format!("free list page {} is a {:?} page", page_id, free.page_type),
                    });
                }
                header.free_empty_page_list = free.next_page_id;
                (page_id, true)
            } else {
                if header.last_page_id >= NO_PAGE - 1 {
                    return Err(Error::PageIdsExhausted);
                }
                header.last_page_id += 1;
                (header.last_page_id, false)
            }
        };

        let mut page = Page::new(page_id, page_type);
        page.transaction_id = self.transaction_id;
        page.mark_dirty();
        state.local_pages.insert(page_id, page.clone());
        drop(state);

        {
            let mut pages = self.lock_pages()?;
            pages.add_new_page(page_id);
            pages.add_dirty();
        }
        self.services.metrics.page_allocated(recycled);
        trace!(page_id, recycled, tx_id = self.transaction_id, "page allocated");

        Ok(page)
    }

    /// Frees a page: it becomes an empty record pushed onto this
    /// transaction's deleted chain, joining the free list at commit.
    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        if page_id == HEADER_PAGE_ID {
            return Err(Error::HeaderPageAccess { operation: "deleted".to_string() });
        }

        let mut state = self.writable_state()?;
        let mut page = match state.local_pages.remove(&page_id) {
            Some(page) => page,
            None => self.load_page(page_id)?,
        };
        if page.page_type == PageType::Empty {
            state.local_pages.insert(page_id, page);
            return Err(Error::PageAlreadyFree { page_id });
        }

        let was_dirty = page.is_dirty();
        let next = {
            let mut pages = self.lock_pages()?;
            let next = pages.add_deleted_page(page_id);
            if !was_dirty {
                pages.add_dirty();
            }
            next
        };

        page.reset_to_empty(next);
        state.local_pages.insert(page_id, page);

        self.services.metrics.page_deleted();
        trace!(page_id, next, tx_id = self.transaction_id, "page deleted");
        Ok(())
    }

    /// Every page currently held by this snapshot, dirty or clean.
    pub fn local_pages(&self) -> Vec<Page> {
        let state = self.state.lock().recover_poison();
        let mut pages: Vec<Page> = state.local_pages.values().cloned().collect();
        pages.sort_unstable_by_key(|p| p.page_id);
        pages
    }

    pub(crate) fn dirty_pages(&self) -> Vec<Page> {
        self.state
            .lock()
            .recover_poison()
            .local_pages
            .values()
            .filter(|p| p.is_dirty() && p.page_type != PageType::Header)
            .cloned()
            .collect()
    }

    pub(crate) fn clear_local_pages(&self) {
        self.state.lock().recover_poison().local_pages.clear();
    }

    /// Drops the local cache and releases the collection lock. Idempotent.
    pub(crate) fn dispose(&self) {
        let mut state = self.state.lock().recover_poison();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.local_pages.clear();

        if state.mode == LockMode::Write {
            self.services.locks.exit_collection(&self.collection, self.transaction_id);
        }
    }
}

/// Latest confirmed image of a page: the WAL if it holds one, else the data file.
pub(crate) fn read_committed_page(services: &TransactionServices, page_id: PageId) -> Result<Page> {
    match services.wal.confirmed_position(page_id) {
        Some(position) => services.wal.read_page(position),
        None => services.disk.read_page(page_id),
    }
}

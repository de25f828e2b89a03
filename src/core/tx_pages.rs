
use crate::core::constants::*;
use std::collections::HashMap;

/// Location of a page image inside the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PagePosition {
    pub page_id: PageId,
    /// Frame number in the WAL.
    pub position: u64,
}

impl PagePosition {
    pub fn new(page_id: PageId, position: u64) -> Self {
        Self { page_id, position }
    }
}

/// Per-transaction page bookkeeping. Pure accounting, no I/O.
///
/// Deleted pages form a transaction-local singly linked chain through each
/// page's `next_page_id`: every deletion is pushed at the head, so
/// `last_deleted_page` is the tail that gets spliced onto the header's free
/// list at commit.
#[derive(Debug, Clone)]
pub struct TransactionPages {
    transaction_size: usize,
    deleted_pages: usize,
    first_deleted_page: PageId,
    last_deleted_page: PageId,
    new_pages: Vec<PageId>,
    // allocated by this transaction, then deleted by it
    discarded_new_pages: Vec<PageId>,
    dirty_pages_wal: HashMap<PageId, PagePosition>,
    new_collections: Vec<(String, PageId)>,
}

impl Default for TransactionPages {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionPages {
    pub fn new() -> Self {
        Self {
            transaction_size: 0,
            deleted_pages: 0,
            first_deleted_page: NO_PAGE,
            last_deleted_page: NO_PAGE,
            new_pages: Vec::new(),
            discarded_new_pages: Vec::new(),
            dirty_pages_wal: HashMap::new(),
            new_collections: Vec::new(),
        }
    }

    pub fn transaction_size(&self) -> usize {
        self.transaction_size
    }

    /// A page became dirty in some snapshot.
    pub fn add_dirty(&mut self) {
        self.transaction_size += 1;
    }

    pub fn reset_transaction_size(&mut self) {
        self.transaction_size = 0;
    }

    pub fn add_new_page(&mut self, page_id: PageId) {
        self.new_pages.push(page_id);
    }

    pub fn new_pages(&self) -> &[PageId] {
        &self.new_pages
    }

    /// Pushes `page_id` onto the deleted chain and returns the id the
    /// deleted page's `next_page_id` must point to.
    pub fn add_deleted_page(&mut self, page_id: PageId) -> PageId {
        if let Some(index) = self.new_pages.iter().position(|&id| id == page_id) {
            self.new_pages.remove(index);
            self.discarded_new_pages.push(page_id);
        }

        let next = self.first_deleted_page;
        if self.last_deleted_page == NO_PAGE {
            self.last_deleted_page = page_id;
        }
        self.first_deleted_page = page_id;
        self.deleted_pages += 1;
        next
    }

    pub fn deleted_pages(&self) -> usize {
        self.deleted_pages
    }

    pub fn first_deleted_page(&self) -> PageId {
        self.first_deleted_page
    }

    pub fn last_deleted_page(&self) -> PageId {
        self.last_deleted_page
    }

    /// Pages a rollback must hand back to the free list, in allocation order
    /// followed by the ones this transaction allocated and then deleted.
    pub fn pages_to_return(&self) -> Vec<PageId> {
        self.new_pages
            .iter()
            .chain(self.discarded_new_pages.iter())
            .copied()
            .collect()
    }

    pub fn set_wal_position(&mut self, position: PagePosition) {
        self.dirty_pages_wal.insert(position.page_id, position);
    }

    pub fn wal_position(&self, page_id: PageId) -> Option<PagePosition> {
        self.dirty_pages_wal.get(&page_id).copied()
    }

    pub fn wal_positions(&self) -> Vec<PagePosition> {
        let mut positions: Vec<PagePosition> = self.dirty_pages_wal.values().copied().collect();
        positions.sort_unstable_by_key(|p| p.page_id);
        positions
    }

    pub fn add_collection(&mut self, name: &str, page_id: PageId) {
        self.new_collections.push((name.to_string(), page_id));
    }

    pub fn new_collections(&self) -> &[(String, PageId)] {
        &self.new_collections
    }

    pub fn new_collection(&self, name: &str) -> Option<PageId> {
        self.new_collections
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|&(_, page_id)| page_id)
    }

    /// True when committing would change nothing durable.
    pub fn is_empty(&self) -> bool {
        self.dirty_pages_wal.is_empty() && self.deleted_pages == 0 && self.new_collections.is_empty()
    }
}

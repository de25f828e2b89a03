use pagetxn::core::disk::DataFile;
use pagetxn::core::locks::LockService;
use pagetxn::core::{
    HeaderPage, LockMode, Metrics, Page, PagePosition, PageType, SharedHeader, Transaction,
    TransactionOptions, TransactionServices, TransactionState, WalService, NO_PAGE, WAL,
};
use pagetxn::{Database, Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Wraps the file WAL, recording every page batch and optionally failing confirms.
struct RecordingWal {
    inner: WAL,
    batches: Mutex<Vec<Vec<u32>>>,
    confirms: AtomicUsize,
    fail_confirm: AtomicBool,
}

impl RecordingWal {
    fn open(path: &str) -> Self {
        Self {
            inner: WAL::open(path, 0o644).unwrap(),
            batches: Mutex::new(Vec::new()),
            confirms: AtomicUsize::new(0),
            fail_confirm: AtomicBool::new(false),
        }
    }
}

impl WalService for RecordingWal {
    fn write_pages(&self, pages: Vec<Page>, positions: &mut HashMap<u32, PagePosition>) -> Result<()> {
        self.batches
            .lock()
            .unwrap()
            .push(pages.iter().map(|p| p.page_id).collect());
        self.inner.write_pages(pages, positions)
    }

    fn confirm_transaction(&self, confirm: &HeaderPage, positions: &[PagePosition]) -> Result<()> {
        if self.fail_confirm.load(Ordering::SeqCst) {
            return Err(Error::Io("injected confirm failure".to_string()));
        }
        self.confirms.fetch_add(1, Ordering::SeqCst);
        self.inner.confirm_transaction(confirm, positions)
    }

    fn read_page(&self, position: u64) -> Result<Page> {
        self.inner.read_page(position)
    }

    fn confirmed_position(&self, page_id: u32) -> Option<u64> {
        self.inner.confirmed_position(page_id)
    }
}

struct Harness {
    _dir: TempDir,
    wal: Arc<RecordingWal>,
    services: TransactionServices,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("protocol.db").to_string_lossy().to_string();
    let wal = Arc::new(RecordingWal::open(&path));
    let services = TransactionServices {
        header: Arc::new(SharedHeader::new(HeaderPage::new())),
        wal: wal.clone(),
        disk: Arc::new(DataFile::open(&path, 0o644).unwrap()),
        locks: Arc::new(LockService::new(Duration::from_millis(200))),
        metrics: Arc::new(Metrics::new()),
        next_transaction_id: Arc::new(AtomicU64::new(1)),
    };
    Harness { _dir: dir, wal, services }
}

fn begin(h: &Harness) -> Transaction {
    Transaction::new(
        h.services.clone(),
        TransactionOptions { max_transaction_size: 1_000, check_invariants: true },
        Arc::new(AtomicBool::new(false)),
        None,
    )
    .unwrap()
}

/// Commits a collection `name` holding `data_pages` data pages; returns their ids.
fn seed(h: &Harness, name: &str, data_pages: usize) -> Vec<u32> {
    let mut tx = begin(h);
    let snapshot = tx.create_snapshot(LockMode::Write, name, true).unwrap();
    let ids = (0..data_pages)
        .map(|_| snapshot.new_page(PageType::Data).unwrap().page_id)
        .collect();
    tx.commit().unwrap();
    tx.dispose().unwrap();
    ids
}

#[test]
fn test_states_only_move_forward() {
    let h = harness();

    let mut tx = begin(&h);
    let mut seen = vec![tx.state()];
    let snapshot = tx.create_snapshot(LockMode::Write, "users", true).unwrap();
    seen.push(tx.state());
    snapshot.new_page(PageType::Data).unwrap();
    tx.safepoint().unwrap();
    seen.push(tx.state());
    tx.commit().unwrap();
    seen.push(tx.state());
    tx.rollback().unwrap_err();
    seen.push(tx.state());
    tx.dispose().unwrap();
    seen.push(tx.state());

    assert_eq!(
        seen,
        vec![
            TransactionState::New,
            TransactionState::InUse,
            TransactionState::InUse,
            TransactionState::Committed,
            TransactionState::Committed,
            TransactionState::Disposed,
        ]
    );
}

#[test]
fn test_persist_clears_every_snapshot() {
    let h = harness();

    let mut tx = begin(&h);
    let users = tx.create_snapshot(LockMode::Write, "users", true).unwrap();
    let orders = tx.create_snapshot(LockMode::Write, "orders", true).unwrap();
    users.new_page(PageType::Data).unwrap();
    orders.new_page(PageType::Data).unwrap();
    orders.new_page(PageType::Index).unwrap();
    assert_eq!(tx.transaction_size(), 5);

    tx.persist_dirty_pages().unwrap();

    assert_eq!(tx.transaction_size(), 0);
    assert!(users.local_pages().is_empty());
    assert!(orders.local_pages().is_empty());
    assert_eq!(tx.pages().wal_positions().len(), 5);

    // flushed pages are still readable through the transaction
    let page = orders.get_page(5).unwrap();
    assert_eq!(page.page_type, PageType::Index);
    assert_eq!(page.transaction_id, tx.id());
}

#[test]
fn test_wal_batches_are_sorted_by_page_id() {
    let h = harness();
    let ids = seed(&h, "users", 6);
    seed(&h, "orders", 2);
    h.wal.batches.lock().unwrap().clear();

    let mut tx = begin(&h);
    let users = tx.create_snapshot(LockMode::Write, "users", false).unwrap();
    let orders = tx.create_snapshot(LockMode::Write, "orders", false).unwrap();

    for &id in ids.iter().rev() {
        let mut page = users.get_page(id).unwrap();
        page.write_payload(0, &[id as u8]).unwrap();
        users.set_page(page).unwrap();
    }
    let mut page = orders.get_page(9).unwrap();
    page.write_payload(0, b"o").unwrap();
    orders.set_page(page).unwrap();
    orders.new_page(PageType::Data).unwrap();

    tx.commit().unwrap();

    let batches = h.wal.batches.lock().unwrap();
    assert!(!batches.is_empty());
    for batch in batches.iter() {
        assert!(batch.windows(2).all(|w| w[0] < w[1]), "unsorted batch {:?}", batch);
    }
    assert_eq!(batches[0], vec![2, 3, 4, 5, 6, 7, 9, 11]);
}

#[test]
fn test_confirm_failure_leaves_header_untouched() {
    let h = harness();
    let ids = seed(&h, "users", 3);

    let mut tx = begin(&h);
    let snapshot = tx.create_snapshot(LockMode::Write, "users", false).unwrap();
    snapshot.delete_page(ids[0]).unwrap();
    snapshot.new_page(PageType::Data).unwrap();
    tx.create_snapshot(LockMode::Write, "orders", true).unwrap();

    let before = h.services.header.snapshot().unwrap();
    h.wal.fail_confirm.store(true, Ordering::SeqCst);

    assert!(matches!(tx.commit(), Err(Error::Io(_))));
    assert_eq!(h.services.header.snapshot().unwrap(), before);
    assert_eq!(h.services.header.snapshot().unwrap().collection("orders"), None);
    assert_eq!(tx.state(), TransactionState::InUse);

    h.wal.fail_confirm.store(false, Ordering::SeqCst);
    tx.dispose().unwrap();
}

#[test]
fn test_rollback_failure_leaves_header_untouched() {
    let h = harness();
    seed(&h, "users", 1);

    let mut tx = begin(&h);
    let snapshot = tx.create_snapshot(LockMode::Write, "users", false).unwrap();
    snapshot.new_page(PageType::Data).unwrap();

    let before = h.services.header.snapshot().unwrap();
    h.wal.fail_confirm.store(true, Ordering::SeqCst);

    assert!(tx.rollback().is_err());
    assert_eq!(h.services.header.snapshot().unwrap(), before);

    // dispose still finishes the transaction
    assert!(tx.dispose().is_err());
    assert_eq!(tx.state(), TransactionState::Disposed);
    assert_eq!(h.services.locks.active_transactions(), 0);
    assert_eq!(h.services.locks.collection_owner("users"), None);
}

#[test]
fn test_second_commit_does_not_confirm_again() {
    let h = harness();

    let mut tx = begin(&h);
    let snapshot = tx.create_snapshot(LockMode::Write, "users", true).unwrap();
    snapshot.new_page(PageType::Data).unwrap();

    tx.commit().unwrap();
    assert_eq!(h.wal.confirms.load(Ordering::SeqCst), 1);

    tx.commit().unwrap();
    assert_eq!(h.wal.confirms.load(Ordering::SeqCst), 1);
    assert_eq!(tx.state(), TransactionState::Committed);
}

#[test]
fn test_read_only_commit_writes_no_confirm() {
    let h = harness();
    let ids = seed(&h, "users", 1);
    let confirms = h.wal.confirms.load(Ordering::SeqCst);

    let mut tx = begin(&h);
    let snapshot = tx.create_snapshot(LockMode::Read, "users", false).unwrap();
    snapshot.get_page(ids[0]).unwrap();
    tx.commit().unwrap();

    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(h.wal.confirms.load(Ordering::SeqCst), confirms);
}

#[test]
fn test_create_snapshot_after_rollback_fails() {
    let h = harness();

    let mut tx = begin(&h);
    tx.create_snapshot(LockMode::Write, "users", true).unwrap();
    tx.rollback().unwrap();

    let result = tx.create_snapshot(LockMode::Read, "orders", false);
    assert!(matches!(
        result,
        Err(Error::InvalidTransactionState { state: TransactionState::Aborted, .. })
    ));
    assert!(tx.snapshot("orders").is_none());
    assert_eq!(tx.snapshots().len(), 1);
}

#[test]
fn test_read_mode_snapshot_rejects_writes() {
    let h = harness();
    seed(&h, "users", 1);

    let mut tx = begin(&h);
    let snapshot = tx.create_snapshot(LockMode::Read, "users", false).unwrap();
    assert!(matches!(snapshot.new_page(PageType::Data), Err(Error::SnapshotReadOnly { .. })));
    assert!(matches!(snapshot.delete_page(2), Err(Error::SnapshotReadOnly { .. })));

    tx.commit().unwrap();
    assert!(matches!(snapshot.get_page(2), Err(Error::SnapshotDisposed { .. })));
}

#[test]
fn test_collection_lock_is_held_until_transaction_end() {
    let h = harness();
    seed(&h, "users", 1);

    let mut tx = begin(&h);
    tx.create_snapshot(LockMode::Write, "users", false).unwrap();
    let owner = tx.id();
    assert_eq!(h.services.locks.collection_owner("USERS"), Some(owner));

    let services = h.services.clone();
    let blocked = std::thread::spawn(move || {
        let mut other = Transaction::new(
            services,
            TransactionOptions::default(),
            Arc::new(AtomicBool::new(false)),
            None,
        )
        .unwrap();
        let result = other.create_snapshot(LockMode::Write, "users", false).map(|_| ());
        other.dispose().unwrap();
        result
    })
    .join()
    .unwrap();
    assert!(matches!(blocked, Err(Error::LockTimeout { .. })));

    tx.commit().unwrap();
    assert_eq!(h.services.locks.collection_owner("users"), None);
}

#[test]
fn test_invalid_collection_names() {
    let h = harness();

    let mut tx = begin(&h);
    assert!(matches!(
        tx.create_snapshot(LockMode::Write, "bad name", true),
        Err(Error::CollectionNameInvalidChar)
    ));
    assert!(matches!(
        tx.create_snapshot(LockMode::Write, "_system", true),
        Err(Error::CollectionNameReserved)
    ));
}

#[test]
fn test_failed_write_mode_can_be_retried_with_create() {
    let h = harness();

    let mut tx = begin(&h);
    assert!(matches!(
        tx.create_snapshot(LockMode::Write, "users", false),
        Err(Error::CollectionDoesNotExist { .. })
    ));
    let snapshot = tx.create_snapshot(LockMode::Read, "users", false).unwrap();
    assert_eq!(snapshot.mode(), LockMode::Read);
    assert_eq!(h.services.locks.collection_owner("users"), None);

    let snapshot = tx.create_snapshot(LockMode::Write, "users", true).unwrap();
    assert_eq!(snapshot.mode(), LockMode::Write);
    let root = snapshot.collection_page_id().unwrap();
    assert!(root.is_some());
    assert_eq!(h.services.locks.collection_owner("users"), Some(tx.id()));

    tx.commit().unwrap();
    assert_eq!(h.services.header.snapshot().unwrap().collection("users"), root);
}

#[test]
fn test_snapshot_page_misuse_errors() {
    let h = harness();
    let ids = seed(&h, "users", 1);

    let mut tx = begin(&h);
    let snapshot = tx.create_snapshot(LockMode::Write, "users", false).unwrap();
    assert!(matches!(snapshot.delete_page(0), Err(Error::HeaderPageAccess { .. })));
    assert!(matches!(
        snapshot.set_page(Page::new(0, PageType::Data)),
        Err(Error::HeaderPageAccess { .. })
    ));

    snapshot.delete_page(ids[0]).unwrap();
    assert!(matches!(
        snapshot.delete_page(ids[0]),
        Err(Error::PageAlreadyFree { page_id }) if page_id == ids[0]
    ));
}

#[test]
fn test_deleted_page_joins_free_list_head() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("free.db").to_str().unwrap()).unwrap();

    {
        let mut tx = db.begin().unwrap();
        let snapshot = tx.create_snapshot(LockMode::Write, "items", true).unwrap();
        for _ in 0..9 {
            snapshot.new_page(PageType::Data).unwrap();
        }
        tx.commit().unwrap();
    }
    assert_eq!(db.header().unwrap().last_page_id, 10);

    {
        let mut tx = db.begin().unwrap();
        let snapshot = tx.create_snapshot(LockMode::Write, "items", false).unwrap();
        snapshot.delete_page(3).unwrap();
        tx.commit().unwrap();
    }
    assert_eq!(db.header().unwrap().free_empty_page_list, 3);

    {
        let mut tx = db.begin().unwrap();
        let snapshot = tx.create_snapshot(LockMode::Write, "items", false).unwrap();
        snapshot.delete_page(10).unwrap();
        tx.commit().unwrap();
    }

    assert_eq!(db.header().unwrap().free_empty_page_list, 10);
    let page = db.read_page(10).unwrap();
    assert_eq!(page.page_type, PageType::Empty);
    assert_eq!(page.next_page_id, 3);
    assert_eq!(db.free_pages().unwrap(), vec![10, 3]);
}

#[test]
fn test_deleted_chain_keeps_newest_first() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("chain.db").to_str().unwrap()).unwrap();

    {
        let mut tx = db.begin().unwrap();
        let snapshot = tx.create_snapshot(LockMode::Write, "items", true).unwrap();
        for _ in 0..5 {
            snapshot.new_page(PageType::Data).unwrap();
        }
        tx.commit().unwrap();
    }
    {
        let mut tx = db.begin().unwrap();
        let snapshot = tx.create_snapshot(LockMode::Write, "items", false).unwrap();
        snapshot.delete_page(2).unwrap();
        tx.commit().unwrap();
    }
    {
        let mut tx = db.begin().unwrap();
        let snapshot = tx.create_snapshot(LockMode::Write, "items", false).unwrap();
        snapshot.delete_page(4).unwrap();
        snapshot.delete_page(5).unwrap();
        tx.commit().unwrap();
    }

    assert_eq!(db.free_pages().unwrap(), vec![5, 4, 2]);
}

#[test]
fn test_rollback_returns_new_pages_in_allocation_order() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("rollback.db").to_str().unwrap()).unwrap();

    {
        let mut tx = db.begin().unwrap();
        let a = tx.create_snapshot(LockMode::Write, "a", true).unwrap();
        let b = tx.create_snapshot(LockMode::Write, "b", true).unwrap();
        b.new_page(PageType::Data).unwrap();
        a.new_page(PageType::Data).unwrap();
        tx.commit().unwrap();
    }
    assert_eq!(db.header().unwrap().last_page_id, 4);

    let mut tx = db.begin().unwrap();
    let a = tx.create_snapshot(LockMode::Write, "a", false).unwrap();
    let allocated: Vec<u32> = (0..3).map(|_| a.new_page(PageType::Data).unwrap().page_id).collect();
    assert_eq!(allocated, vec![5, 6, 7]);

    // another thread frees page 3 while this transaction is open
    std::thread::scope(|s| {
        s.spawn(|| {
            let mut other = db.begin().unwrap();
            let b = other.create_snapshot(LockMode::Write, "b", false).unwrap();
            b.delete_page(3).unwrap();
            other.commit().unwrap();
        });
    });
    assert_eq!(db.header().unwrap().free_empty_page_list, 3);

    tx.rollback().unwrap();
    assert_eq!(tx.state(), TransactionState::Aborted);

    let header = db.header().unwrap();
    assert_eq!(header.free_empty_page_list, 5);
    assert_eq!(header.pending_transaction, None);
    assert_eq!(db.free_pages().unwrap(), vec![5, 6, 7, 3]);

    let expected_links = [(5, NO_PAGE, 6), (6, 5, 7), (7, 6, 3)];
    for (id, prev, next) in expected_links {
        let page = db.read_page(id).unwrap();
        assert_eq!(page.page_type, PageType::Empty);
        assert_eq!(page.prev_page_id, prev);
        assert_eq!(page.next_page_id, next);
    }
}

#[test]
fn test_dispose_without_commit_returns_pages() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("dispose.db").to_str().unwrap()).unwrap();

    let mut tx = db.begin().unwrap();
    let snapshot = tx.create_snapshot(LockMode::Write, "items", true).unwrap();
    let first = snapshot.new_page(PageType::Data).unwrap().page_id;
    let second = snapshot.new_page(PageType::Data).unwrap().page_id;
    let discarded = snapshot.new_page(PageType::Data).unwrap().page_id;
    snapshot.delete_page(discarded).unwrap();

    tx.dispose().unwrap();
    assert_eq!(tx.state(), TransactionState::Disposed);

    let metrics = db.metrics();
    assert_eq!(metrics.transactions_rolled_back, 1);
    assert_eq!(metrics.pages_returned, 4);

    let mut free = db.free_pages().unwrap();
    free.sort_unstable();
    assert_eq!(free, vec![1, first, second, discarded]);
    assert_eq!(db.header().unwrap().collection("items"), None);
    assert!(db.open_transactions().is_empty());
}

#[test]
fn test_freed_pages_are_reused() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("reuse.db").to_str().unwrap()).unwrap();

    {
        let mut tx = db.begin().unwrap();
        let snapshot = tx.create_snapshot(LockMode::Write, "items", true).unwrap();
        snapshot.new_page(PageType::Data).unwrap();
        snapshot.new_page(PageType::Data).unwrap();
        tx.commit().unwrap();
    }
    {
        let mut tx = db.begin().unwrap();
        let snapshot = tx.create_snapshot(LockMode::Write, "items", false).unwrap();
        snapshot.delete_page(2).unwrap();
        tx.commit().unwrap();
    }

    let mut tx = db.begin().unwrap();
    let snapshot = tx.create_snapshot(LockMode::Write, "items", false).unwrap();
    let reused = snapshot.new_page(PageType::Data).unwrap();
    assert_eq!(reused.page_id, 2);
    let fresh = snapshot.new_page(PageType::Data).unwrap();
    assert_eq!(fresh.page_id, 4);
    tx.commit().unwrap();

    let header = db.header().unwrap();
    assert_eq!(header.free_empty_page_list, NO_PAGE);
    assert_eq!(header.last_page_id, 4);
    assert_eq!(db.read_page(2).unwrap().page_type, PageType::Data);
    assert_eq!(db.metrics().pages_recycled, 1);
}

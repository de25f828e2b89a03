
use crate::core::constants::TransactionID;
use crate::core::errors::*;
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Default)]
struct LockState {
    transactions: HashSet<ThreadId>,
    exclusive: bool,
    // lowercase collection name -> owning transaction
    collections: HashMap<String, TransactionID>,
}

/// Coordinates transactions, exclusive database access and per-collection
/// write locks.
///
/// A thread runs at most one transaction at a time. Exclusive access (used by
/// checkpoints) waits until no transaction is running and blocks new ones
/// until released.
pub struct LockService {
    state: Mutex<LockState>,
    changed: Condvar,
    timeout: Duration,
}

impl LockService {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            changed: Condvar::new(),
            timeout,
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, LockState>> {
        self.state
            .lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "locks.state".to_string() })
    }

    /// Registers a transaction for the calling thread.
    pub fn enter_transaction(&self) -> Result<ThreadId> {
        let thread_id = thread::current().id();
        let state = self.lock_state()?;

        if state.transactions.contains(&thread_id) {
            return Err(Error::TransactionAlreadyOpen);
        }

        let (mut state, wait) = self
            .changed
            .wait_timeout_while(state, self.timeout, |s| s.exclusive)
            .map_err(|_| Error::LockPoisoned { lock_name: "locks.state".to_string() })?;
        if wait.timed_out() && state.exclusive {
            return Err(Error::LockTimeout { resource: "transaction".to_string() });
        }

        state.transactions.insert(thread_id);
        Ok(thread_id)
    }

    pub fn exit_transaction(&self, thread_id: ThreadId) {
        let mut state = self.state.lock().recover_poison();
        state.transactions.remove(&thread_id);
        drop(state);
        self.changed.notify_all();
    }

    pub fn active_transactions(&self) -> usize {
        self.state.lock().recover_poison().transactions.len()
    }

    /// Waits for every running transaction to finish, then blocks new ones.
    pub fn enter_exclusive(&self) -> Result<()> {
        let state = self.lock_state()?;
        let (mut state, wait) = self
            .changed
            .wait_timeout_while(state, self.timeout, |s| s.exclusive || !s.transactions.is_empty())
            .map_err(|_| Error::LockPoisoned { lock_name: "locks.state".to_string() })?;
        if wait.timed_out() && (state.exclusive || !state.transactions.is_empty()) {
            return Err(Error::LockTimeout { resource: "database".to_string() });
        }

        state.exclusive = true;
        Ok(())
    }

    pub fn exit_exclusive(&self) {
        self.state.lock().recover_poison().exclusive = false;
        self.changed.notify_all();
    }

    /// Takes the write lock on `collection` for `tx_id`. Re-entrant for the
    /// owning transaction; names compare case-insensitively.
    pub fn enter_collection(&self, collection: &str, tx_id: TransactionID) -> Result<()> {
        let key = collection.to_lowercase();
        let state = self.lock_state()?;

        let (mut state, wait) = self
            .changed
            .wait_timeout_while(state, self.timeout, |s| {
                matches!(s.collections.get(&key), Some(&owner) if owner != tx_id)
            })
            .map_err(|_| Error::LockPoisoned { lock_name: "locks.state".to_string() })?;

        if let Some(&owner) = state.collections.get(&key) {
            if owner != tx_id {
                debug_assert!(wait.timed_out());
                return Err(Error::LockTimeout { resource: format!("collection '{}'", collection) });
            }
            return Ok(());
        }

        state.collections.insert(key, tx_id);
        trace!(collection, tx_id, "collection lock acquired");
        Ok(())
    }

    pub fn exit_collection(&self, collection: &str, tx_id: TransactionID) {
        let key = collection.to_lowercase();
        let mut state = self.state.lock().recover_poison();
        if state.collections.get(&key) == Some(&tx_id) {
            state.collections.remove(&key);
            trace!(collection, tx_id, "collection lock released");
        }
        drop(state);
        self.changed.notify_all();
    }

    pub fn collection_owner(&self, collection: &str) -> Option<TransactionID> {
        self.state
            .lock()
            .recover_poison()
            .collections
            .get(&collection.to_lowercase())
            .copied()
    }
}

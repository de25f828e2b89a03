use crate::core::constants::PageId;
use crate::core::transaction::TransactionState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("cannot {operation} transaction in state {state:?}")]
    InvalidTransactionState {
        operation: String,
        state: TransactionState,
    },

    #[error("aborting due to shutdown")]
    Shutdown,

    #[error("a transaction is already open in this thread")]
    TransactionAlreadyOpen,

    #[error("timed out waiting for lock on {resource}")]
    LockTimeout { resource: String },

    #[error("snapshot for collection '{collection}' was already released")]
    SnapshotDisposed { collection: String },

    #[error("snapshot for collection '{collection}' is read-only")]
    SnapshotReadOnly { collection: String },

    #[error("collection name cannot be empty")]
    CollectionNameEmpty,

    #[error("collection name too long (max 64 characters)")]
    CollectionNameTooLong,

    #[error("collection name must start with letter or underscore")]
    CollectionNameInvalidStart,

    #[error("collection name contains invalid characters (use alphanumeric and underscore only)")]
    CollectionNameInvalidChar,

    #[error("collection name is reserved")]
    CollectionNameReserved,

    #[error("collection '{name}' does not exist")]
    CollectionDoesNotExist { name: String },

    #[error("header page has no room for another collection")]
    HeaderFull,

    #[error("lock poisoned: {lock_name} (another thread panicked while holding this lock)")]
    LockPoisoned { lock_name: String },

    #[error("data corruption: {details}")]
    DataCorruption { details: String },

    #[error("invalid magic number")]
    InvalidMagic,

    #[error("unsupported version")]
    InvalidVersion,

    #[error("page size must be 4096 bytes")]
    InvalidPageSize,

    #[error("invalid page type tag {0}")]
    InvalidPageType(u8),

    #[error("page {page_id} is beyond the end of the data file")]
    PageOutOfRange { page_id: PageId },

    #[error("the header page cannot be {operation} through a snapshot")]
    HeaderPageAccess { operation: String },

    #[error("page {page_id} is already free")]
    PageAlreadyFree { page_id: PageId },

    #[error("page id space exhausted")]
    PageIdsExhausted,

    #[error("WAL file corrupted")]
    WALCorrupted,

    #[error("WAL checksum verification failed")]
    WALChecksumFail,

    #[error("IO error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn invalid_state(operation: &str, state: TransactionState) -> Self {
        Error::InvalidTransactionState {
            operation: operation.to_string(),
            state,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::LockPoisoned {
            lock_name: "unknown".to_string(),
        }
    }
}

// Binary parsing of page and frame headers
impl From<std::array::TryFromSliceError> for Error {
    fn from(_: std::array::TryFromSliceError) -> Self {
        Error::DataCorruption {
            details: "failed to parse binary data".to_string(),
        }
    }
}

/// Recovers the guard of a poisoned lock on paths that must not fail,
/// such as `Drop` and snapshot disposal.
pub trait PoisonedLockExt<T> {
    fn recover_poison(self) -> T;
}

impl<'a, T> PoisonedLockExt<std::sync::MutexGuard<'a, T>> for std::sync::LockResult<std::sync::MutexGuard<'a, T>> {
    fn recover_poison(self) -> std::sync::MutexGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message() {
        let err = Error::invalid_state("commit", TransactionState::Aborted);
        assert_eq!(err.to_string(), "cannot commit transaction in state Aborted");
    }

    #[test]
    fn test_poisoned_mutex_converts() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(0));
        let cloned = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison");
        })
        .join();

        let err: Error = lock.lock().unwrap_err().into();
        assert!(matches!(err, Error::LockPoisoned { .. }));
        assert_eq!(*lock.lock().recover_poison(), 0);
    }
}

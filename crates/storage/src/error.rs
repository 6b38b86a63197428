use backend::BackendError;
use changelog::ChangeLogError;
use keys::KeyError;
use records::RecordError;
use thiserror::Error;
use tiplist::TipListError;

/// Every failure the storage layer reports.
///
/// `Clone` so that one coalesced head flush can hand the same outcome to
/// every writer that waited on it.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// A tail-list put or delete arrived out of sequence.
    #[error(transparent)]
    OrderingViolation(TipListError),

    /// A pending tail list could not be folded into the committed one.
    #[error(transparent)]
    InvalidMerge(TipListError),

    #[error("key too large: {len} bytes (max {max})")]
    KeyTooLarge { len: usize, max: usize },

    /// A stored key did not decode.
    #[error(transparent)]
    Key(KeyError),

    #[error("illegal mutation: change log is a frozen snapshot")]
    IllegalMutation,

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("malformed record: {0}")]
    Record(#[from] RecordError),

    #[error("read batch destroyed")]
    BatchDestroyed,

    /// A pending value was read before its batch flushed.
    #[error("pending value read before flush")]
    Unresolved,

    /// Write through a handle pinned by `snapshot()`.
    #[error("snapshot handles are read-only")]
    ReadOnly,
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<TipListError> for StorageError {
    fn from(e: TipListError) -> Self {
        match e {
            TipListError::OrderingViolation { .. } => StorageError::OrderingViolation(e),
            TipListError::InvalidMerge { .. } => StorageError::InvalidMerge(e),
        }
    }
}

impl From<KeyError> for StorageError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::KeyTooLarge { len, max } => StorageError::KeyTooLarge { len, max },
            KeyError::Malformed(_) => StorageError::Key(e),
        }
    }
}

impl From<ChangeLogError> for StorageError {
    fn from(e: ChangeLogError) -> Self {
        match e {
            ChangeLogError::IllegalMutation => StorageError::IllegalMutation,
        }
    }
}

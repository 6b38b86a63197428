//! # Backend - Ordered Key-Value Collaborator
//!
//! The contract the feed store needs from an ordered key-value engine, and a
//! reference engine that satisfies it.
//!
//! | item              | role                                                  |
//! |-------------------|-------------------------------------------------------|
//! | [`KvRead`]        | point get, batched get, ordered range iteration       |
//! | [`KvStore`]       | atomic [`WriteBatch`], snapshots, suspend/close       |
//! | [`MemoryBackend`] | `BTreeMap` engine with an optional write-ahead log    |
//!
//! Ranges are half-open byte ranges `[start, end)`; `end == None` scans to
//! the end of the keyspace. Iteration is pull-based: an engine cursor only
//! advances when the consumer asks for the next entry.
//!
//! ## Example
//!
//! ```rust
//! use backend::{KeyRange, KvRead, KvStore, MemoryBackend, WriteBatch};
//!
//! let db = MemoryBackend::new();
//! let mut batch = WriteBatch::new();
//! batch.try_put(b"a".to_vec(), b"1".to_vec());
//! batch.try_put(b"b".to_vec(), b"2".to_vec());
//! db.write(batch).unwrap();
//!
//! let keys: Vec<_> = db
//!     .iter(&KeyRange::all(), true)
//!     .unwrap()
//!     .map(|e| e.unwrap().0)
//!     .collect();
//! assert_eq!(keys, vec![b"b".to_vec(), b"a".to_vec()]);
//! ```

pub mod memory;
pub mod wal;

use std::io;
use std::sync::Arc;

use thiserror::Error;

pub use memory::MemoryBackend;

/// Errors surfaced by a backing engine.
///
/// `Clone` so a single failed write can be reported to several waiters.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(Arc<io::Error>),

    /// A log frame failed its checksum or held an unknown op code.
    #[error("corrupt log record")]
    Corrupt,

    #[error("backend is closed")]
    Closed,

    #[error("backend is suspended")]
    Suspended,
}

impl From<io::Error> for BackendError {
    fn from(e: io::Error) -> Self {
        BackendError::Io(Arc::new(e))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A key and its value.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Ordered, lazily advanced stream of entries.
pub type KvIter = Box<dyn Iterator<Item = BackendResult<Entry>> + Send>;

/// Half-open key range `[start, end)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    /// Exclusive upper bound; `None` is unbounded.
    pub end: Option<Vec<u8>>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: Some(end.into()),
        }
    }

    /// Every key at or after `start`.
    pub fn from_start(start: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: None,
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && self.end.as_deref().map_or(true, |end| key < end)
    }

    /// `true` when no key can fall inside the range.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(&self.end, Some(end) if *end <= self.start)
    }
}

/// Read side of the collaborator contract.
pub trait KvRead: Send + Sync {
    /// Point lookup; absence is `Ok(None)`.
    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>>;

    /// Looks up every key against one consistent state.
    ///
    /// The default issues one `get` per key; engines with a cheaper batched
    /// path override it.
    fn get_many(&self, keys: &[Vec<u8>]) -> BackendResult<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Ordered stream over `range`, descending when `reverse` is set.
    fn iter(&self, range: &KeyRange, reverse: bool) -> BackendResult<KvIter>;
}

/// Write and lifecycle side of the collaborator contract.
pub trait KvStore: KvRead {
    /// Applies every op in `batch` atomically.
    fn write(&self, batch: WriteBatch) -> BackendResult<()>;

    /// Isolated read view of the current state. Later writes are invisible
    /// through it.
    fn snapshot(&self) -> BackendResult<Arc<dyn KvRead>>;

    fn suspend(&self) -> BackendResult<()> {
        Ok(())
    }

    fn resume(&self) -> BackendResult<()> {
        Ok(())
    }

    fn close(&self) -> BackendResult<()>;
}

impl<T: KvRead + ?Sized> KvRead for Arc<T> {
    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn get_many(&self, keys: &[Vec<u8>]) -> BackendResult<Vec<Option<Vec<u8>>>> {
        (**self).get_many(keys)
    }

    fn iter(&self, range: &KeyRange, reverse: bool) -> BackendResult<KvIter> {
        (**self).iter(range, reverse)
    }
}

/// One mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    /// Deletes every key in `[start, end)`.
    DeleteRange { start: Vec<u8>, end: Vec<u8> },
}

/// Ordered list of mutations applied in one atomic write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { key, value });
    }

    pub fn try_delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { key });
    }

    pub fn try_delete_range(&mut self, start: Vec<u8>, end: Vec<u8>) {
        self.ops.push(BatchOp::DeleteRange { start, end });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

impl From<Vec<BatchOp>> for WriteBatch {
    fn from(ops: Vec<BatchOp>) -> Self {
        Self { ops }
    }
}

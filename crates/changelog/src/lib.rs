//! # ChangeLog - Pending Mutations with Snapshots
//!
//! An insertion-ordered list of pending changes for one logical partition,
//! read through a lazily built index and merged into backing iteration.
//!
//! ```text
//!   changes:  [put a][put b][del a][range c..f][put d] ...
//!              \__________ indexed __________/ \_ tail _/
//!
//!   index:    b -> 1, a -> 2          (last point change per key)
//!   ranges:   [c, f)                  (evicts indexed keys on fold)
//! ```
//!
//! Appending is O(1) and never touches the index. The index is brought up
//! to date on the first read that needs it. Later entries always win: a
//! point change overwrites the index slot for its key, a range delete
//! evicts every indexed key it covers.
//!
//! ## Snapshots
//!
//! Every array is held in an `Arc`. [`ChangeLog::snapshot`] clones the
//! `Arc`s, so a snapshot costs nothing until the owner mutates again; that
//! first mutation copies through `Arc::make_mut` and the snapshot keeps the
//! old arrays. Reads never copy. A snapshot rejects
//! [`ChangeLog::apply`] with [`ChangeLogError::IllegalMutation`].
//!
//! ## Example
//!
//! ```rust
//! use backend::{KvRead, MemoryBackend};
//! use changelog::ChangeLog;
//!
//! let db = MemoryBackend::new();
//! let mut log = ChangeLog::new();
//! log.put(b"k".to_vec(), b"v".to_vec());
//! let snap = log.snapshot();
//! log.delete(b"k".to_vec());
//!
//! assert_eq!(log.get(b"k", &db).unwrap(), None);
//! assert_eq!(snap.lookup(b"k").value(), Some(&b"v"[..]));
//!
//! log.flush(&db).unwrap();
//! assert_eq!(db.get(b"k").unwrap(), None);
//! ```

mod overlay;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use backend::{BackendResult, KeyRange, KvRead, KvStore, WriteBatch};
use thiserror::Error;
use tracing::debug;

pub use overlay::{OverlayIter, OverlayView};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangeLogError {
    /// `apply` was called on a snapshot.
    #[error("illegal mutation: change log is a frozen snapshot")]
    IllegalMutation,
}

/// One pending mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    /// Deletes every key in `[start, end)`.
    DeleteRange { start: Vec<u8>, end: Vec<u8> },
}

/// What the log knows about one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    Value(&'a [u8]),
    /// Deleted by a point or range delete.
    Deleted,
    /// No pending change; the backing store decides.
    Miss,
}

impl<'a> Lookup<'a> {
    #[must_use]
    pub fn value(&self) -> Option<&'a [u8]> {
        match self {
            Lookup::Value(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RangeDelete {
    start: Vec<u8>,
    end: Vec<u8>,
}

impl RangeDelete {
    fn covers(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && key < self.end.as_slice()
    }
}

/// Pending changes for one partition.
#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    changes: Arc<Vec<Change>>,
    /// Key -> position in `changes` of its latest point change.
    index: Arc<BTreeMap<Vec<u8>, usize>>,
    ranges: Arc<Vec<RangeDelete>>,
    /// Number of leading `changes` folded into `index` and `ranges`.
    indexed: usize,
    frozen: bool,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// `true` for logs produced by [`ChangeLog::snapshot`].
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.frozen
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        Arc::make_mut(&mut self.changes).push(Change::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        Arc::make_mut(&mut self.changes).push(Change::Delete { key });
    }

    pub fn delete_range(&mut self, start: Vec<u8>, end: Vec<u8>) {
        Arc::make_mut(&mut self.changes).push(Change::DeleteRange { start, end });
    }

    /// Appends changes committed elsewhere (an atom flushing into a core).
    pub fn apply(&mut self, changes: &[Change]) -> Result<(), ChangeLogError> {
        if self.frozen {
            return Err(ChangeLogError::IllegalMutation);
        }
        Arc::make_mut(&mut self.changes).extend_from_slice(changes);
        Ok(())
    }

    /// Drops every change at or after position `len`.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.changes.len() {
            return;
        }
        Arc::make_mut(&mut self.changes).truncate(len);
        if len < self.indexed {
            // rebuilt lazily on the next read
            self.index = Arc::default();
            self.ranges = Arc::default();
            self.indexed = 0;
        }
    }

    /// Forgets every change. Live snapshots are unaffected.
    pub fn clear(&mut self) {
        self.changes = Arc::default();
        self.index = Arc::default();
        self.ranges = Arc::default();
        self.indexed = 0;
    }

    /// Folds every unindexed change into the index.
    pub fn index_all(&mut self) {
        if self.indexed == self.changes.len() {
            return;
        }
        let changes = Arc::clone(&self.changes);
        let index = Arc::make_mut(&mut self.index);
        for (pos, change) in changes.iter().enumerate().skip(self.indexed) {
            match change {
                Change::Put { key, .. } | Change::Delete { key } => {
                    index.insert(key.clone(), pos);
                }
                Change::DeleteRange { start, end } => {
                    if start < end {
                        let doomed: Vec<Vec<u8>> = index
                            .range::<[u8], _>((
                                Bound::Included(start.as_slice()),
                                Bound::Excluded(end.as_slice()),
                            ))
                            .map(|(k, _)| k.clone())
                            .collect();
                        for k in doomed {
                            index.remove(&k);
                        }
                    }
                    Arc::make_mut(&mut self.ranges).push(RangeDelete {
                        start: start.clone(),
                        end: end.clone(),
                    });
                }
            }
        }
        self.indexed = changes.len();
    }

    /// A frozen, fully indexed copy sharing this log's arrays.
    pub fn snapshot(&mut self) -> ChangeLog {
        self.index_all();
        ChangeLog {
            changes: Arc::clone(&self.changes),
            index: Arc::clone(&self.index),
            ranges: Arc::clone(&self.ranges),
            indexed: self.indexed,
            frozen: true,
        }
    }

    /// Answers from pending state alone, without indexing.
    ///
    /// Unindexed tail entries are consulted newest first, then the index,
    /// then the recorded range deletes.
    pub fn lookup(&self, key: &[u8]) -> Lookup<'_> {
        for change in self.changes[self.indexed..].iter().rev() {
            match change {
                Change::Put { key: k, value } if k.as_slice() == key => {
                    return Lookup::Value(value)
                }
                Change::Delete { key: k } if k.as_slice() == key => return Lookup::Deleted,
                Change::DeleteRange { start, end }
                    if key >= start.as_slice() && key < end.as_slice() =>
                {
                    return Lookup::Deleted
                }
                _ => {}
            }
        }
        if let Some(&pos) = self.index.get(key) {
            return match &self.changes[pos] {
                Change::Put { value, .. } => Lookup::Value(value),
                _ => Lookup::Deleted,
            };
        }
        if self.ranges.iter().any(|r| r.covers(key)) {
            return Lookup::Deleted;
        }
        Lookup::Miss
    }

    /// Point read through the log, falling back to `backing`.
    pub fn get<B: KvRead + ?Sized>(
        &mut self,
        key: &[u8],
        backing: &B,
    ) -> BackendResult<Option<Vec<u8>>> {
        if self.changes.is_empty() {
            return backing.get(key);
        }
        self.index_all();
        match self.lookup(key) {
            Lookup::Value(v) => Ok(Some(v.to_vec())),
            Lookup::Deleted => Ok(None),
            Lookup::Miss => backing.get(key),
        }
    }

    /// Ordered iteration over `range` with pending changes merged in.
    pub fn iter<B: KvRead + ?Sized>(
        &mut self,
        backing: &B,
        range: &KeyRange,
        reverse: bool,
    ) -> BackendResult<OverlayIter> {
        let base = backing.iter(range, reverse)?;
        self.index_all();
        Ok(OverlayIter::new(self, base, range, reverse))
    }

    /// The changes as one backing write batch, in original order.
    pub fn to_batch(&self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for change in self.changes.iter() {
            match change {
                Change::Put { key, value } => batch.try_put(key.clone(), value.clone()),
                Change::Delete { key } => batch.try_delete(key.clone()),
                Change::DeleteRange { start, end } => {
                    batch.try_delete_range(start.clone(), end.clone())
                }
            }
        }
        batch
    }

    /// Persists every change in one atomic backing write.
    pub fn flush<S: KvStore + ?Sized>(&self, store: &S) -> BackendResult<()> {
        if self.changes.is_empty() {
            return Ok(());
        }
        store.write(self.to_batch())?;
        debug!(changes = self.changes.len(), "change log flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests;

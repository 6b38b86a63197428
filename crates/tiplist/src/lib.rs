//! # TipList
//!
//! A compact stand-in for a map from index to value when writes arrive at the
//! tail of a mostly contiguous sequence (blocks, bitfield pages).
//!
//! The list holds values for `[offset, offset + data.len())` and, after a
//! deletion, remembers a tombstone bound `removed` so that indices in
//! `[len, removed)` are known to be deleted rather than unknown:
//!
//! ```text
//!  offset           len()            end()
//!    |  data ...      |  tombstones    |   unknown ...
//!    v                v                v
//!    [===============][ - - - - - - - ]
//! ```
//!
//! Only tail operations are representable. A write or deletion that would
//! punch a hole in the materialised range fails with
//! [`TipListError::OrderingViolation`].
//!
//! ## Example
//!
//! ```rust
//! use tiplist::{Tip, TipList};
//!
//! let mut tip = TipList::new();
//! tip.put(10, "a").unwrap();
//! tip.put(11, "b").unwrap();
//! tip.delete(11, None).unwrap();
//!
//! assert_eq!(tip.get(10), Tip::Found(&"a"));
//! assert_eq!(tip.get(11), Tip::Deleted);
//! assert_eq!(tip.get(9), Tip::Unknown);
//! ```

use thiserror::Error;

/// Errors raised by out-of-sequence operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TipListError {
    /// A put or delete did not line up with the current tail.
    #[error("ordering violation: {op} at {index} does not extend tail [{offset}, {end})")]
    OrderingViolation {
        op: &'static str,
        index: u64,
        offset: u64,
        end: u64,
    },

    /// The pending list cannot be reconciled with the committed one.
    #[error("invalid merge: pending [{start}, {end}) against committed [{offset}, {committed_end})")]
    InvalidMerge {
        start: u64,
        end: u64,
        offset: u64,
        committed_end: u64,
    },
}

/// Result of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tip<'a, T> {
    /// The index holds a value.
    Found(&'a T),
    /// The index lies in the tombstone range.
    Deleted,
    /// The list knows nothing about the index.
    Unknown,
}

impl<'a, T> Tip<'a, T> {
    /// `true` unless the list knows nothing about the index.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !matches!(self, Tip::Unknown)
    }
}

/// Tail-append sequence with a trailing tombstone range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipList<T> {
    offset: u64,
    /// Exclusive end of the tombstone range starting at the tail. `None`
    /// means no tombstone; an unbounded deletion stores `Some(u64::MAX)`.
    removed: Option<u64>,
    data: Vec<T>,
}

impl<T> Default for TipList<T> {
    fn default() -> Self {
        Self {
            offset: 0,
            removed: None,
            data: Vec::new(),
        }
    }
}

impl<T: Clone> TipList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// First index covered by the list.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// One past the last materialised value.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    /// One past the last index the list knows about (tombstones included).
    #[must_use]
    pub fn end(&self) -> u64 {
        self.removed.unwrap_or_else(|| self.len())
    }

    /// `true` if the list holds neither values nor tombstones.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.removed.is_none()
    }

    fn violation(&self, op: &'static str, index: u64) -> TipListError {
        TipListError::OrderingViolation {
            op,
            index,
            offset: self.offset,
            end: self.end(),
        }
    }

    /// Stores `value` at `index`.
    ///
    /// Legal when `index` is the current tail, or when the list is completely
    /// empty (the first entry fixes `offset`).
    pub fn put(&mut self, index: u64, value: T) -> Result<(), TipListError> {
        if self.is_empty() {
            self.offset = index;
        } else if index != self.len() {
            return Err(self.violation("put", index));
        }
        self.data.push(value);
        if matches!(self.removed, Some(r) if r <= self.len()) {
            self.removed = None;
        }
        Ok(())
    }

    pub fn get(&self, index: u64) -> Tip<'_, T> {
        if index >= self.offset && index < self.len() {
            return Tip::Found(&self.data[(index - self.offset) as usize]);
        }
        if index >= self.len() && index < self.end() {
            return Tip::Deleted;
        }
        Tip::Unknown
    }

    /// Deletes `[start, end)`; `end == None` deletes everything from `start`.
    ///
    /// Entries at or after `start` are dropped and the range is recorded as
    /// tombstones. Deleting a range that ends inside materialised data, or
    /// that starts past the current end, fails.
    pub fn delete(&mut self, start: u64, end: Option<u64>) -> Result<(), TipListError> {
        let end = end.unwrap_or(u64::MAX);
        if start >= end {
            return Ok(());
        }
        if self.is_empty() {
            self.offset = start;
            self.removed = Some(end);
            return Ok(());
        }
        if end < self.len() {
            return Err(self.violation("delete", end));
        }
        if start > self.end() {
            return Err(self.violation("delete", start));
        }

        self.truncate(start);
        self.removed = Some(end.max(self.removed.unwrap_or(0)));
        Ok(())
    }

    /// Drops every value at or after `index`.
    fn truncate(&mut self, index: u64) {
        if index <= self.offset {
            self.data.clear();
            self.offset = index;
        } else if index < self.len() {
            self.data.truncate((index - self.offset) as usize);
        }
    }

    /// Folds a pending list into this committed one.
    ///
    /// Everything the pending list covers, `[pending.offset, pending.end())`,
    /// supersedes what is committed there: overlapping committed values are
    /// popped, pending tombstones applied and pending values appended.
    ///
    /// # Errors
    ///
    /// [`TipListError::InvalidMerge`] if the ranges neither overlap nor
    /// abut, or if the result would leave a gap between committed and
    /// pending values.
    pub fn merge(&mut self, pending: &TipList<T>) -> Result<(), TipListError> {
        if pending.is_empty() {
            return Ok(());
        }
        if self.is_empty() {
            *self = pending.clone();
            return Ok(());
        }

        let start = pending.offset;
        let end = pending.end();
        let invalid = TipListError::InvalidMerge {
            start,
            end,
            offset: self.offset,
            committed_end: self.end(),
        };

        let disjoint = start > self.end() || end < self.offset;
        let tail_survives = self.len() > end;
        let gap_before_data = !pending.data.is_empty() && start > self.len();
        if disjoint || tail_survives || gap_before_data {
            return Err(invalid);
        }

        let removed = self.removed.unwrap_or(0).max(pending.removed.unwrap_or(0));
        self.truncate(start);
        self.data.extend(pending.data.iter().cloned());
        self.removed = if removed > self.len() {
            Some(removed)
        } else {
            None
        };
        Ok(())
    }

    /// Iterates over `(index, value)` pairs in index order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> + '_ {
        (self.offset..).zip(self.data.iter())
    }
}

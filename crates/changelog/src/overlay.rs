//! Merged iteration of pending changes over a backing stream.
//!
//! [`OverlayIter`] walks the backing cursor and the pending point changes in
//! lock-step, in either direction. Range deletes are swept alongside: each
//! becomes *active* once the walk reaches it and retires once the walk has
//! passed it, and a backing entry is dropped while any range is active.
//!
//! ```text
//!   backing:   a     c     e     g
//!   pending:      b=1   c=2   (del e)
//!   ranges:                     [f, h)
//!   output:    a  b=1   c=2
//! ```
//!
//! Pending points never consult the ranges: the index already evicted every
//! point a later range delete covers.

use std::iter::Peekable;
use std::ops::Bound;
use std::sync::Arc;
use std::vec;

use backend::{BackendResult, Entry, KeyRange, KvIter, KvRead};

use crate::{Change, ChangeLog, Lookup, RangeDelete};

type Point = (Vec<u8>, Option<Vec<u8>>);

/// Pull-based merge of a backing stream with pending changes.
///
/// The backing cursor is advanced only when the consumer asks for the next
/// entry. A backing error is yielded once, after which the iterator is
/// finished.
pub struct OverlayIter {
    base: KvIter,
    /// Backing entry waiting to be compared.
    head: Option<Entry>,
    base_done: bool,
    points: Peekable<vec::IntoIter<Point>>,
    /// Sorted in walk order: by start ascending, or by end descending.
    ranges: Vec<RangeDelete>,
    next_range: usize,
    active: Vec<RangeDelete>,
    reverse: bool,
    failed: bool,
}

/// `a` comes strictly before `b` in walk order.
fn before(reverse: bool, a: &[u8], b: &[u8]) -> bool {
    if reverse {
        a > b
    } else {
        a < b
    }
}

enum Step {
    Pending,
    Replace,
    Backing,
    End,
}

impl OverlayIter {
    pub(crate) fn new(log: &ChangeLog, base: KvIter, range: &KeyRange, reverse: bool) -> Self {
        debug_assert_eq!(log.indexed, log.changes.len());

        let (mut points, mut ranges) = if range.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            let upper = match &range.end {
                Some(end) => Bound::Excluded(end.as_slice()),
                None => Bound::Unbounded,
            };
            let points: Vec<Point> = log
                .index
                .range::<[u8], _>((Bound::Included(range.start.as_slice()), upper))
                .map(|(k, &pos)| {
                    let value = match &log.changes[pos] {
                        Change::Put { value, .. } => Some(value.clone()),
                        _ => None,
                    };
                    (k.clone(), value)
                })
                .collect();
            let ranges: Vec<RangeDelete> = log
                .ranges
                .iter()
                .filter(|r| {
                    r.start < r.end
                        && r.end.as_slice() > range.start.as_slice()
                        && range.end.as_ref().map_or(true, |end| r.start < *end)
                })
                .cloned()
                .collect();
            (points, ranges)
        };

        if reverse {
            points.reverse();
            ranges.sort_by(|a, b| b.end.cmp(&a.end).then_with(|| b.start.cmp(&a.start)));
        } else {
            ranges.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.end.cmp(&b.end)));
        }

        Self {
            base,
            head: None,
            base_done: false,
            points: points.into_iter().peekable(),
            ranges,
            next_range: 0,
            active: Vec::new(),
            reverse,
            failed: false,
        }
    }

    /// Sweeps ranges up to `key` and reports whether one covers it.
    ///
    /// Keys arrive in walk order, so a range that stops covering never
    /// covers again.
    fn deleted(&mut self, key: &[u8]) -> bool {
        while let Some(r) = self.ranges.get(self.next_range) {
            let reached = if self.reverse {
                r.end.as_slice() > key
            } else {
                r.start.as_slice() <= key
            };
            if !reached {
                break;
            }
            self.active.push(r.clone());
            self.next_range += 1;
        }
        let reverse = self.reverse;
        self.active.retain(|r| {
            if reverse {
                r.start.as_slice() <= key
            } else {
                r.end.as_slice() > key
            }
        });
        !self.active.is_empty()
    }
}

impl Iterator for OverlayIter {
    type Item = BackendResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            if self.head.is_none() && !self.base_done {
                match self.base.next() {
                    Some(Ok(entry)) => self.head = Some(entry),
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    None => self.base_done = true,
                }
            }

            let reverse = self.reverse;
            let step = match (&self.head, self.points.peek()) {
                (None, None) => Step::End,
                (None, Some(_)) => Step::Pending,
                (Some((bk, _)), Some((pk, _))) if pk == bk => Step::Replace,
                (Some((bk, _)), Some((pk, _))) if before(reverse, pk, bk) => Step::Pending,
                (Some(_), _) => Step::Backing,
            };

            match step {
                Step::End => return None,
                Step::Pending => {
                    if let Some((key, Some(value))) = self.points.next() {
                        return Some(Ok((key, value)));
                    }
                }
                Step::Replace => {
                    self.head = None;
                    if let Some((key, Some(value))) = self.points.next() {
                        return Some(Ok((key, value)));
                    }
                }
                Step::Backing => {
                    if let Some((key, value)) = self.head.take() {
                        if !self.deleted(&key) {
                            return Some(Ok((key, value)));
                        }
                    }
                }
            }
        }
    }
}

/// A frozen change log layered over another reader.
///
/// Views stack: an atom's view sits on a core's view, which sits on a
/// backing snapshot.
pub struct OverlayView {
    log: ChangeLog,
    base: Arc<dyn KvRead>,
}

impl OverlayView {
    pub fn new(mut log: ChangeLog, base: Arc<dyn KvRead>) -> Self {
        log.index_all();
        Self { log, base }
    }

    pub fn log(&self) -> &ChangeLog {
        &self.log
    }

    pub fn base(&self) -> &Arc<dyn KvRead> {
        &self.base
    }
}

impl KvRead for OverlayView {
    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        match self.log.lookup(key) {
            Lookup::Value(v) => Ok(Some(v.to_vec())),
            Lookup::Deleted => Ok(None),
            Lookup::Miss => self.base.get(key),
        }
    }

    /// Answers what it can from the log and sends the rest to the base in
    /// one batch.
    fn get_many(&self, keys: &[Vec<u8>]) -> BackendResult<Vec<Option<Vec<u8>>>> {
        let mut out = Vec::with_capacity(keys.len());
        let mut misses = Vec::new();
        let mut miss_keys = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            match self.log.lookup(key) {
                Lookup::Value(v) => out.push(Some(v.to_vec())),
                Lookup::Deleted => out.push(None),
                Lookup::Miss => {
                    out.push(None);
                    misses.push(i);
                    miss_keys.push(key.clone());
                }
            }
        }
        if !miss_keys.is_empty() {
            let found = self.base.get_many(&miss_keys)?;
            for (i, value) in misses.into_iter().zip(found) {
                out[i] = value;
            }
        }
        Ok(out)
    }

    fn iter(&self, range: &KeyRange, reverse: bool) -> BackendResult<KvIter> {
        let base = self.base.iter(range, reverse)?;
        if self.log.is_empty() {
            return Ok(base);
        }
        Ok(Box::new(OverlayIter::new(&self.log, base, range, reverse)))
    }
}

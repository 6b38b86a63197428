//! Typed range scans over a read view.
//!
//! A scan walks a list of key ranges in order (reversed when scanning
//! backwards), opening each backing cursor only when the previous one is
//! exhausted. Block and tree-node scans use one range per owning partition.

use std::collections::VecDeque;
use std::sync::Arc;

use backend::{KeyRange, KvIter, KvRead};

use crate::error::StorageResult;

/// One stored bitfield page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitfieldPage {
    pub index: u64,
    pub page_type: u64,
    pub data: Vec<u8>,
}

/// Lazy, typed iterator over one or more key ranges.
///
/// Errors are yielded once; the scan is finished afterwards.
pub struct Scan<T> {
    view: Arc<dyn KvRead>,
    ranges: VecDeque<KeyRange>,
    current: Option<KvIter>,
    reverse: bool,
    decode: fn(&[u8], Vec<u8>) -> StorageResult<T>,
    done: bool,
}

impl<T> Scan<T> {
    pub(crate) fn new(
        view: Arc<dyn KvRead>,
        ranges: Vec<KeyRange>,
        reverse: bool,
        decode: fn(&[u8], Vec<u8>) -> StorageResult<T>,
    ) -> Self {
        let mut ranges: VecDeque<KeyRange> = ranges.into();
        if reverse {
            ranges.make_contiguous().reverse();
        }
        Self {
            view,
            ranges,
            current: None,
            reverse,
            decode,
            done: false,
        }
    }
}

impl<T> Iterator for Scan<T> {
    type Item = StorageResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if self.current.is_none() {
                let Some(range) = self.ranges.pop_front() else {
                    self.done = true;
                    break;
                };
                match self.view.iter(&range, self.reverse) {
                    Ok(cursor) => self.current = Some(cursor),
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e.into()));
                    }
                }
            }

            let step = self.current.as_mut().and_then(Iterator::next);
            match step {
                Some(Ok((key, value))) => {
                    let item = (self.decode)(&key, value);
                    if item.is_err() {
                        self.done = true;
                    }
                    return Some(item);
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
                None => self.current = None,
            }
        }
        None
    }
}

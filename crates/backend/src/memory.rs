//! In-memory ordered engine.
//!
//! State is an `Arc<BTreeMap>` swapped under an `RwLock`. Snapshots and
//! cursors clone the `Arc`, so they keep observing the map as it was; the
//! next write pays for the copy (`Arc::make_mut`) only while one of them is
//! still alive.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info};

use crate::wal::{WalReader, WalWriter};
use crate::{
    BackendError, BackendResult, BatchOp, Entry, KeyRange, KvIter, KvRead, KvStore, WriteBatch,
};

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// Reference [`KvStore`] holding everything in a `BTreeMap`.
///
/// Built with [`MemoryBackend::open`] it appends each batch to a
/// write-ahead log first and replays that log on the next open.
pub struct MemoryBackend {
    map: RwLock<Arc<Map>>,
    /// Serializes writers; holds the log when durability is enabled.
    writer: Mutex<Option<WalWriter>>,
    seq: AtomicU64,
    suspended: AtomicBool,
    closed: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_op(map: &mut Map, op: BatchOp) {
    match op {
        BatchOp::Put { key, value } => {
            map.insert(key, value);
        }
        BatchOp::Delete { key } => {
            map.remove(&key);
        }
        BatchOp::DeleteRange { start, end } => {
            if start >= end {
                return;
            }
            let doomed: Vec<Vec<u8>> = map
                .range::<[u8], _>((Bound::Included(&start[..]), Bound::Excluded(&end[..])))
                .map(|(k, _)| k.clone())
                .collect();
            for k in doomed {
                map.remove(&k);
            }
        }
    }
}

impl MemoryBackend {
    /// Volatile engine; everything is lost on drop.
    pub fn new() -> Self {
        Self {
            map: RwLock::new(Arc::new(Map::new())),
            writer: Mutex::new(None),
            seq: AtomicU64::new(0),
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Durable engine backed by the log at `path`.
    ///
    /// An existing log is replayed first; a torn tail frame is ignored.
    pub fn open<P: AsRef<Path>>(path: P, sync: bool) -> BackendResult<Self> {
        let path = path.as_ref();
        let mut map = Map::new();
        let mut last_seq = 0;
        let mut frames = 0usize;

        if path.exists() {
            let mut reader = WalReader::open(path)?;
            reader.replay(|record| {
                frames += 1;
                last_seq = record.seq;
                for op in record.batch.into_ops() {
                    apply_op(&mut map, op);
                }
            })?;
        }
        info!(path = %path.display(), frames, keys = map.len(), "memory backend opened");

        let wal = WalWriter::create(path, sync)?;
        Ok(Self {
            map: RwLock::new(Arc::new(map)),
            writer: Mutex::new(Some(wal)),
            seq: AtomicU64::new(last_seq),
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> BackendResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        Ok(())
    }

    fn current(&self) -> BackendResult<Arc<Map>> {
        self.check_open()?;
        Ok(self
            .map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvRead for MemoryBackend {
    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        Ok(self.current()?.get(key).cloned())
    }

    fn get_many(&self, keys: &[Vec<u8>]) -> BackendResult<Vec<Option<Vec<u8>>>> {
        let map = self.current()?;
        Ok(keys.iter().map(|k| map.get(k).cloned()).collect())
    }

    fn iter(&self, range: &KeyRange, reverse: bool) -> BackendResult<KvIter> {
        Ok(Box::new(RangeCursor::new(self.current()?, range, reverse)))
    }
}

impl KvStore for MemoryBackend {
    fn write(&self, batch: WriteBatch) -> BackendResult<()> {
        self.check_open()?;
        if self.suspended.load(Ordering::Acquire) {
            return Err(BackendError::Suspended);
        }
        if batch.is_empty() {
            return Ok(());
        }

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(wal) = writer.as_mut() {
            wal.append(seq, &batch)?;
        }

        let ops = batch.len();
        let mut guard = self.map.write().unwrap_or_else(PoisonError::into_inner);
        let map = Arc::make_mut(&mut *guard);
        for op in batch.into_ops() {
            apply_op(map, op);
        }
        debug!(seq, ops, keys = map.len(), "batch applied");
        Ok(())
    }

    fn snapshot(&self) -> BackendResult<Arc<dyn KvRead>> {
        Ok(Arc::new(MemorySnapshot {
            map: self.current()?,
        }))
    }

    /// Syncs the log and rejects writes until [`KvStore::resume`].
    fn suspend(&self) -> BackendResult<()> {
        self.check_open()?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(wal) = writer.as_mut() {
            wal.sync_to_disk()?;
        }
        self.suspended.store(true, Ordering::Release);
        debug!("memory backend suspended");
        Ok(())
    }

    fn resume(&self) -> BackendResult<()> {
        self.check_open()?;
        self.suspended.store(false, Ordering::Release);
        debug!("memory backend resumed");
        Ok(())
    }

    /// Idempotent. Later calls other than `close` fail with
    /// [`BackendError::Closed`].
    fn close(&self) -> BackendResult<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut wal) = writer.take() {
            wal.sync_to_disk()?;
        }
        info!("memory backend closed");
        Ok(())
    }
}

/// Frozen view of a [`MemoryBackend`].
struct MemorySnapshot {
    map: Arc<Map>,
}

impl KvRead for MemorySnapshot {
    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn get_many(&self, keys: &[Vec<u8>]) -> BackendResult<Vec<Option<Vec<u8>>>> {
        Ok(keys.iter().map(|k| self.map.get(k).cloned()).collect())
    }

    fn iter(&self, range: &KeyRange, reverse: bool) -> BackendResult<KvIter> {
        Ok(Box::new(RangeCursor::new(self.map.clone(), range, reverse)))
    }
}

/// Lazy cursor over a pinned map.
///
/// Each step re-seeks from the last returned key, so nothing is buffered
/// ahead of the consumer.
struct RangeCursor {
    map: Arc<Map>,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    reverse: bool,
    done: bool,
}

fn borrowed(b: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match b {
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

impl RangeCursor {
    fn new(map: Arc<Map>, range: &KeyRange, reverse: bool) -> Self {
        Self {
            map,
            lower: Bound::Included(range.start.clone()),
            upper: range
                .end
                .clone()
                .map_or(Bound::Unbounded, Bound::Excluded),
            reverse,
            done: range.is_empty(),
        }
    }

    /// `BTreeMap::range` panics on inverted bounds.
    fn exhausted(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l) | Bound::Excluded(l), Bound::Included(u) | Bound::Excluded(u)) => {
                l >= u
            }
            _ => false,
        }
    }
}

impl Iterator for RangeCursor {
    type Item = BackendResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.exhausted() {
            self.done = true;
            return None;
        }
        let found = {
            let mut range = self
                .map
                .range::<[u8], _>((borrowed(&self.lower), borrowed(&self.upper)));
            let hit = if self.reverse {
                range.next_back()
            } else {
                range.next()
            };
            hit.map(|(k, v)| (k.clone(), v.clone()))
        };
        match found {
            Some((key, value)) => {
                if self.reverse {
                    self.upper = Bound::Excluded(key.clone());
                } else {
                    self.lower = Bound::Excluded(key.clone());
                }
                Some(Ok((key, value)))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

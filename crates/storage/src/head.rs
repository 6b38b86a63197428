//! Single-writer scope for store-head mutations.
//!
//! Pointer allocation, alias registration and seed updates all run inside
//! [`HeadLock::exclusive`]. Writers are admitted one at a time; their
//! changes accumulate in a shared [`ChangeLog`] that is persisted on exit.
//!
//! ```text
//!   writer A: [ f ] -- waiters queued, log small --> defer, wait on signal #1
//!   writer B:        [ f ] -- nobody queued -------> flush A+B, resolve #1
//!                                                    A and B see one outcome
//! ```
//!
//! A writer defers only when another writer is already queued, so a deferred
//! log is always picked up and eventually flushed by someone. Every writer
//! returns only after the flush carrying its changes has resolved.

use std::mem;
use std::sync::{Arc, Condvar, Mutex};

use backend::KvStore;
use changelog::ChangeLog;
use records::{Record, StoreHead};
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::lock;

/// Outcome of one flush generation, shared by every writer folded into it.
struct FlushSignal {
    outcome: Mutex<Option<StorageResult<()>>>,
    done: Condvar,
}

impl FlushSignal {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn wait(&self) -> StorageResult<()> {
        let mut outcome = lock(&self.outcome);
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            outcome = self
                .done
                .wait(outcome)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn resolve(&self, result: StorageResult<()>) {
        *lock(&self.outcome) = Some(result);
        self.done.notify_all();
    }
}

struct HeadState {
    locked: bool,
    waiting: usize,
    /// Cached head including unflushed changes; `None` reloads on next entry.
    head: Option<StoreHead>,
    /// Changes deferred by earlier writers.
    pending: ChangeLog,
    signal: Arc<FlushSignal>,
    flushes: u64,
}

pub(crate) struct HeadLock {
    state: Mutex<HeadState>,
    turn: Condvar,
    flush_threshold: usize,
}

impl HeadLock {
    pub(crate) fn new(flush_threshold: usize) -> Self {
        Self {
            state: Mutex::new(HeadState {
                locked: false,
                waiting: 0,
                head: None,
                pending: ChangeLog::new(),
                signal: Arc::new(FlushSignal::new()),
                flushes: 0,
            }),
            turn: Condvar::new(),
            flush_threshold,
        }
    }

    /// Number of backing writes that succeeded so far.
    pub(crate) fn flush_count(&self) -> u64 {
        lock(&self.state).flushes
    }

    /// Writers blocked waiting for their turn.
    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        lock(&self.state).waiting
    }

    /// Runs `f` as the only head writer and persists what it wrote.
    ///
    /// If `f` fails its changes are dropped and the error returned; changes
    /// deferred by earlier writers are still flushed or handed on.
    pub(crate) fn exclusive<T, F>(&self, backend: &dyn KvStore, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut HeadTx<'_>) -> StorageResult<T>,
    {
        let (mut log, cached) = {
            let mut state = lock(&self.state);
            state.waiting += 1;
            while state.locked {
                state = self
                    .turn
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
            state.waiting -= 1;
            state.locked = true;
            (mem::take(&mut state.pending), state.head.clone())
        };

        let base_len = log.len();
        let (value, head) = match run(backend, &mut log, cached.clone(), f) {
            Ok((value, head)) => (Ok(value), Some(head)),
            Err(e) => {
                log.truncate(base_len);
                (Err(e), cached)
            }
        };

        let mut state = lock(&self.state);
        state.head = head;

        if !log.is_empty() && state.waiting > 0 && log.len() < self.flush_threshold {
            debug!(
                changes = log.len(),
                waiting = state.waiting,
                "head flush deferred"
            );
            state.pending = log;
            let signal = Arc::clone(&state.signal);
            state.locked = false;
            drop(state);
            self.turn.notify_one();
            let value = value?;
            signal.wait()?;
            return Ok(value);
        }

        let signal = mem::replace(&mut state.signal, Arc::new(FlushSignal::new()));
        drop(state);

        let flushed = if log.is_empty() {
            Ok(())
        } else {
            log.flush(backend).map_err(StorageError::from)
        };

        let mut state = lock(&self.state);
        match &flushed {
            Ok(()) if !log.is_empty() => state.flushes += 1,
            Ok(()) => {}
            Err(e) => {
                warn!(error = %e, changes = log.len(), "head flush failed");
                state.head = None;
            }
        }
        state.locked = false;
        drop(state);
        self.turn.notify_one();
        signal.resolve(flushed.clone());

        let value = value?;
        flushed?;
        Ok(value)
    }
}

fn run<T, F>(
    backend: &dyn KvStore,
    log: &mut ChangeLog,
    cached: Option<StoreHead>,
    f: F,
) -> StorageResult<(T, StoreHead)>
where
    F: FnOnce(&mut HeadTx<'_>) -> StorageResult<T>,
{
    let (head, dirty) = match cached {
        Some(head) => (head, false),
        None => match log.get(&keys::head(), backend)? {
            Some(bytes) => (StoreHead::decode(&bytes)?, false),
            None => (StoreHead::default(), true),
        },
    };

    let mut tx = HeadTx {
        backend,
        log,
        head,
        dirty,
    };
    let value = f(&mut tx)?;
    if tx.dirty {
        let encoded = tx.head.encode();
        tx.log.put(keys::head(), encoded);
    }
    Ok((value, tx.head))
}

/// Handle passed to a head writer.
///
/// Reads see the backing store through every change queued so far,
/// including those deferred by earlier writers.
pub(crate) struct HeadTx<'a> {
    backend: &'a dyn KvStore,
    log: &'a mut ChangeLog,
    head: StoreHead,
    dirty: bool,
}

impl HeadTx<'_> {
    pub(crate) fn head(&self) -> &StoreHead {
        &self.head
    }

    pub(crate) fn head_mut(&mut self) -> &mut StoreHead {
        self.dirty = true;
        &mut self.head
    }

    pub(crate) fn get(&mut self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.log.get(key, self.backend)?)
    }

    pub(crate) fn get_record<R: Record>(&mut self, key: &[u8]) -> StorageResult<Option<R>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(R::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.log.put(key, value);
    }

    pub(crate) fn put_record<R: Record>(&mut self, key: Vec<u8>, record: &R) {
        self.log.put(key, record.encode());
    }

    /// Hands out the next core pointer and bumps the persisted counter.
    pub(crate) fn allocate_core_pointer(&mut self) -> u64 {
        let head = self.head_mut();
        let pointer = head.allocated.cores;
        head.allocated.cores += 1;
        debug!(pointer, "core pointer allocated");
        pointer
    }

    /// Hands out the next data pointer and bumps the persisted counter.
    pub(crate) fn allocate_data_pointer(&mut self) -> u64 {
        let head = self.head_mut();
        let pointer = head.allocated.datas;
        head.allocated.datas += 1;
        debug!(pointer, "data pointer allocated");
        pointer
    }
}

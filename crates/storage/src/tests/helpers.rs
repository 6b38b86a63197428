use crate::*;
use backend::{
    BackendError, BackendResult, KeyRange, KvIter, KvRead, KvStore, MemoryBackend, WriteBatch,
};
use config::StoreConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub fn dk(n: u8) -> [u8; 32] {
    [n; 32]
}

pub fn open_memory() -> Store {
    Store::open(Arc::new(MemoryBackend::new()), StoreConfig::default()).unwrap()
}

pub fn create(store: &Store, n: u8) -> CoreStorage {
    store
        .create_core(CreateCore::new([n.wrapping_add(100); 32], dk(n)))
        .unwrap()
}

pub fn write_blocks(core: &CoreStorage, blocks: &[(u64, &str)]) {
    let mut w = core.write();
    for (index, data) in blocks {
        w.put_block(*index, data.as_bytes().to_vec());
    }
    w.flush().unwrap();
}

pub fn read_block(core: &CoreStorage, index: u64) -> Option<Vec<u8>> {
    let mut r = core.read().unwrap();
    let block = r.get_block(index);
    r.flush().unwrap();
    block.get().unwrap()
}

type WriteHook = Box<dyn FnOnce() + Send>;

/// Memory engine whose reads and writes can be made to fail on demand.
#[derive(Default)]
pub struct FlakyBackend {
    pub inner: MemoryBackend,
    pub fail_writes: AtomicBool,
    /// Shared with every snapshot taken so far.
    pub fail_reads: Arc<AtomicBool>,
    /// Runs inside the next `write`, before it succeeds or fails.
    on_write: Mutex<Option<WriteHook>>,
}

impl FlakyBackend {
    pub fn before_next_write(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_write.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_read(&self) -> BackendResult<()> {
        check(&self.fail_reads)
    }
}

fn check(flag: &AtomicBool) -> BackendResult<()> {
    if flag.load(Ordering::SeqCst) {
        return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected read failure").into());
    }
    Ok(())
}

impl KvRead for FlakyBackend {
    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        self.check_read()?;
        self.inner.get(key)
    }

    fn get_many(&self, keys: &[Vec<u8>]) -> BackendResult<Vec<Option<Vec<u8>>>> {
        self.check_read()?;
        self.inner.get_many(keys)
    }

    fn iter(&self, range: &KeyRange, reverse: bool) -> BackendResult<KvIter> {
        self.check_read()?;
        self.inner.iter(range, reverse)
    }
}

impl KvStore for FlakyBackend {
    fn write(&self, batch: WriteBatch) -> BackendResult<()> {
        let hook = self.on_write.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Suspended);
        }
        self.inner.write(batch)
    }

    /// Snapshots stay flaky so read failures reach batches built on them.
    fn snapshot(&self) -> BackendResult<Arc<dyn KvRead>> {
        Ok(Arc::new(FlakySnapshot {
            inner: self.inner.snapshot()?,
            fail_reads: Arc::clone(&self.fail_reads),
        }))
    }

    fn close(&self) -> BackendResult<()> {
        self.inner.close()
    }
}

struct FlakySnapshot {
    inner: Arc<dyn KvRead>,
    fail_reads: Arc<AtomicBool>,
}

impl KvRead for FlakySnapshot {
    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        check(&self.fail_reads)?;
        self.inner.get(key)
    }

    fn get_many(&self, keys: &[Vec<u8>]) -> BackendResult<Vec<Option<Vec<u8>>>> {
        check(&self.fail_reads)?;
        self.inner.get_many(keys)
    }

    fn iter(&self, range: &KeyRange, reverse: bool) -> BackendResult<KvIter> {
        check(&self.fail_reads)?;
        self.inner.iter(range, reverse)
    }
}

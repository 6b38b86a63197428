//! Batched typed reads against one core.
//!
//! A [`CoreReadBatch`] captures the layered read view when it is built.
//! Every `get_*` call only queues a key and returns a [`Pending`]; the next
//! [`CoreReadBatch::flush`] resolves the whole queue with one backing
//! multi-get.
//!
//! ```rust,ignore
//! let mut batch = core.read()?;
//! let head = batch.get_head();
//! let block = batch.get_block(7);
//! batch.flush()?;
//! let (head, block) = (head.get()?, block.get()?);
//! ```

use std::sync::{Arc, OnceLock};

use backend::KvRead;
use records::{CoreAuth, CoreHead, Dependency, Hints, Record, Sessions, TreeNode};

use crate::core_storage::resolve_data_pointer;
use crate::error::{StorageError, StorageResult};

type Slot = Arc<OnceLock<StorageResult<Option<Vec<u8>>>>>;

fn raw(bytes: &[u8]) -> StorageResult<Vec<u8>> {
    Ok(bytes.to_vec())
}

fn decode_record<R: Record>(bytes: &[u8]) -> StorageResult<R> {
    Ok(R::decode(bytes)?)
}

enum Source<T> {
    Queued {
        slot: Slot,
        decode: fn(&[u8]) -> StorageResult<T>,
    },
    Ready(StorageResult<Option<T>>),
}

/// A value resolved by the flush of the batch that produced it.
pub struct Pending<T> {
    source: Source<T>,
}

impl<T: Clone> Pending<T> {
    fn queued(slot: Slot, decode: fn(&[u8]) -> StorageResult<T>) -> Self {
        Self {
            source: Source::Queued { slot, decode },
        }
    }

    /// An already known answer.
    pub(crate) fn ready(value: Option<T>) -> Self {
        Self {
            source: Source::Ready(Ok(value)),
        }
    }

    fn failed(error: StorageError) -> Self {
        Self {
            source: Source::Ready(Err(error)),
        }
    }

    /// `true` once a value or an error is available.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        match &self.source {
            Source::Queued { slot, .. } => slot.get().is_some(),
            Source::Ready(_) => true,
        }
    }

    /// The resolved value; `Ok(None)` when the key is absent.
    ///
    /// # Errors
    ///
    /// [`StorageError::Unresolved`] before the batch flushed, otherwise the
    /// flush error or a decode error.
    pub fn get(&self) -> StorageResult<Option<T>> {
        match &self.source {
            Source::Ready(result) => result.clone(),
            Source::Queued { slot, decode } => match slot.get() {
                None => Err(StorageError::Unresolved),
                Some(Err(e)) => Err(e.clone()),
                Some(Ok(None)) => Ok(None),
                Some(Ok(Some(bytes))) => decode(bytes).map(Some),
            },
        }
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.source {
            Source::Queued { slot, .. } if slot.get().is_none() => "queued",
            _ => "resolved",
        };
        f.debug_struct("Pending").field("state", &state).finish()
    }
}

/// Typed reads of one core, resolved together.
pub struct CoreReadBatch {
    view: Option<Arc<dyn KvRead>>,
    data_pointer: u64,
    root_data_pointer: u64,
    dependencies: Arc<[Dependency]>,
    queue: Vec<(Vec<u8>, Slot)>,
}

impl CoreReadBatch {
    pub(crate) fn new(
        view: Arc<dyn KvRead>,
        data_pointer: u64,
        root_data_pointer: u64,
        dependencies: Arc<[Dependency]>,
    ) -> Self {
        Self {
            view: Some(view),
            data_pointer,
            root_data_pointer,
            dependencies,
            queue: Vec::new(),
        }
    }

    /// Number of gets waiting for the next flush.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn enqueue<T: Clone>(
        &mut self,
        key: Vec<u8>,
        decode: fn(&[u8]) -> StorageResult<T>,
    ) -> Pending<T> {
        if self.view.is_none() {
            return Pending::failed(StorageError::BatchDestroyed);
        }
        let slot = Slot::default();
        self.queue.push((key, Arc::clone(&slot)));
        Pending::queued(slot, decode)
    }

    fn owner(&self, index: u64) -> u64 {
        resolve_data_pointer(&self.dependencies, self.data_pointer, index)
    }

    /// Block `index`, read from whichever partition owns it.
    pub fn get_block(&mut self, index: u64) -> Pending<Vec<u8>> {
        let key = keys::block(self.owner(index), index);
        self.enqueue(key, raw)
    }

    /// Tree node `index`, resolved through dependencies like blocks.
    pub fn get_tree_node(&mut self, index: u64) -> Pending<TreeNode> {
        let key = keys::tree_node(self.owner(index), index);
        self.enqueue(key, decode_record::<TreeNode>)
    }

    pub fn get_bitfield_page(&mut self, index: u64, page_type: u64) -> Pending<Vec<u8>> {
        let key = keys::bitfield(self.data_pointer, index, page_type);
        self.enqueue(key, raw)
    }

    pub fn get_user_data(&mut self, key: &str) -> Pending<Vec<u8>> {
        let key = keys::user_data(self.data_pointer, key);
        self.enqueue(key, raw)
    }

    /// # Errors
    ///
    /// [`StorageError::KeyTooLarge`] for keys over 2048 bytes.
    pub fn get_local(&mut self, key: &[u8]) -> StorageResult<Pending<Vec<u8>>> {
        let key = keys::local(self.data_pointer, key)?;
        Ok(self.enqueue(key, raw))
    }

    pub fn get_auth(&mut self) -> Pending<CoreAuth> {
        let key = keys::data_auth(self.data_pointer);
        self.enqueue(key, decode_record::<CoreAuth>)
    }

    pub fn get_head(&mut self) -> Pending<CoreHead> {
        let key = keys::data_head(self.data_pointer);
        self.enqueue(key, decode_record::<CoreHead>)
    }

    pub fn get_dependency(&mut self) -> Pending<Dependency> {
        let key = keys::data_dependency(self.data_pointer);
        self.enqueue(key, decode_record::<Dependency>)
    }

    pub fn get_hints(&mut self) -> Pending<Hints> {
        let key = keys::data_hints(self.data_pointer);
        self.enqueue(key, decode_record::<Hints>)
    }

    /// The session list, kept under the core's original data pointer.
    pub fn get_sessions(&mut self) -> Pending<Sessions> {
        let key = keys::data_sessions(self.root_data_pointer);
        self.enqueue(key, decode_record::<Sessions>)
    }

    /// Resolves every queued get with one backing multi-get.
    ///
    /// On failure every queued [`Pending`] carries the same error.
    pub fn flush(&mut self) -> StorageResult<()> {
        let Some(view) = self.view.as_ref() else {
            return Err(StorageError::BatchDestroyed);
        };
        if self.queue.is_empty() {
            return Ok(());
        }
        let queue = std::mem::take(&mut self.queue);
        let keys: Vec<Vec<u8>> = queue.iter().map(|(k, _)| k.clone()).collect();
        match view.get_many(&keys) {
            Ok(values) => {
                for ((_, slot), value) in queue.into_iter().zip(values) {
                    let _ = slot.set(Ok(value));
                }
                Ok(())
            }
            Err(e) => {
                let error = StorageError::from(e);
                for (_, slot) in queue {
                    let _ = slot.set(Err(error.clone()));
                }
                Err(error)
            }
        }
    }

    /// Releases the read view. Idempotent.
    ///
    /// Gets still queued resolve to [`StorageError::BatchDestroyed`], as do
    /// later gets and flushes.
    pub fn destroy(&mut self) {
        if self.view.take().is_none() {
            return;
        }
        for (_, slot) in self.queue.drain(..) {
            let _ = slot.set(Err(StorageError::BatchDestroyed));
        }
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.view.is_none()
    }
}

impl std::fmt::Debug for CoreReadBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreReadBatch")
            .field("data_pointer", &self.data_pointer)
            .field("dependencies", &self.dependencies.len())
            .field("queued", &self.queue.len())
            .field("destroyed", &self.view.is_none())
            .finish()
    }
}

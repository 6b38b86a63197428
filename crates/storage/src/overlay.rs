//! In-memory staging layer for one core.
//!
//! A [`MemoryOverlay`] keeps writes off the backing store entirely. Writes
//! collect in a *pending* state that [`OverlayWriteBatch::flush`] merges into
//! the *committed* state; reads answer from the committed state and fall
//! back to the core's own storage for anything it does not know.
//!
//! | data                     | held in                       |
//! |--------------------------|-------------------------------|
//! | blocks                   | `TipList`                     |
//! | bitfield pages           | one `TipList` per page type   |
//! | tree nodes, user data    | ordered maps with tombstones  |
//! | head, auth, hints, dep.  | typed slots                   |
//!
//! Blocks and pages follow tail-list rules: writes must extend the tail, and
//! a flush whose pending range cannot be reconciled with the committed one
//! fails with [`crate::StorageError::InvalidMerge`], leaving the committed state
//! untouched.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use records::{CoreAuth, CoreHead, Dependency, Hints, TreeNode};
use tiplist::{Tip, TipList};
use tracing::debug;

use crate::core_storage::CoreStorage;
use crate::error::StorageResult;
use crate::read::{CoreReadBatch, Pending};

/// A single optional record.
#[derive(Debug, Clone, Default)]
enum Slot<T> {
    /// Unknown here; ask the core.
    #[default]
    Unset,
    Deleted,
    Value(T),
}

impl<T: Clone> Slot<T> {
    fn merge(&mut self, pending: &Slot<T>) {
        if !matches!(pending, Slot::Unset) {
            *self = pending.clone();
        }
    }
}

#[derive(Debug, Clone, Default)]
struct OverlayState {
    head: Slot<CoreHead>,
    auth: Slot<CoreAuth>,
    hints: Slot<Hints>,
    dependency: Slot<Dependency>,
    blocks: TipList<Vec<u8>>,
    bitfields: BTreeMap<u64, TipList<Vec<u8>>>,
    tree_nodes: BTreeMap<u64, Option<TreeNode>>,
    user_data: BTreeMap<String, Option<Vec<u8>>>,
}

impl OverlayState {
    /// Folds `pending` into `self`. On error `self` is partially updated;
    /// callers merge into a copy.
    fn merge(&mut self, pending: &OverlayState) -> StorageResult<()> {
        self.blocks.merge(&pending.blocks)?;
        for (page_type, pages) in &pending.bitfields {
            self.bitfields.entry(*page_type).or_default().merge(pages)?;
        }
        self.tree_nodes
            .extend(pending.tree_nodes.iter().map(|(k, v)| (*k, v.clone())));
        self.user_data
            .extend(pending.user_data.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.head.merge(&pending.head);
        self.auth.merge(&pending.auth);
        self.hints.merge(&pending.hints);
        self.dependency.merge(&pending.dependency);
        Ok(())
    }
}

struct OverlayInner {
    core: CoreStorage,
    committed: RwLock<Arc<OverlayState>>,
}

/// In-memory staging for one core. Cheap to clone.
#[derive(Clone)]
pub struct MemoryOverlay {
    inner: Arc<OverlayInner>,
}

impl MemoryOverlay {
    /// An empty overlay falling back to `core`.
    pub fn new(core: CoreStorage) -> Self {
        Self {
            inner: Arc::new(OverlayInner {
                core,
                committed: RwLock::new(Arc::new(OverlayState::default())),
            }),
        }
    }

    #[must_use]
    pub fn core(&self) -> &CoreStorage {
        &self.inner.core
    }

    fn committed(&self) -> Arc<OverlayState> {
        Arc::clone(
            &self
                .inner
                .committed
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Tail of the committed block list.
    #[must_use]
    pub fn block_tail(&self) -> u64 {
        self.committed().blocks.end()
    }

    /// A read batch over the committed state, falling back to the core.
    pub fn read(&self) -> StorageResult<OverlayReadBatch> {
        Ok(OverlayReadBatch {
            state: self.committed(),
            fallback: self.inner.core.read()?,
        })
    }

    pub fn write(&self) -> OverlayWriteBatch {
        OverlayWriteBatch {
            overlay: self.clone(),
            pending: OverlayState::default(),
        }
    }
}

impl std::fmt::Debug for MemoryOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.committed();
        f.debug_struct("MemoryOverlay")
            .field("data_pointer", &self.inner.core.pointers().data_pointer)
            .field("blocks", &(state.blocks.offset()..state.blocks.end()))
            .field("tree_nodes", &state.tree_nodes.len())
            .finish()
    }
}

/// Reads answered from the overlay first.
pub struct OverlayReadBatch {
    state: Arc<OverlayState>,
    fallback: CoreReadBatch,
}

fn from_slot<T: Clone>(slot: &Slot<T>) -> Option<Pending<T>> {
    match slot {
        Slot::Unset => None,
        Slot::Deleted => Some(Pending::ready(None)),
        Slot::Value(v) => Some(Pending::ready(Some(v.clone()))),
    }
}

fn from_tip(tip: Tip<'_, Vec<u8>>) -> Option<Pending<Vec<u8>>> {
    match tip {
        Tip::Found(v) => Some(Pending::ready(Some(v.clone()))),
        Tip::Deleted => Some(Pending::ready(None)),
        Tip::Unknown => None,
    }
}

impl OverlayReadBatch {
    pub fn get_block(&mut self, index: u64) -> Pending<Vec<u8>> {
        match from_tip(self.state.blocks.get(index)) {
            Some(p) => p,
            None => self.fallback.get_block(index),
        }
    }

    pub fn get_tree_node(&mut self, index: u64) -> Pending<TreeNode> {
        match self.state.tree_nodes.get(&index) {
            Some(node) => Pending::ready(node.clone()),
            None => self.fallback.get_tree_node(index),
        }
    }

    pub fn get_bitfield_page(&mut self, index: u64, page_type: u64) -> Pending<Vec<u8>> {
        let known = self
            .state
            .bitfields
            .get(&page_type)
            .and_then(|pages| from_tip(pages.get(index)));
        match known {
            Some(p) => p,
            None => self.fallback.get_bitfield_page(index, page_type),
        }
    }

    pub fn get_user_data(&mut self, key: &str) -> Pending<Vec<u8>> {
        match self.state.user_data.get(key) {
            Some(value) => Pending::ready(value.clone()),
            None => self.fallback.get_user_data(key),
        }
    }

    pub fn get_head(&mut self) -> Pending<CoreHead> {
        from_slot(&self.state.head).unwrap_or_else(|| self.fallback.get_head())
    }

    pub fn get_auth(&mut self) -> Pending<CoreAuth> {
        from_slot(&self.state.auth).unwrap_or_else(|| self.fallback.get_auth())
    }

    pub fn get_hints(&mut self) -> Pending<Hints> {
        from_slot(&self.state.hints).unwrap_or_else(|| self.fallback.get_hints())
    }

    pub fn get_dependency(&mut self) -> Pending<Dependency> {
        from_slot(&self.state.dependency).unwrap_or_else(|| self.fallback.get_dependency())
    }

    /// Resolves the gets that fell through to the core.
    pub fn flush(&mut self) -> StorageResult<()> {
        self.fallback.flush()
    }

    pub fn destroy(&mut self) {
        self.fallback.destroy();
    }
}

/// Writes staged into a [`MemoryOverlay`].
pub struct OverlayWriteBatch {
    overlay: MemoryOverlay,
    pending: OverlayState,
}

impl OverlayWriteBatch {
    /// # Errors
    ///
    /// [`crate::StorageError::OrderingViolation`] unless `index` extends the tail
    /// of this batch's blocks.
    pub fn put_block(&mut self, index: u64, data: Vec<u8>) -> StorageResult<()> {
        Ok(self.pending.blocks.put(index, data)?)
    }

    /// Deletes blocks `[start, end)`; `None` deletes through the tail.
    pub fn delete_block_range(&mut self, start: u64, end: Option<u64>) -> StorageResult<()> {
        Ok(self.pending.blocks.delete(start, end)?)
    }

    pub fn put_bitfield_page(
        &mut self,
        index: u64,
        page_type: u64,
        page: Vec<u8>,
    ) -> StorageResult<()> {
        let pages = self.pending.bitfields.entry(page_type).or_default();
        Ok(pages.put(index, page)?)
    }

    pub fn delete_bitfield_page_range(
        &mut self,
        page_type: u64,
        start: u64,
        end: Option<u64>,
    ) -> StorageResult<()> {
        let pages = self.pending.bitfields.entry(page_type).or_default();
        Ok(pages.delete(start, end)?)
    }

    pub fn put_tree_node(&mut self, node: TreeNode) {
        self.pending.tree_nodes.insert(node.index, Some(node));
    }

    pub fn delete_tree_node(&mut self, index: u64) {
        self.pending.tree_nodes.insert(index, None);
    }

    pub fn put_user_data(&mut self, key: &str, value: Vec<u8>) {
        self.pending.user_data.insert(key.to_string(), Some(value));
    }

    pub fn delete_user_data(&mut self, key: &str) {
        self.pending.user_data.insert(key.to_string(), None);
    }

    pub fn set_head(&mut self, head: CoreHead) {
        self.pending.head = Slot::Value(head);
    }

    pub fn delete_head(&mut self) {
        self.pending.head = Slot::Deleted;
    }

    pub fn set_auth(&mut self, auth: CoreAuth) {
        self.pending.auth = Slot::Value(auth);
    }

    pub fn set_hints(&mut self, hints: Hints) {
        self.pending.hints = Slot::Value(hints);
    }

    pub fn set_dependency(&mut self, dependency: Dependency) {
        self.pending.dependency = Slot::Value(dependency);
    }

    /// Merges the staged writes into the overlay's committed state.
    ///
    /// # Errors
    ///
    /// [`crate::StorageError::InvalidMerge`] if a staged tail list does not line up
    /// with the committed one; nothing is applied in that case.
    pub fn flush(self) -> StorageResult<()> {
        let inner = &self.overlay.inner;
        let mut committed = inner
            .committed
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = OverlayState::clone(&committed);
        next.merge(&self.pending)?;
        debug!(
            blocks = next.blocks.end(),
            tree_nodes = next.tree_nodes.len(),
            "memory overlay flushed"
        );
        *committed = Arc::new(next);
        Ok(())
    }
}

impl std::fmt::Debug for OverlayWriteBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayWriteBatch")
            .field("blocks", &self.pending.blocks.len())
            .field("tree_nodes", &self.pending.tree_nodes.len())
            .finish()
    }
}

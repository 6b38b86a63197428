//! Typed writes against one core.
//!
//! Mutations are encoded into keys immediately and buffered in a private
//! [`ChangeLog`]. [`CoreWriteBatch::flush`] either hands them to the bound
//! atom or persists them as one backing write batch.

use changelog::ChangeLog;
use records::{CoreAuth, CoreHead, Dependency, Hints, Record, TreeNode};
use tracing::debug;

use crate::core_storage::CoreStorage;
use crate::error::{StorageError, StorageResult};
use crate::lock;

pub struct CoreWriteBatch {
    core: CoreStorage,
    log: ChangeLog,
    dependencies_changed: bool,
}

impl CoreWriteBatch {
    pub(crate) fn new(core: CoreStorage) -> Self {
        Self {
            core,
            log: ChangeLog::new(),
            dependencies_changed: false,
        }
    }

    fn pointer(&self) -> u64 {
        self.core.shared.data_pointer
    }

    /// Number of buffered changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    // -- blocks ---------------------------------------------------------

    pub fn put_block(&mut self, index: u64, data: Vec<u8>) {
        self.log.put(keys::block(self.pointer(), index), data);
    }

    pub fn delete_block(&mut self, index: u64) {
        self.log.delete(keys::block(self.pointer(), index));
    }

    /// Deletes blocks `[start, end)`; `None` deletes through the tail.
    pub fn delete_block_range(&mut self, start: u64, end: Option<u64>) {
        let ptr = self.pointer();
        self.log
            .delete_range(keys::block(ptr, start), keys::block_end(ptr, end));
    }

    // -- tree nodes -----------------------------------------------------

    pub fn put_tree_node(&mut self, node: &TreeNode) {
        self.log
            .put(keys::tree_node(self.pointer(), node.index), node.encode());
    }

    pub fn delete_tree_node(&mut self, index: u64) {
        self.log.delete(keys::tree_node(self.pointer(), index));
    }

    pub fn delete_tree_node_range(&mut self, start: u64, end: Option<u64>) {
        let ptr = self.pointer();
        self.log
            .delete_range(keys::tree_node(ptr, start), keys::tree_node_end(ptr, end));
    }

    // -- bitfield pages -------------------------------------------------

    pub fn put_bitfield_page(&mut self, index: u64, page_type: u64, page: Vec<u8>) {
        self.log
            .put(keys::bitfield(self.pointer(), index, page_type), page);
    }

    pub fn delete_bitfield_page(&mut self, index: u64, page_type: u64) {
        self.log
            .delete(keys::bitfield(self.pointer(), index, page_type));
    }

    /// Deletes every page, of any type, with index in `[start, end)`.
    pub fn delete_bitfield_page_range(&mut self, start: u64, end: Option<u64>) {
        let ptr = self.pointer();
        self.log
            .delete_range(keys::bitfield(ptr, start, 0), keys::bitfield_end(ptr, end));
    }

    // -- user data and local keys ----------------------------------------

    pub fn put_user_data(&mut self, key: &str, value: Vec<u8>) {
        self.log.put(keys::user_data(self.pointer(), key), value);
    }

    pub fn delete_user_data(&mut self, key: &str) {
        self.log.delete(keys::user_data(self.pointer(), key));
    }

    /// # Errors
    ///
    /// [`StorageError::KeyTooLarge`] for keys over 2048 bytes.
    pub fn put_local(&mut self, key: &[u8], value: Vec<u8>) -> StorageResult<()> {
        let key = keys::local(self.pointer(), key)?;
        self.log.put(key, value);
        Ok(())
    }

    pub fn delete_local(&mut self, key: &[u8]) -> StorageResult<()> {
        let key = keys::local(self.pointer(), key)?;
        self.log.delete(key);
        Ok(())
    }

    /// Deletes every local key beginning with `prefix`.
    pub fn delete_local_prefix(&mut self, prefix: &[u8]) -> StorageResult<()> {
        let ptr = self.pointer();
        let start = keys::local_start(ptr, prefix)?;
        let end = keys::local_end(ptr, prefix)?;
        self.log.delete_range(start, end);
        Ok(())
    }

    // -- per-core records -----------------------------------------------

    pub fn set_auth(&mut self, auth: &CoreAuth) {
        self.log.put(keys::data_auth(self.pointer()), auth.encode());
    }

    pub fn set_head(&mut self, head: &CoreHead) {
        self.log.put(keys::data_head(self.pointer()), head.encode());
    }

    pub fn delete_head(&mut self) {
        self.log.delete(keys::data_head(self.pointer()));
    }

    /// Records the partition that owns indices below `dependency.length`.
    ///
    /// Once flushed, every handle on the store resolves through it,
    /// including handles already open.
    pub fn set_dependency(&mut self, dependency: &Dependency) {
        self.dependencies_changed = true;
        self.log
            .put(keys::data_dependency(self.pointer()), dependency.encode());
    }

    pub fn delete_dependency(&mut self) {
        self.dependencies_changed = true;
        self.log.delete(keys::data_dependency(self.pointer()));
    }

    pub fn set_hints(&mut self, hints: &Hints) {
        self.log.put(keys::data_hints(self.pointer()), hints.encode());
    }

    /// Commits the buffered changes.
    ///
    /// Bound to an atom, the changes join the atom's log and become durable
    /// with [`crate::Atom::flush`]. Otherwise they are written at once in a
    /// single backing write.
    ///
    /// # Errors
    ///
    /// [`StorageError::ReadOnly`] on a snapshot handle; backing errors are
    /// propagated unchanged.
    pub fn flush(self) -> StorageResult<()> {
        if self.core.pinned.is_some() {
            return Err(StorageError::ReadOnly);
        }
        if self.log.is_empty() {
            return Ok(());
        }
        if let Some(atom) = &self.core.atom {
            return atom.append(self.log.changes(), self.dependencies_changed);
        }

        let store = &self.core.store;
        let _commit = lock(&store.inner.commit);
        self.log.flush(&*store.inner.backend)?;
        debug!(
            data_pointer = self.pointer(),
            changes = self.log.len(),
            "core write batch flushed"
        );
        if self.dependencies_changed {
            store.refresh_dependencies()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CoreWriteBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreWriteBatch")
            .field("data_pointer", &self.pointer())
            .field("changes", &self.log.len())
            .field("atomic", &self.core.atom.is_some())
            .finish()
    }
}

//! Per-core handles.
//!
//! A core owns a data partition and may depend on older partitions for its
//! low indices (after a fork or a session split). Dependencies are kept
//! ascending by `length`:
//!
//! ```text
//!   deps: [{ptr 7, len 10}, {ptr 4, len 20}]     own ptr 9
//!
//!   index:  0 ........ 9 | 10 ....... 19 | 20 ...
//!   owner:  ptr 7        | ptr 4         | ptr 9
//! ```
//!
//! Every handle on the same partition shares one [`CoreShared`]. Its
//! dependency list is reloaded whenever a flush rewrites a dependency record,
//! so live handles and handles opened later agree on it.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use backend::{KeyRange, KvRead};
use changelog::OverlayView;
use records::{Dependency, Record, Sessions};
use tracing::{debug, info};

use crate::atom::Atom;
use crate::error::{StorageError, StorageResult};
use crate::read::CoreReadBatch;
use crate::scan::{BitfieldPage, Scan};
use crate::write::CoreWriteBatch;
use crate::{lock, Store};

/// Partition that stores `index`: the first dependency (ascending by
/// length) whose length exceeds it, else the core's own partition.
pub(crate) fn resolve_data_pointer(deps: &[Dependency], own: u64, index: u64) -> u64 {
    deps.iter()
        .find(|d| d.length > index)
        .map_or(own, |d| d.data_pointer)
}

/// Follows `data_dependency` links from `data_pointer`, nearest first.
///
/// Each ancestor's length is clamped to the length of the link that led to
/// it. The result is ascending by length.
pub(crate) fn load_dependencies<V: KvRead + ?Sized>(
    view: &V,
    data_pointer: u64,
) -> StorageResult<Vec<Dependency>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::from([data_pointer]);
    let mut cursor = data_pointer;
    let mut limit = u64::MAX;

    while let Some(bytes) = view.get(&keys::data_dependency(cursor))? {
        let dep = Dependency::decode(&bytes)?;
        if !seen.insert(dep.data_pointer) {
            return Err(records::RecordError::Invalid("dependency cycle").into());
        }
        limit = limit.min(dep.length);
        chain.push(Dependency {
            data_pointer: dep.data_pointer,
            length: limit,
        });
        cursor = dep.data_pointer;
    }
    chain.reverse();
    Ok(chain)
}

/// State shared by every handle on one data partition.
pub(crate) struct CoreShared {
    pub(crate) discovery_key: [u8; 32],
    pub(crate) core_pointer: u64,
    /// Partition of the core record; holds the session list.
    pub(crate) root_data_pointer: u64,
    pub(crate) data_pointer: u64,
    dependencies: RwLock<Arc<[Dependency]>>,
}

impl CoreShared {
    pub(crate) fn new(
        discovery_key: [u8; 32],
        core_pointer: u64,
        root_data_pointer: u64,
        data_pointer: u64,
        dependencies: Vec<Dependency>,
    ) -> Self {
        Self {
            discovery_key,
            core_pointer,
            root_data_pointer,
            data_pointer,
            dependencies: RwLock::new(dependencies.into()),
        }
    }

    pub(crate) fn dependencies(&self) -> Arc<[Dependency]> {
        Arc::clone(
            &self
                .dependencies
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub(crate) fn set_dependencies(&self, dependencies: Vec<Dependency>) {
        *self
            .dependencies
            .write()
            .unwrap_or_else(PoisonError::into_inner) = dependencies.into();
    }
}

/// Stable identifiers of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pointers {
    pub core_pointer: u64,
    pub data_pointer: u64,
}

/// Handle on one core's storage.
///
/// Cheap to clone. Handles from [`CoreStorage::atomize`] route writes
/// through an [`Atom`]; handles from [`CoreStorage::snapshot`] read a
/// frozen view and reject writes.
#[derive(Clone)]
pub struct CoreStorage {
    pub(crate) store: Store,
    pub(crate) shared: Arc<CoreShared>,
    pub(crate) atom: Option<Atom>,
    pub(crate) pinned: Option<Arc<dyn KvRead>>,
}

impl CoreStorage {
    pub(crate) fn new(store: Store, shared: Arc<CoreShared>) -> Self {
        Self {
            store,
            shared,
            atom: None,
            pinned: None,
        }
    }

    #[must_use]
    pub fn discovery_key(&self) -> &[u8; 32] {
        &self.shared.discovery_key
    }

    #[must_use]
    pub fn pointers(&self) -> Pointers {
        Pointers {
            core_pointer: self.shared.core_pointer,
            data_pointer: self.shared.data_pointer,
        }
    }

    /// Older partitions this core reads through, ascending by length.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Dependency> {
        self.shared.dependencies().to_vec()
    }

    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.pinned.is_some()
    }

    #[must_use]
    pub fn atom(&self) -> Option<&Atom> {
        self.atom.as_ref()
    }

    /// Backing snapshot, with the atom's pending changes on top for
    /// atomized handles.
    pub(crate) fn read_view(&self) -> StorageResult<Arc<dyn KvRead>> {
        if let Some(pinned) = &self.pinned {
            return Ok(Arc::clone(pinned));
        }
        let Some(atom) = &self.atom else {
            return Ok(self.store.inner.backend.snapshot()?);
        };

        // held across the backing snapshot; Atom::flush writes under it
        let mut log = lock(&atom.inner.log);
        let view = self.store.inner.backend.snapshot()?;
        if log.is_empty() {
            return Ok(view);
        }
        Ok(Arc::new(OverlayView::new(log.snapshot(), view)))
    }

    /// A read batch over the current state.
    pub fn read(&self) -> StorageResult<CoreReadBatch> {
        Ok(CoreReadBatch::new(
            self.read_view()?,
            self.shared.data_pointer,
            self.shared.root_data_pointer,
            self.shared.dependencies(),
        ))
    }

    pub fn write(&self) -> CoreWriteBatch {
        CoreWriteBatch::new(self.clone())
    }

    /// A read-only handle that keeps seeing the state as of now.
    pub fn snapshot(&self) -> StorageResult<CoreStorage> {
        Ok(CoreStorage {
            pinned: Some(self.read_view()?),
            ..self.clone()
        })
    }

    /// A live handle whose writes join `atom` and whose reads see the
    /// atom's uncommitted changes.
    #[must_use]
    pub fn atomize(&self, atom: &Atom) -> CoreStorage {
        atom.bind(&self.shared);
        CoreStorage {
            store: self.store.clone(),
            shared: Arc::clone(&self.shared),
            atom: Some(atom.clone()),
            pinned: None,
        }
    }

    // -- range scans ----------------------------------------------------

    /// Block segments covering `[start, end)`, one per owning partition.
    fn segments(&self, start: u64, end: Option<u64>) -> Vec<(u64, u64, Option<u64>)> {
        let mut out = Vec::new();
        let mut lower = 0;
        for dep in self.shared.dependencies().iter() {
            let s = start.max(lower);
            let e = end.map_or(dep.length, |end| end.min(dep.length));
            if s < e {
                out.push((dep.data_pointer, s, Some(e)));
            }
            lower = dep.length;
        }
        let s = start.max(lower);
        if end.map_or(true, |end| s < end) {
            out.push((self.shared.data_pointer, s, end));
        }
        out
    }

    /// Blocks `[start, end)` as `(index, data)`, read through dependencies.
    pub fn blocks(
        &self,
        start: u64,
        end: Option<u64>,
        reverse: bool,
    ) -> StorageResult<Scan<(u64, Vec<u8>)>> {
        let ranges = self
            .segments(start, end)
            .into_iter()
            .map(|(ptr, s, e)| KeyRange::new(keys::block(ptr, s), keys::block_end(ptr, e)))
            .collect();
        Ok(Scan::new(self.read_view()?, ranges, reverse, |key, value| {
            Ok((keys::decode_block_index(key)?, value))
        }))
    }

    /// Tree nodes `[start, end)`, read through dependencies.
    pub fn tree_nodes(
        &self,
        start: u64,
        end: Option<u64>,
        reverse: bool,
    ) -> StorageResult<Scan<records::TreeNode>> {
        let ranges = self
            .segments(start, end)
            .into_iter()
            .map(|(ptr, s, e)| {
                KeyRange::new(keys::tree_node(ptr, s), keys::tree_node_end(ptr, e))
            })
            .collect();
        Ok(Scan::new(self.read_view()?, ranges, reverse, |_, value| {
            Ok(records::TreeNode::decode(&value)?)
        }))
    }

    /// Bitfield pages with index in `[start, end)`, every page type.
    pub fn bitfield_pages(
        &self,
        start: u64,
        end: Option<u64>,
        reverse: bool,
    ) -> StorageResult<Scan<BitfieldPage>> {
        let ptr = self.shared.data_pointer;
        let range = KeyRange::new(keys::bitfield(ptr, start, 0), keys::bitfield_end(ptr, end));
        Ok(Scan::new(self.read_view()?, vec![range], reverse, |key, data| {
            let (index, page_type) = keys::decode_bitfield_index(key)?;
            Ok(BitfieldPage {
                index,
                page_type,
                data,
            })
        }))
    }

    /// User data entries whose key begins with `prefix`.
    pub fn user_data(&self, prefix: &str, reverse: bool) -> StorageResult<Scan<(String, Vec<u8>)>> {
        let ptr = self.shared.data_pointer;
        let range = KeyRange::new(
            keys::user_data_start(ptr, prefix),
            keys::user_data_end(ptr, prefix),
        );
        Ok(Scan::new(self.read_view()?, vec![range], reverse, |key, value| {
            Ok((keys::decode_user_data_key(key)?, value))
        }))
    }

    /// Local entries whose key begins with `prefix`.
    pub fn local_entries(
        &self,
        prefix: &[u8],
        reverse: bool,
    ) -> StorageResult<Scan<(Vec<u8>, Vec<u8>)>> {
        let ptr = self.shared.data_pointer;
        let range = KeyRange::new(keys::local_start(ptr, prefix)?, keys::local_end(ptr, prefix)?);
        Ok(Scan::new(self.read_view()?, vec![range], reverse, |key, value| {
            Ok((keys::decode_local_key(key)?, value))
        }))
    }

    // -- sessions -------------------------------------------------------

    /// Forks a named session off this handle's partition.
    ///
    /// The session gets a fresh data partition that reads indices below
    /// `length` from the current one. Re-using a name repoints it.
    pub fn create_session(&self, name: &str, length: u64) -> StorageResult<CoreStorage> {
        if self.pinned.is_some() {
            return Err(StorageError::ReadOnly);
        }
        let root = self.shared.root_data_pointer;
        let current = self.shared.data_pointer;
        let inner = &self.store.inner;

        let data_pointer = inner.head.exclusive(&*inner.backend, |tx| {
            let key = keys::data_sessions(root);
            let mut sessions = tx.get_record::<Sessions>(&key)?.unwrap_or_default();
            let data_pointer = tx.allocate_data_pointer();
            tx.put_record(
                keys::data_dependency(data_pointer),
                &Dependency {
                    data_pointer: current,
                    length,
                },
            );
            sessions.upsert(name, data_pointer);
            tx.put_record(key, &sessions);
            Ok(data_pointer)
        })?;
        info!(name, data_pointer, parent = current, length, "session created");
        self.open_partition(data_pointer)
    }

    /// Reopens the session called `name`, if it exists.
    pub fn resume_session(&self, name: &str) -> StorageResult<Option<CoreStorage>> {
        let found = self.sessions()?.into_iter().find(|s| s.name == name);
        match found {
            Some(session) => Ok(Some(self.open_partition(session.data_pointer)?)),
            None => Ok(None),
        }
    }

    /// Every session registered on this core.
    pub fn sessions(&self) -> StorageResult<Vec<records::Session>> {
        let key = keys::data_sessions(self.shared.root_data_pointer);
        match self.read_view()?.get(&key)? {
            Some(bytes) => Ok(Sessions::decode(&bytes)?.0),
            None => Ok(Vec::new()),
        }
    }

    fn open_partition(&self, data_pointer: u64) -> StorageResult<CoreStorage> {
        let shared = self.store.shared_core(
            self.shared.discovery_key,
            self.shared.core_pointer,
            self.shared.root_data_pointer,
            data_pointer,
        )?;
        debug!(data_pointer, "partition opened");
        Ok(CoreStorage::new(self.store.clone(), shared))
    }
}

impl std::fmt::Debug for CoreStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreStorage")
            .field("core_pointer", &self.shared.core_pointer)
            .field("data_pointer", &self.shared.data_pointer)
            .field("dependencies", &self.shared.dependencies().len())
            .field("atomic", &self.atom.is_some())
            .field("snapshot", &self.pinned.is_some())
            .finish()
    }
}

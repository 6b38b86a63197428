//! Atomic commits spanning several cores.
//!
//! An [`Atom`] is one shared [`ChangeLog`]. Handles produced by
//! [`CoreStorage::atomize`](crate::CoreStorage::atomize) write into it and
//! read through it; nobody else sees those writes until [`Atom::flush`].
//!
//! ## Commit
//!
//! ```text
//!   lock commit
//!     lock atom log
//!       one backing write              <- every core at once, or none
//!       empty the atom log             <- only if the write succeeded
//!     unlock
//!     reload dependencies if any were rewritten
//!   unlock commit
//! ```
//!
//! The backing write is the only point of visibility. Plain handles read
//! backing snapshots, so they see either all of the commit or none of it.
//! Atomized handles take the atom log before their backing snapshot, so
//! they never observe the gap between the write and the log being emptied.
//!
//! Lock order is commit, then atom log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use changelog::{Change, ChangeLog};
use tracing::{debug, warn};

use crate::core_storage::CoreShared;
use crate::error::StorageResult;
use crate::{lock, Store};

pub(crate) struct AtomInner {
    store: Store,
    pub(crate) log: Mutex<ChangeLog>,
    cores: Mutex<Vec<Arc<CoreShared>>>,
    /// Set when a pending change rewrites a dependency record.
    dependencies_changed: AtomicBool,
}

/// Shared change log committed to many cores at once.
#[derive(Clone)]
pub struct Atom {
    pub(crate) inner: Arc<AtomInner>,
}

impl Atom {
    pub(crate) fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(AtomInner {
                store,
                log: Mutex::new(ChangeLog::new()),
                cores: Mutex::new(Vec::new()),
                dependencies_changed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of changes waiting for [`Atom::flush`].
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.inner.log).len()
    }

    /// Number of distinct partitions bound to this atom.
    #[must_use]
    pub fn cores(&self) -> usize {
        lock(&self.inner.cores).len()
    }

    pub(crate) fn bind(&self, core: &Arc<CoreShared>) {
        let mut cores = lock(&self.inner.cores);
        if !cores.iter().any(|c| c.data_pointer == core.data_pointer) {
            cores.push(Arc::clone(core));
        }
    }

    pub(crate) fn append(
        &self,
        changes: &[Change],
        dependencies_changed: bool,
    ) -> StorageResult<()> {
        lock(&self.inner.log).apply(changes)?;
        if dependencies_changed {
            self.inner.dependencies_changed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Commits every pending change to all bound cores, all or nothing.
    ///
    /// If the backing write fails the error is returned and the changes stay
    /// pending. Only atomized handles see them until a later flush succeeds.
    pub fn flush(&self) -> StorageResult<()> {
        let store = &self.inner.store;
        let _commit = lock(&store.inner.commit);

        {
            let mut log = lock(&self.inner.log);
            if log.is_empty() {
                return Ok(());
            }
            let batch = log.to_batch();
            let changes = batch.len();
            if let Err(e) = store.inner.backend.write(batch) {
                warn!(error = %e, changes, "atom flush failed, changes kept pending");
                return Err(e.into());
            }
            log.clear();
            debug!(changes, cores = self.cores(), "atom flushed");
        }

        if self.inner.dependencies_changed.swap(false, Ordering::SeqCst) {
            store.refresh_dependencies()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atom")
            .field("pending", &self.pending())
            .field("cores", &self.cores())
            .finish()
    }
}

//! # Storage - Transactional Multi-Core Feed Storage
//!
//! Persists many independent feeds ("cores") in one ordered key-value
//! keyspace. Each core owns a data partition addressed by a stable pointer;
//! blocks, tree nodes, bitfield pages and metadata live under that pointer
//! (see the [`keys`] crate for the layout).
//!
//! ## Architecture
//!
//! ```text
//!  Store ──── HeadLock (one writer, coalesced flush) ──┐
//!    │                                                 │
//!    ├── CoreStorage ── read()  → CoreReadBatch ───────┤  snapshot
//!    │        │         write() → CoreWriteBatch ──────┤  write batch
//!    │        └── atomize(atom) ─┐                     │
//!    │                           v                     v
//!    └── create_atom() ──────── Atom ─── flush ──► KvStore (backend)
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module           | Purpose                                              |
//! |------------------|------------------------------------------------------|
//! | `lib.rs`         | [`Store`]: open, core registry, aliases, seed        |
//! | [`head`]         | single-writer head transactions, pointer allocation  |
//! | [`core_storage`] | [`CoreStorage`]: views, scans, sessions, atomize     |
//! | [`read`]         | [`CoreReadBatch`] and [`Pending`] results            |
//! | [`write`]        | [`CoreWriteBatch`]                                   |
//! | [`atom`]         | [`Atom`]: multi-core all-or-nothing commit           |
//! | [`overlay`]      | [`MemoryOverlay`]: in-memory staging for a core      |
//! | [`scan`]         | typed range iterators                                |
//!
//! ## Visibility
//!
//! Reads never wait for writers. A read batch captures an immutable view
//! when it is built; later commits are invisible to it. A plain write batch
//! is visible once its `flush` returns. Atom writes are visible only through
//! atomized handles until [`Atom::flush`], then to every handle of every
//! bound core at the same moment.

mod atom;
mod core_storage;
mod error;
mod head;
mod overlay;
mod read;
mod scan;
mod write;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use backend::{KeyRange, KvRead, KvStore, MemoryBackend};
use config::StoreConfig;
use records::{
    Alias, CoreAuth, CoreIndex, CoreRecord, KeyPair, Record, RecordError, StoreHead,
};
use tracing::{debug, info};

pub use atom::Atom;
pub use core_storage::{CoreStorage, Pointers};
pub use error::{StorageError, StorageResult};
pub use overlay::{MemoryOverlay, OverlayReadBatch, OverlayWriteBatch};
pub use read::{CoreReadBatch, Pending};
pub use scan::{BitfieldPage, Scan};
pub use write::CoreWriteBatch;

use core_storage::{load_dependencies, CoreShared};
use head::HeadLock;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fixed32(bytes: &[u8], what: &'static str) -> StorageResult<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| StorageError::Record(RecordError::Invalid(what)))
}

/// Everything needed to register a new core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCore {
    pub key: [u8; 32],
    pub discovery_key: [u8; 32],
    pub manifest: Option<Vec<u8>>,
    pub key_pair: Option<KeyPair>,
    pub encryption_key: Option<Vec<u8>>,
    pub alias: Option<Alias>,
}

impl CreateCore {
    /// Options with only the keys set.
    pub fn new(key: [u8; 32], discovery_key: [u8; 32]) -> Self {
        Self {
            key,
            discovery_key,
            manifest: None,
            key_pair: None,
            encryption_key: None,
            alias: None,
        }
    }
}

pub(crate) struct StoreInner {
    pub(crate) backend: Arc<dyn KvStore>,
    pub(crate) head: HeadLock,
    /// Serializes core write batches, atom commits and dependency reloads.
    pub(crate) commit: Mutex<()>,
    /// Live partitions by data pointer.
    cores: Mutex<HashMap<u64, Weak<CoreShared>>>,
    config: StoreConfig,
}

/// The feed store. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Store {
    /// Opens a store over `backend`, initialising the head on first use.
    pub fn open(backend: Arc<dyn KvStore>, config: StoreConfig) -> StorageResult<Self> {
        let store = Self {
            inner: Arc::new(StoreInner {
                head: HeadLock::new(config.flush_threshold),
                backend,
                commit: Mutex::new(()),
                cores: Mutex::new(HashMap::new()),
                config,
            }),
        };
        let head = store.exclusive(|tx| Ok(tx.head().clone()))?;
        info!(
            version = head.version,
            cores = head.allocated.cores,
            datas = head.allocated.datas,
            flush_threshold = store.inner.config.flush_threshold,
            "store opened"
        );
        Ok(store)
    }

    /// Opens a store over a [`MemoryBackend`], durable when `config.wal` is
    /// set.
    pub fn from_config(config: StoreConfig) -> StorageResult<Self> {
        let backend: Arc<dyn KvStore> = match &config.wal {
            Some(wal) => Arc::new(MemoryBackend::open(&wal.path, wal.sync)?),
            None => Arc::new(MemoryBackend::new()),
        };
        Self::open(backend, config)
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub(crate) fn exclusive<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut head::HeadTx<'_>) -> StorageResult<T>,
    {
        self.inner.head.exclusive(&*self.inner.backend, f)
    }

    /// Number of head flushes that reached the backend.
    #[must_use]
    pub fn head_flushes(&self) -> u64 {
        self.inner.head.flush_count()
    }

    /// The persisted store head.
    pub fn head(&self) -> StorageResult<StoreHead> {
        match self.inner.backend.get(&keys::head())? {
            Some(bytes) => Ok(StoreHead::decode(&bytes)?),
            None => Ok(StoreHead::default()),
        }
    }

    // -- seed and default key -------------------------------------------

    pub fn seed(&self) -> StorageResult<Option<[u8; 32]>> {
        Ok(self.head()?.seed)
    }

    /// Stores `seed` unless one exists and `overwrite` is false. Returns
    /// the seed in effect afterwards.
    pub fn set_seed(&self, seed: [u8; 32], overwrite: bool) -> StorageResult<[u8; 32]> {
        self.exclusive(|tx| match tx.head().seed {
            Some(existing) if !overwrite => Ok(existing),
            _ => {
                tx.head_mut().seed = Some(seed);
                Ok(seed)
            }
        })
    }

    pub fn default_discovery_key(&self) -> StorageResult<Option<[u8; 32]>> {
        Ok(self.head()?.default_discovery_key)
    }

    /// Same contract as [`Store::set_seed`].
    pub fn set_default_discovery_key(
        &self,
        discovery_key: [u8; 32],
        overwrite: bool,
    ) -> StorageResult<[u8; 32]> {
        self.exclusive(|tx| match tx.head().default_discovery_key {
            Some(existing) if !overwrite => Ok(existing),
            _ => {
                tx.head_mut().default_discovery_key = Some(discovery_key);
                Ok(discovery_key)
            }
        })
    }

    // -- cores ----------------------------------------------------------

    pub fn has(&self, discovery_key: &[u8; 32]) -> StorageResult<bool> {
        Ok(self
            .inner
            .backend
            .get(&keys::discovery_key(discovery_key))?
            .is_some())
    }

    /// Registers a core, or returns the existing one for this discovery key.
    pub fn create_core(&self, opts: CreateCore) -> StorageResult<CoreStorage> {
        let record = self.exclusive(|tx| {
            let index_key = keys::discovery_key(&opts.discovery_key);
            if let Some(index) = tx.get_record::<CoreIndex>(&index_key)? {
                return tx
                    .get_record::<CoreRecord>(&keys::core(index.core_pointer))?
                    .ok_or(StorageError::Record(RecordError::Invalid(
                        "discovery key without core record",
                    )));
            }

            let core_pointer = tx.allocate_core_pointer();
            let data_pointer = tx.allocate_data_pointer();
            let record = CoreRecord {
                core_pointer,
                data_pointer,
                alias: opts.alias.clone(),
            };
            tx.put_record(keys::core(core_pointer), &record);
            tx.put_record(index_key, &CoreIndex { core_pointer });
            if let Some(alias) = &opts.alias {
                tx.put(
                    keys::alias(&alias.namespace, &alias.name),
                    opts.discovery_key.to_vec(),
                );
            }
            tx.put_record(
                keys::data_auth(data_pointer),
                &CoreAuth {
                    key: opts.key,
                    discovery_key: opts.discovery_key,
                    manifest: opts.manifest.clone(),
                    key_pair: opts.key_pair.clone(),
                    encryption_key: opts.encryption_key.clone(),
                },
            );
            info!(core_pointer, data_pointer, "core created");
            Ok(record)
        })?;
        self.open_core(opts.discovery_key, &record)
    }

    /// Opens an existing core.
    pub fn resume_core(&self, discovery_key: &[u8; 32]) -> StorageResult<Option<CoreStorage>> {
        let backend = &self.inner.backend;
        let Some(bytes) = backend.get(&keys::discovery_key(discovery_key))? else {
            return Ok(None);
        };
        let index = CoreIndex::decode(&bytes)?;
        let Some(bytes) = backend.get(&keys::core(index.core_pointer))? else {
            return Err(RecordError::Invalid("discovery key without core record").into());
        };
        let record = CoreRecord::decode(&bytes)?;
        self.open_core(*discovery_key, &record).map(Some)
    }

    fn open_core(&self, discovery_key: [u8; 32], record: &CoreRecord) -> StorageResult<CoreStorage> {
        let shared = self.shared_core(
            discovery_key,
            record.core_pointer,
            record.data_pointer,
            record.data_pointer,
        )?;
        Ok(CoreStorage::new(self.clone(), shared))
    }

    /// The live [`CoreShared`] for `data_pointer`, loading it if needed.
    pub(crate) fn shared_core(
        &self,
        discovery_key: [u8; 32],
        core_pointer: u64,
        root_data_pointer: u64,
        data_pointer: u64,
    ) -> StorageResult<Arc<CoreShared>> {
        let mut cores = lock(&self.inner.cores);
        if let Some(live) = cores.get(&data_pointer).and_then(Weak::upgrade) {
            return Ok(live);
        }
        cores.retain(|_, weak| weak.strong_count() > 0);

        let dependencies = load_dependencies(&*self.inner.backend, data_pointer)?;
        debug!(
            data_pointer,
            dependencies = dependencies.len(),
            "core partition loaded"
        );
        let shared = Arc::new(CoreShared::new(
            discovery_key,
            core_pointer,
            root_data_pointer,
            data_pointer,
            dependencies,
        ));
        cores.insert(data_pointer, Arc::downgrade(&shared));
        Ok(shared)
    }

    /// Reloads the dependency chain of every live partition.
    ///
    /// Callers hold the commit lock and have just written a dependency
    /// record. A rewritten link can change the chain of any partition below
    /// it, so every live partition is reloaded.
    pub(crate) fn refresh_dependencies(&self) -> StorageResult<()> {
        let live: Vec<Arc<CoreShared>> = lock(&self.inner.cores)
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for shared in &live {
            let dependencies = load_dependencies(&*self.inner.backend, shared.data_pointer)?;
            shared.set_dependencies(dependencies);
        }
        debug!(partitions = live.len(), "dependencies reloaded");
        Ok(())
    }

    // -- aliases and listings -------------------------------------------

    /// Discovery key registered under `alias`.
    pub fn alias(&self, alias: &Alias) -> StorageResult<Option<[u8; 32]>> {
        match self
            .inner
            .backend
            .get(&keys::alias(&alias.namespace, &alias.name))?
        {
            Some(bytes) => Ok(Some(fixed32(&bytes, "alias target is not 32 bytes")?)),
            None => Ok(None),
        }
    }

    /// Every alias, optionally limited to one namespace, in key order.
    pub fn aliases(&self, namespace: Option<&[u8; 32]>) -> StorageResult<Vec<(Alias, [u8; 32])>> {
        let ns = namespace.map(|n| n.as_slice());
        let range = KeyRange::new(keys::alias_start(ns), keys::alias_end(ns));
        let mut out = Vec::new();
        for entry in self.inner.backend.iter(&range, false)? {
            let (key, value) = entry?;
            let (namespace, name) = keys::decode_alias(&key)?;
            out.push((
                Alias {
                    name,
                    namespace: fixed32(&namespace, "alias namespace is not 32 bytes")?,
                },
                fixed32(&value, "alias target is not 32 bytes")?,
            ));
        }
        Ok(out)
    }

    /// Discovery keys of every core, in key order.
    pub fn discovery_keys(&self) -> StorageResult<Vec<[u8; 32]>> {
        let range = KeyRange::new(keys::discovery_key_start(), keys::discovery_key_end());
        let mut out = Vec::new();
        for entry in self.inner.backend.iter(&range, false)? {
            let (key, _) = entry?;
            let dk = keys::decode_discovery_key(&key)?;
            out.push(fixed32(&dk, "discovery key is not 32 bytes")?);
        }
        Ok(out)
    }

    // -- lifecycle ------------------------------------------------------

    /// A new, empty atom bound to this store.
    #[must_use]
    pub fn create_atom(&self) -> Atom {
        Atom::new(self.clone())
    }

    pub fn suspend(&self) -> StorageResult<()> {
        self.inner.backend.suspend()?;
        info!("store suspended");
        Ok(())
    }

    pub fn resume(&self) -> StorageResult<()> {
        self.inner.backend.resume()?;
        info!("store resumed");
        Ok(())
    }

    /// Closes the backend. Idempotent.
    pub fn close(&self) -> StorageResult<()> {
        // waits out an in-flight commit
        let _commit = lock(&self.inner.commit);
        self.inner.backend.close()?;
        info!("store closed");
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.inner.config)
            .field("live_partitions", &lock(&self.inner.cores).len())
            .finish()
    }
}

#[cfg(test)]
mod tests;

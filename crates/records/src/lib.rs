//! # Records - Stored Record Types
//!
//! Typed values persisted by the feed store, and their compact binary
//! encoding. Each record is a plain struct; optional fields are `Option`s and
//! are preceded on the wire by a presence bitmask (see [`codec`]).
//!
//! | record        | fields                                                   |
//! |---------------|----------------------------------------------------------|
//! | [`StoreHead`] | version, allocated counters, ?seed, ?default key         |
//! | [`CoreRecord`]| core pointer, data pointer, ?alias                       |
//! | [`CoreAuth`]  | key, discovery key, ?manifest, ?key pair, ?encryption key|
//! | [`CoreHead`]  | fork, length, root hash, signature                       |
//! | [`TreeNode`]  | index, size, hash                                        |
//! | [`Dependency`]| data pointer, length                                     |
//! | [`Hints`]     | contiguous length                                        |
//! | [`Sessions`]  | list of (name, data pointer)                             |
//! | [`CoreIndex`] | core pointer                                             |
//!
//! ## Example
//!
//! ```rust
//! use records::{Dependency, Record};
//!
//! let dep = Dependency { data_pointer: 7, length: 10 };
//! let bytes = dep.encode();
//! assert_eq!(Dependency::decode(&bytes).unwrap(), dep);
//! ```

pub mod codec;

use codec::{Decoder, Encoder};
use thiserror::Error;

/// Version written into a freshly initialised [`StoreHead`].
pub const STORE_VERSION: u64 = 1;

/// Errors raised while decoding a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// Input ended in the middle of a field.
    #[error("unexpected end of record")]
    UnexpectedEnd,

    /// Bytes remained after the last field.
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    /// A field held a value outside its domain.
    #[error("invalid record: {0}")]
    Invalid(&'static str),
}

pub type RecordResult<T> = Result<T, RecordError>;

/// A value with a stable binary encoding.
pub trait Record: Sized {
    fn encode_into(&self, enc: &mut Encoder);

    fn decode_from(dec: &mut Decoder<'_>) -> RecordResult<Self>;

    #[must_use]
    fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc);
        enc.finish()
    }

    /// Decodes a complete record, rejecting trailing bytes.
    fn decode(bytes: &[u8]) -> RecordResult<Self> {
        let mut dec = Decoder::new(bytes);
        let value = Self::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Store head
// ---------------------------------------------------------------------------

/// Monotonic pointer counters. Each value is the next pointer to hand out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Allocated {
    pub cores: u64,
    pub datas: u64,
}

/// Store-wide metadata kept under the head key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHead {
    pub version: u64,
    pub allocated: Allocated,
    pub seed: Option<[u8; 32]>,
    pub default_discovery_key: Option<[u8; 32]>,
}

impl Default for StoreHead {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            allocated: Allocated::default(),
            seed: None,
            default_discovery_key: None,
        }
    }
}

impl Record for StoreHead {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.flags(&[self.seed.is_some(), self.default_discovery_key.is_some()]);
        enc.uint(self.version);
        enc.uint(self.allocated.cores);
        enc.uint(self.allocated.datas);
        if let Some(seed) = &self.seed {
            enc.fixed32(seed);
        }
        if let Some(dk) = &self.default_discovery_key {
            enc.fixed32(dk);
        }
    }

    fn decode_from(dec: &mut Decoder<'_>) -> RecordResult<Self> {
        let flags = dec.flags(2)?;
        let version = dec.uint()?;
        let allocated = Allocated {
            cores: dec.uint()?,
            datas: dec.uint()?,
        };
        let seed = if flags[0] { Some(dec.fixed32()?) } else { None };
        let default_discovery_key = if flags[1] { Some(dec.fixed32()?) } else { None };
        Ok(Self {
            version,
            allocated,
            seed,
            default_discovery_key,
        })
    }
}

// ---------------------------------------------------------------------------
// Core records
// ---------------------------------------------------------------------------

/// Human-readable name for a core, scoped to a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Alias {
    pub name: String,
    pub namespace: [u8; 32],
}

/// Pointers and alias of one core, stored under its core pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreRecord {
    pub core_pointer: u64,
    pub data_pointer: u64,
    pub alias: Option<Alias>,
}

impl Record for CoreRecord {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.flags(&[self.alias.is_some()]);
        enc.uint(self.core_pointer);
        enc.uint(self.data_pointer);
        if let Some(alias) = &self.alias {
            enc.string(&alias.name);
            enc.fixed32(&alias.namespace);
        }
    }

    fn decode_from(dec: &mut Decoder<'_>) -> RecordResult<Self> {
        let flags = dec.flags(1)?;
        let core_pointer = dec.uint()?;
        let data_pointer = dec.uint()?;
        let alias = if flags[0] {
            Some(Alias {
                name: dec.string()?,
                namespace: dec.fixed32()?,
            })
        } else {
            None
        };
        Ok(Self {
            core_pointer,
            data_pointer,
            alias,
        })
    }
}

/// Value of the discovery-key index: which core record to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreIndex {
    pub core_pointer: u64,
}

impl Record for CoreIndex {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.uint(self.core_pointer);
    }

    fn decode_from(dec: &mut Decoder<'_>) -> RecordResult<Self> {
        Ok(Self {
            core_pointer: dec.uint()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: [u8; 32],
    pub secret_key: Vec<u8>,
}

/// Identity material for one core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreAuth {
    pub key: [u8; 32],
    pub discovery_key: [u8; 32],
    pub manifest: Option<Vec<u8>>,
    pub key_pair: Option<KeyPair>,
    pub encryption_key: Option<Vec<u8>>,
}

impl Record for CoreAuth {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.flags(&[
            self.manifest.is_some(),
            self.key_pair.is_some(),
            self.encryption_key.is_some(),
        ]);
        enc.fixed32(&self.key);
        enc.fixed32(&self.discovery_key);
        if let Some(manifest) = &self.manifest {
            enc.buffer(manifest);
        }
        if let Some(kp) = &self.key_pair {
            enc.fixed32(&kp.public_key);
            enc.buffer(&kp.secret_key);
        }
        if let Some(ek) = &self.encryption_key {
            enc.buffer(ek);
        }
    }

    fn decode_from(dec: &mut Decoder<'_>) -> RecordResult<Self> {
        let flags = dec.flags(3)?;
        let key = dec.fixed32()?;
        let discovery_key = dec.fixed32()?;
        let manifest = if flags[0] { Some(dec.buffer()?) } else { None };
        let key_pair = if flags[1] {
            Some(KeyPair {
                public_key: dec.fixed32()?,
                secret_key: dec.buffer()?,
            })
        } else {
            None
        };
        let encryption_key = if flags[2] { Some(dec.buffer()?) } else { None };
        Ok(Self {
            key,
            discovery_key,
            manifest,
            key_pair,
            encryption_key,
        })
    }
}

// ---------------------------------------------------------------------------
// Data records
// ---------------------------------------------------------------------------

/// Signed tip of a core's Merkle tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreHead {
    pub fork: u64,
    pub length: u64,
    pub root_hash: [u8; 32],
    pub signature: Vec<u8>,
}

impl Record for CoreHead {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.uint(self.fork);
        enc.uint(self.length);
        enc.fixed32(&self.root_hash);
        enc.buffer(&self.signature);
    }

    fn decode_from(dec: &mut Decoder<'_>) -> RecordResult<Self> {
        Ok(Self {
            fork: dec.uint()?,
            length: dec.uint()?,
            root_hash: dec.fixed32()?,
            signature: dec.buffer()?,
        })
    }
}

/// A Merkle-tree node as produced by the hashing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub index: u64,
    pub size: u64,
    pub hash: [u8; 32],
}

impl Record for TreeNode {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.uint(self.index);
        enc.uint(self.size);
        enc.fixed32(&self.hash);
    }

    fn decode_from(dec: &mut Decoder<'_>) -> RecordResult<Self> {
        Ok(Self {
            index: dec.uint()?,
            size: dec.uint()?,
            hash: dec.fixed32()?,
        })
    }
}

/// Indices below `length` live under the older `data_pointer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub data_pointer: u64,
    pub length: u64,
}

impl Record for Dependency {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.uint(self.data_pointer);
        enc.uint(self.length);
    }

    fn decode_from(dec: &mut Decoder<'_>) -> RecordResult<Self> {
        Ok(Self {
            data_pointer: dec.uint()?,
            length: dec.uint()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hints {
    pub contiguous_length: u64,
}

impl Record for Hints {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.uint(self.contiguous_length);
    }

    fn decode_from(dec: &mut Decoder<'_>) -> RecordResult<Self> {
        Ok(Self {
            contiguous_length: dec.uint()?,
        })
    }
}

/// A named session and the data partition it writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub name: String,
    pub data_pointer: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sessions(pub Vec<Session>);

impl Sessions {
    pub fn get(&self, name: &str) -> Option<&Session> {
        self.0.iter().find(|s| s.name == name)
    }

    /// Inserts or replaces the session called `name`.
    pub fn upsert(&mut self, name: &str, data_pointer: u64) {
        match self.0.iter_mut().find(|s| s.name == name) {
            Some(s) => s.data_pointer = data_pointer,
            None => self.0.push(Session {
                name: name.to_string(),
                data_pointer,
            }),
        }
    }
}

impl Record for Sessions {
    fn encode_into(&self, enc: &mut Encoder) {
        enc.uint(self.0.len() as u64);
        for s in &self.0 {
            enc.string(&s.name);
            enc.uint(s.data_pointer);
        }
    }

    fn decode_from(dec: &mut Decoder<'_>) -> RecordResult<Self> {
        let count = dec.uint()?;
        let mut list = Vec::new();
        for _ in 0..count {
            list.push(Session {
                name: dec.string()?,
                data_pointer: dec.uint()?,
            });
        }
        Ok(Self(list))
    }
}

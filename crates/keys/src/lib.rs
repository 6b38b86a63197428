//! # Keys - Logical Key Codec
//!
//! Maps the hierarchical identifiers of the feed store onto flat byte keys in
//! one shared ordered keyspace. Byte order of an encoded key always equals the
//! natural order of its logical fields, which is what makes range scans over
//! blocks, tree nodes, aliases and user data work.
//!
//! ## Layout
//!
//! ```text
//! [HEAD]
//! [CORE_BY_DISCOVERY_KEY][bytes discovery_key]
//! [CORE_BY_ALIAS][bytes namespace][bytes name]
//! [CORE][uint core_pointer]
//! [DATA][uint data_pointer][sub-type][payload ...]
//! ```
//!
//! Data sub-types, in key order:
//!
//! | tag | sub-type    | payload                        |
//! |-----|-------------|--------------------------------|
//! | 0   | auth        | -                              |
//! | 1   | sessions    | -                              |
//! | 2   | head        | -                              |
//! | 3   | dependency  | -                              |
//! | 4   | hints       | -                              |
//! | 5   | block       | uint index                     |
//! | 6   | tree node   | uint index                     |
//! | 7   | bitfield    | uint index, uint type          |
//! | 8   | user data   | bytes key                      |
//! | 9   | local       | bytes key (max 2048 bytes)     |
//!
//! See [`encoding`] for the integer and byte-string primitives.
//!
//! ## Example
//!
//! ```rust
//! let a = keys::block(3, 9);
//! let b = keys::block(3, 10);
//! assert!(a < b);
//! assert_eq!(keys::decode_block_index(&b).unwrap(), 10);
//! ```
//!
//! Every builder allocates its own buffer; nothing here holds shared scratch
//! state, so keys can be built from any thread.

pub mod encoding;

use encoding::{read_bytes, read_uint, write_bytes, write_bytes_prefix, write_uint, SENTINEL};
use thiserror::Error;

/// Maximum size of a local key in bytes.
pub const MAX_LOCAL_KEY_SIZE: usize = 2048;

/// Top-level namespace tags.
pub mod namespace {
    pub const HEAD: u8 = 0;
    pub const CORE_BY_DISCOVERY_KEY: u8 = 1;
    pub const CORE_BY_ALIAS: u8 = 2;
    pub const CORE: u8 = 3;
    pub const DATA: u8 = 4;
}

/// Sub-type tags inside the `DATA` namespace.
pub mod data {
    pub const AUTH: u8 = 0;
    pub const SESSIONS: u8 = 1;
    pub const HEAD: u8 = 2;
    pub const DEPENDENCY: u8 = 3;
    pub const HINTS: u8 = 4;
    pub const BLOCK: u8 = 5;
    pub const TREE: u8 = 6;
    pub const BITFIELD: u8 = 7;
    pub const USER_DATA: u8 = 8;
    pub const LOCAL: u8 = 9;
}

/// Errors produced while building or decoding keys.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// A local key exceeded [`MAX_LOCAL_KEY_SIZE`].
    #[error("key too large: {len} bytes (max {max})")]
    KeyTooLarge { len: usize, max: usize },

    /// The key does not have the expected shape.
    #[error("malformed key: {0}")]
    Malformed(&'static str),
}

pub type KeyResult<T> = Result<T, KeyError>;

// ---------------------------------------------------------------------------
// Store-level keys
// ---------------------------------------------------------------------------

/// Key of the store head record.
#[must_use]
pub fn head() -> Vec<u8> {
    vec![namespace::HEAD]
}

/// Key mapping a discovery key to its core pointer.
#[must_use]
pub fn discovery_key(discovery_key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(discovery_key.len() + 4);
    buf.push(namespace::CORE_BY_DISCOVERY_KEY);
    write_bytes(&mut buf, discovery_key);
    buf
}

/// Inclusive start of a scan over every discovery key.
#[must_use]
pub fn discovery_key_start() -> Vec<u8> {
    vec![namespace::CORE_BY_DISCOVERY_KEY]
}

/// Exclusive end of a scan over every discovery key.
#[must_use]
pub fn discovery_key_end() -> Vec<u8> {
    vec![namespace::CORE_BY_DISCOVERY_KEY + 1]
}

/// Key mapping `(namespace, name)` to a discovery key.
#[must_use]
pub fn alias(alias_namespace: &[u8], name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(alias_namespace.len() + name.len() + 6);
    buf.push(namespace::CORE_BY_ALIAS);
    write_bytes(&mut buf, alias_namespace);
    write_bytes(&mut buf, name.as_bytes());
    buf
}

/// Inclusive start of an alias scan, optionally scoped to one namespace.
#[must_use]
pub fn alias_start(alias_namespace: Option<&[u8]>) -> Vec<u8> {
    let mut buf = vec![namespace::CORE_BY_ALIAS];
    if let Some(ns) = alias_namespace {
        write_bytes(&mut buf, ns);
    }
    buf
}

/// Exclusive end of an alias scan, optionally scoped to one namespace.
#[must_use]
pub fn alias_end(alias_namespace: Option<&[u8]>) -> Vec<u8> {
    match alias_namespace {
        Some(ns) => {
            let mut buf = alias_start(Some(ns));
            buf.push(SENTINEL);
            buf
        }
        None => vec![namespace::CORE_BY_ALIAS + 1],
    }
}

/// Key of the core record for `core_pointer`.
#[must_use]
pub fn core(core_pointer: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    buf.push(namespace::CORE);
    write_uint(&mut buf, core_pointer);
    buf
}

// ---------------------------------------------------------------------------
// Data keys
// ---------------------------------------------------------------------------

fn data_prefix(data_pointer: u64, sub: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.push(namespace::DATA);
    write_uint(&mut buf, data_pointer);
    buf.push(sub);
    buf
}

/// Exclusive end of every key with sub-type `sub`: the next sub-type tag.
fn data_sub_end(data_pointer: u64, sub: u8) -> Vec<u8> {
    data_prefix(data_pointer, sub + 1)
}

#[must_use]
pub fn data_auth(data_pointer: u64) -> Vec<u8> {
    data_prefix(data_pointer, data::AUTH)
}

#[must_use]
pub fn data_sessions(data_pointer: u64) -> Vec<u8> {
    data_prefix(data_pointer, data::SESSIONS)
}

#[must_use]
pub fn data_head(data_pointer: u64) -> Vec<u8> {
    data_prefix(data_pointer, data::HEAD)
}

#[must_use]
pub fn data_dependency(data_pointer: u64) -> Vec<u8> {
    data_prefix(data_pointer, data::DEPENDENCY)
}

#[must_use]
pub fn data_hints(data_pointer: u64) -> Vec<u8> {
    data_prefix(data_pointer, data::HINTS)
}

/// Key of block `index`.
#[must_use]
pub fn block(data_pointer: u64, index: u64) -> Vec<u8> {
    let mut buf = data_prefix(data_pointer, data::BLOCK);
    write_uint(&mut buf, index);
    buf
}

/// Exclusive end of a block scan. `None` covers every remaining block.
#[must_use]
pub fn block_end(data_pointer: u64, index: Option<u64>) -> Vec<u8> {
    match index {
        Some(i) => block(data_pointer, i),
        None => data_sub_end(data_pointer, data::BLOCK),
    }
}

/// Key of tree node `index`.
#[must_use]
pub fn tree_node(data_pointer: u64, index: u64) -> Vec<u8> {
    let mut buf = data_prefix(data_pointer, data::TREE);
    write_uint(&mut buf, index);
    buf
}

/// Exclusive end of a tree-node scan. `None` covers every remaining node.
#[must_use]
pub fn tree_node_end(data_pointer: u64, index: Option<u64>) -> Vec<u8> {
    match index {
        Some(i) => tree_node(data_pointer, i),
        None => data_sub_end(data_pointer, data::TREE),
    }
}

/// Key of bitfield page `index` of kind `page_type`.
#[must_use]
pub fn bitfield(data_pointer: u64, index: u64, page_type: u64) -> Vec<u8> {
    let mut buf = data_prefix(data_pointer, data::BITFIELD);
    write_uint(&mut buf, index);
    write_uint(&mut buf, page_type);
    buf
}

/// Exclusive end of a bitfield scan: every page below `index`, of any type.
#[must_use]
pub fn bitfield_end(data_pointer: u64, index: Option<u64>) -> Vec<u8> {
    match index {
        Some(i) => {
            let mut buf = data_prefix(data_pointer, data::BITFIELD);
            write_uint(&mut buf, i);
            buf
        }
        None => data_sub_end(data_pointer, data::BITFIELD),
    }
}

/// Key of the user-data entry `key`.
#[must_use]
pub fn user_data(data_pointer: u64, key: &str) -> Vec<u8> {
    let mut buf = data_prefix(data_pointer, data::USER_DATA);
    write_bytes(&mut buf, key.as_bytes());
    buf
}

/// Inclusive start of a scan over user-data keys beginning with `prefix`.
#[must_use]
pub fn user_data_start(data_pointer: u64, prefix: &str) -> Vec<u8> {
    let mut buf = data_prefix(data_pointer, data::USER_DATA);
    write_bytes_prefix(&mut buf, prefix.as_bytes());
    buf
}

/// Exclusive end of a scan over user-data keys beginning with `prefix`.
#[must_use]
pub fn user_data_end(data_pointer: u64, prefix: &str) -> Vec<u8> {
    let mut buf = user_data_start(data_pointer, prefix);
    buf.push(SENTINEL);
    buf
}

fn check_local(key: &[u8]) -> KeyResult<()> {
    if key.len() > MAX_LOCAL_KEY_SIZE {
        return Err(KeyError::KeyTooLarge {
            len: key.len(),
            max: MAX_LOCAL_KEY_SIZE,
        });
    }
    Ok(())
}

/// Key of the local entry `key`.
///
/// # Errors
///
/// Returns [`KeyError::KeyTooLarge`] if `key` exceeds [`MAX_LOCAL_KEY_SIZE`].
pub fn local(data_pointer: u64, key: &[u8]) -> KeyResult<Vec<u8>> {
    check_local(key)?;
    let mut buf = data_prefix(data_pointer, data::LOCAL);
    write_bytes(&mut buf, key);
    Ok(buf)
}

/// Inclusive start of a scan over local keys beginning with `prefix`.
pub fn local_start(data_pointer: u64, prefix: &[u8]) -> KeyResult<Vec<u8>> {
    check_local(prefix)?;
    let mut buf = data_prefix(data_pointer, data::LOCAL);
    write_bytes_prefix(&mut buf, prefix);
    Ok(buf)
}

/// Exclusive end of a scan over local keys beginning with `prefix`.
pub fn local_end(data_pointer: u64, prefix: &[u8]) -> KeyResult<Vec<u8>> {
    let mut buf = local_start(data_pointer, prefix)?;
    buf.push(SENTINEL);
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Decoders
// ---------------------------------------------------------------------------

fn expect_tag(key: &[u8], tag: u8) -> KeyResult<&[u8]> {
    match key.split_first() {
        Some((&t, rest)) if t == tag => Ok(rest),
        _ => Err(KeyError::Malformed("unexpected namespace")),
    }
}

/// Skips `[DATA][data_pointer][sub]` and returns the payload.
fn data_payload(key: &[u8], sub: u8) -> KeyResult<&[u8]> {
    let rest = expect_tag(key, namespace::DATA)?;
    let (_, used) = read_uint(rest)?;
    expect_tag(&rest[used..], sub)
}

fn finish<T>(value: T, rest: &[u8]) -> KeyResult<T> {
    if rest.is_empty() {
        Ok(value)
    } else {
        Err(KeyError::Malformed("trailing bytes"))
    }
}

/// Extracts the discovery key from a [`discovery_key`] key.
pub fn decode_discovery_key(key: &[u8]) -> KeyResult<Vec<u8>> {
    let rest = expect_tag(key, namespace::CORE_BY_DISCOVERY_KEY)?;
    let (dk, used) = read_bytes(rest)?;
    finish(dk, &rest[used..])
}

/// Extracts `(namespace, name)` from an [`alias`] key.
pub fn decode_alias(key: &[u8]) -> KeyResult<(Vec<u8>, String)> {
    let rest = expect_tag(key, namespace::CORE_BY_ALIAS)?;
    let (ns, used) = read_bytes(rest)?;
    let rest = &rest[used..];
    let (name, used) = read_bytes(rest)?;
    let name = String::from_utf8(name).map_err(|_| KeyError::Malformed("alias is not utf-8"))?;
    finish((ns, name), &rest[used..])
}

/// Extracts the block index from a [`block`] key.
pub fn decode_block_index(key: &[u8]) -> KeyResult<u64> {
    let rest = data_payload(key, data::BLOCK)?;
    let (index, used) = read_uint(rest)?;
    finish(index, &rest[used..])
}

/// Extracts the node index from a [`tree_node`] key.
pub fn decode_tree_node_index(key: &[u8]) -> KeyResult<u64> {
    let rest = data_payload(key, data::TREE)?;
    let (index, used) = read_uint(rest)?;
    finish(index, &rest[used..])
}

/// Extracts `(index, page_type)` from a [`bitfield`] key.
pub fn decode_bitfield_index(key: &[u8]) -> KeyResult<(u64, u64)> {
    let rest = data_payload(key, data::BITFIELD)?;
    let (index, used) = read_uint(rest)?;
    let rest = &rest[used..];
    let (page_type, used) = read_uint(rest)?;
    finish((index, page_type), &rest[used..])
}

/// Extracts the user key from a [`user_data`] key.
pub fn decode_user_data_key(key: &[u8]) -> KeyResult<String> {
    let rest = data_payload(key, data::USER_DATA)?;
    let (raw, used) = read_bytes(rest)?;
    let name =
        String::from_utf8(raw).map_err(|_| KeyError::Malformed("user data key is not utf-8"))?;
    finish(name, &rest[used..])
}

/// Extracts the raw key from a [`local`] key.
pub fn decode_local_key(key: &[u8]) -> KeyResult<Vec<u8>> {
    let rest = data_payload(key, data::LOCAL)?;
    let (raw, used) = read_bytes(rest)?;
    finish(raw, &rest[used..])
}

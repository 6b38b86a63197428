use super::helpers::*;
use crate::*;
use anyhow::Result;
use backend::{KvStore, MemoryBackend, WriteBatch};
use config::StoreConfig;
use records::{Alias, CoreAuth, CoreIndex, CoreRecord, Dependency, KeyPair, Record, TreeNode};
use std::sync::Arc;

fn alias(name: &str, ns: u8) -> Alias {
    Alias {
        name: name.to_string(),
        namespace: [ns; 32],
    }
}

// -------------------- Registration --------------------

#[test]
fn create_core_writes_auth() -> Result<()> {
    let store = open_memory();
    let opts = CreateCore {
        manifest: Some(b"manifest".to_vec()),
        key_pair: Some(KeyPair {
            public_key: [7; 32],
            secret_key: vec![8; 64],
        }),
        encryption_key: Some(vec![9; 32]),
        ..CreateCore::new([5; 32], dk(1))
    };
    let core = store.create_core(opts)?;
    assert_eq!(core.discovery_key(), &dk(1));

    let mut r = core.read()?;
    let auth = r.get_auth();
    r.flush()?;
    assert_eq!(
        auth.get()?,
        Some(CoreAuth {
            key: [5; 32],
            discovery_key: dk(1),
            manifest: Some(b"manifest".to_vec()),
            key_pair: Some(KeyPair {
                public_key: [7; 32],
                secret_key: vec![8; 64],
            }),
            encryption_key: Some(vec![9; 32]),
        })
    );
    Ok(())
}

#[test]
fn has_and_resume() -> Result<()> {
    let store = open_memory();
    assert!(!store.has(&dk(1))?);
    assert!(store.resume_core(&dk(1))?.is_none());

    let created = create(&store, 1);
    write_blocks(&created, &[(0, "a")]);
    assert!(store.has(&dk(1))?);

    let resumed = store.resume_core(&dk(1))?.expect("core exists");
    assert_eq!(resumed.pointers(), created.pointers());
    assert!(Arc::ptr_eq(&resumed.shared, &created.shared));
    assert_eq!(read_block(&resumed, 0), Some(b"a".to_vec()));
    Ok(())
}

#[test]
fn discovery_keys_are_listed_in_order() -> Result<()> {
    let store = open_memory();
    for n in [3u8, 1, 2] {
        create(&store, n);
    }
    assert_eq!(store.discovery_keys()?, vec![dk(1), dk(2), dk(3)]);
    Ok(())
}

// -------------------- Aliases --------------------

#[test]
fn alias_lookup_and_listing() -> Result<()> {
    let store = open_memory();
    for (n, name, ns) in [(1u8, "main", 1u8), (2, "other", 1), (3, "main", 2)] {
        store.create_core(CreateCore {
            alias: Some(alias(name, ns)),
            ..CreateCore::new([n; 32], dk(n))
        })?;
    }
    create(&store, 4);

    assert_eq!(store.alias(&alias("main", 1))?, Some(dk(1)));
    assert_eq!(store.alias(&alias("main", 2))?, Some(dk(3)));
    assert_eq!(store.alias(&alias("missing", 1))?, None);

    let scoped = store.aliases(Some(&[1; 32]))?;
    assert_eq!(
        scoped,
        vec![(alias("main", 1), dk(1)), (alias("other", 1), dk(2))]
    );
    assert_eq!(store.aliases(None)?.len(), 3);
    Ok(())
}

#[test]
fn alias_reregistration_last_wins() -> Result<()> {
    let store = open_memory();
    for n in [1u8, 2] {
        store.create_core(CreateCore {
            alias: Some(alias("main", 1)),
            ..CreateCore::new([n; 32], dk(n))
        })?;
    }
    assert_eq!(store.alias(&alias("main", 1))?, Some(dk(2)));
    assert_eq!(store.aliases(None)?.len(), 1);
    Ok(())
}

// -------------------- Dependencies --------------------

/// Registers a core at data pointer 9 that depends on partition 7 below
/// index 10, writing the records directly.
fn forked_store() -> Result<(Arc<MemoryBackend>, Store)> {
    let backend = Arc::new(MemoryBackend::new());
    let mut batch = WriteBatch::new();
    batch.try_put(
        keys::discovery_key(&dk(1)),
        CoreIndex { core_pointer: 0 }.encode(),
    );
    batch.try_put(
        keys::core(0),
        CoreRecord {
            core_pointer: 0,
            data_pointer: 9,
            alias: None,
        }
        .encode(),
    );
    batch.try_put(
        keys::data_dependency(9),
        Dependency {
            data_pointer: 7,
            length: 10,
        }
        .encode(),
    );
    batch.try_put(keys::block(7, 5), b"old".to_vec());
    batch.try_put(keys::block(9, 5), b"shadowed".to_vec());
    batch.try_put(keys::block(9, 15), b"new".to_vec());
    batch.try_put(keys::block(7, 15), b"stale".to_vec());
    backend.write(batch)?;
    let store = Store::open(backend.clone(), StoreConfig::default())?;
    Ok((backend, store))
}

#[test]
fn blocks_resolve_through_dependencies() -> Result<()> {
    let (_backend, store) = forked_store()?;
    let core = store.resume_core(&dk(1))?.expect("core exists");
    assert_eq!(
        core.dependencies(),
        &[Dependency {
            data_pointer: 7,
            length: 10
        }]
    );
    assert_eq!(read_block(&core, 5), Some(b"old".to_vec()));
    assert_eq!(read_block(&core, 15), Some(b"new".to_vec()));
    Ok(())
}

#[test]
fn tree_nodes_resolve_like_blocks() -> Result<()> {
    let (backend, store) = forked_store()?;
    let node = |index: u64, fill: u8| TreeNode {
        index,
        size: 1,
        hash: [fill; 32],
    };
    let mut batch = WriteBatch::new();
    batch.try_put(keys::tree_node(7, 4), node(4, 7).encode());
    batch.try_put(keys::tree_node(9, 12), node(12, 9).encode());
    backend.write(batch)?;

    let core = store.resume_core(&dk(1))?.expect("core exists");
    let mut r = core.read()?;
    let low = r.get_tree_node(4);
    let high = r.get_tree_node(12);
    r.flush()?;
    assert_eq!(low.get()?, Some(node(4, 7)));
    assert_eq!(high.get()?, Some(node(12, 9)));

    let scanned: Vec<u64> = core
        .tree_nodes(0, None, false)?
        .map(|n| n.map(|n| n.index))
        .collect::<StorageResult<_>>()?;
    assert_eq!(scanned, vec![4, 12]);
    Ok(())
}

#[test]
fn block_scan_splits_at_dependency_boundaries() -> Result<()> {
    let (_backend, store) = forked_store()?;
    let core = store.resume_core(&dk(1))?.expect("core exists");

    let forward: Vec<(u64, Vec<u8>)> = core
        .blocks(0, None, false)?
        .collect::<StorageResult<_>>()?;
    assert_eq!(
        forward,
        vec![(5, b"old".to_vec()), (15, b"new".to_vec())],
        "shadowed and stale entries are skipped"
    );

    let reverse: Vec<u64> = core
        .blocks(0, None, true)?
        .map(|b| b.map(|(i, _)| i))
        .collect::<StorageResult<_>>()?;
    assert_eq!(reverse, vec![15, 5]);

    let bounded: Vec<u64> = core
        .blocks(6, Some(16), false)?
        .map(|b| b.map(|(i, _)| i))
        .collect::<StorageResult<_>>()?;
    assert_eq!(bounded, vec![15]);
    Ok(())
}

#[test]
fn dependency_change_reaches_open_handles() -> Result<()> {
    let store = open_memory();
    let parent = create(&store, 1);
    write_blocks(&parent, &[(0, "parent")]);
    let core = create(&store, 2);
    let dep = Dependency {
        data_pointer: parent.pointers().data_pointer,
        length: 10,
    };

    let mut w = core.write();
    w.set_dependency(&dep);
    w.flush()?;

    // `core` keeps the partition live, so this reuses its shared state
    let reopened = store.resume_core(&dk(2))?.expect("core exists");
    assert_eq!(reopened.dependencies(), vec![dep]);
    assert_eq!(core.dependencies(), vec![dep]);
    assert_eq!(read_block(&reopened, 0), Some(b"parent".to_vec()));

    let mut w = core.write();
    w.delete_dependency();
    w.flush()?;
    assert!(reopened.dependencies().is_empty());
    assert_eq!(read_block(&core, 0), None);
    Ok(())
}

#[test]
fn dependency_change_reaches_sessions_below() -> Result<()> {
    let store = open_memory();
    let parent = create(&store, 1);
    write_blocks(&parent, &[(0, "parent")]);
    let core = create(&store, 2);
    let session = core.create_session("draft", 5)?;
    assert_eq!(read_block(&session, 0), None);

    let mut w = core.write();
    w.set_dependency(&Dependency {
        data_pointer: parent.pointers().data_pointer,
        length: 3,
    });
    w.flush()?;

    assert_eq!(session.dependencies().len(), 2);
    assert_eq!(read_block(&session, 0), Some(b"parent".to_vec()));
    Ok(())
}

// -------------------- Sessions --------------------

#[test]
fn session_reads_parent_below_length() -> Result<()> {
    let store = open_memory();
    let core = create(&store, 1);
    write_blocks(&core, &[(0, "a"), (1, "b"), (2, "c")]);

    let session = core.create_session("draft", 2)?;
    assert_ne!(session.pointers().data_pointer, core.pointers().data_pointer);
    assert_eq!(session.pointers().core_pointer, core.pointers().core_pointer);
    assert_eq!(
        session.dependencies(),
        &[Dependency {
            data_pointer: core.pointers().data_pointer,
            length: 2
        }]
    );

    assert_eq!(read_block(&session, 1), Some(b"b".to_vec()));
    assert_eq!(read_block(&session, 2), None, "index 2 belongs to the session");

    write_blocks(&session, &[(2, "z")]);
    assert_eq!(read_block(&session, 2), Some(b"z".to_vec()));
    assert_eq!(read_block(&core, 2), Some(b"c".to_vec()));
    Ok(())
}

#[test]
fn sessions_are_listed_and_resumable() -> Result<()> {
    let store = open_memory();
    let core = create(&store, 1);
    let a = core.create_session("a", 0)?;
    let b = core.create_session("b", 0)?;

    let names: Vec<String> = core.sessions()?.into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    // sessions are listed from the root, whichever handle asks
    assert_eq!(a.sessions()?.len(), 2);

    let resumed = core.resume_session("b")?.expect("session exists");
    assert_eq!(resumed.pointers(), b.pointers());
    assert!(core.resume_session("c")?.is_none());
    Ok(())
}

#[test]
fn nested_session_lengths_are_clamped() -> Result<()> {
    let store = open_memory();
    let core = create(&store, 1);
    let root = core.pointers().data_pointer;
    let first = core.create_session("first", 4)?;
    let second = first.create_session("second", 10)?;

    assert_eq!(
        second.dependencies(),
        &[
            Dependency {
                data_pointer: root,
                length: 4
            },
            Dependency {
                data_pointer: first.pointers().data_pointer,
                length: 10
            },
        ]
    );
    Ok(())
}

#[test]
fn snapshot_handles_reject_sessions() {
    let store = open_memory();
    let core = create(&store, 1);
    let snap = core.snapshot().unwrap();
    assert!(matches!(
        snap.create_session("s", 0),
        Err(StorageError::ReadOnly)
    ));
}

use super::helpers::*;
use crate::*;
use anyhow::Result;
use config::StoreConfig;
use std::fs;
use tempfile::tempdir;

// -------------------- Restart through the write-ahead log --------------------

#[test]
fn counters_resume_after_restart() -> Result<()> {
    let dir = tempdir()?;
    let config = StoreConfig::default().with_wal(dir.path().join("store.wal"), true);

    {
        let store = Store::from_config(config.clone())?;
        create(&store, 1);
        create(&store, 2);
        store.set_seed([7; 32], false)?;
        store.close()?;
    }

    let store = Store::from_config(config)?;
    let head = store.head()?;
    assert_eq!(head.allocated.cores, 2);
    assert_eq!(head.allocated.datas, 2);
    assert_eq!(store.seed()?, Some([7; 32]));

    let third = create(&store, 3);
    assert_eq!(
        third.pointers(),
        Pointers {
            core_pointer: 2,
            data_pointer: 2
        }
    );
    Ok(())
}

#[test]
fn core_data_and_sessions_survive_restart() -> Result<()> {
    let dir = tempdir()?;
    let config = StoreConfig::default().with_wal(dir.path().join("store.wal"), false);

    let (core_pointers, session_pointers) = {
        let store = Store::from_config(config.clone())?;
        let core = create(&store, 1);
        write_blocks(&core, &[(0, "a"), (1, "b")]);
        let session = core.create_session("draft", 1)?;
        write_blocks(&session, &[(1, "s")]);

        let atom = store.create_atom();
        write_blocks(&core.atomize(&atom), &[(2, "atomic")]);
        atom.flush()?;
        store.close()?;
        (core.pointers(), session.pointers())
    };

    let store = Store::from_config(config)?;
    let core = store.resume_core(&dk(1))?.expect("core survives");
    assert_eq!(core.pointers(), core_pointers);
    assert_eq!(read_block(&core, 1), Some(b"b".to_vec()));
    assert_eq!(read_block(&core, 2), Some(b"atomic".to_vec()));

    let session = core.resume_session("draft")?.expect("session survives");
    assert_eq!(session.pointers(), session_pointers);
    assert_eq!(session.dependencies().len(), 1);
    assert_eq!(read_block(&session, 0), Some(b"a".to_vec()));
    assert_eq!(read_block(&session, 1), Some(b"s".to_vec()));
    Ok(())
}

#[test]
fn store_opens_from_toml_config() -> Result<()> {
    let dir = tempdir()?;
    let wal = dir.path().join("feeds.wal");
    let path = dir.path().join("store.toml");
    fs::write(
        &path,
        format!(
            "flush_threshold = 4\n\n[wal]\npath = {:?}\nsync = true\n",
            wal.display().to_string()
        ),
    )?;

    let config = StoreConfig::load(&path)?;
    let store = Store::from_config(config)?;
    assert_eq!(store.config().flush_threshold, 4);
    create(&store, 1);
    store.close()?;
    assert!(wal.exists());
    Ok(())
}

#[test]
fn closed_store_rejects_work() -> Result<()> {
    let store = open_memory();
    let core = create(&store, 1);
    store.close()?;
    store.close()?;
    assert!(matches!(core.read(), Err(StorageError::Backend(_))));
    assert!(store.has(&dk(1)).is_err());
    Ok(())
}

#[test]
fn suspended_store_rejects_writes_until_resumed() -> Result<()> {
    let store = open_memory();
    let core = create(&store, 1);
    store.suspend()?;

    let mut w = core.write();
    w.put_block(0, b"x".to_vec());
    assert!(matches!(w.flush(), Err(StorageError::Backend(_))));
    assert_eq!(read_block(&core, 0), None, "reads still served");

    store.resume()?;
    write_blocks(&core, &[(0, "x")]);
    assert_eq!(read_block(&core, 0), Some(b"x".to_vec()));
    Ok(())
}

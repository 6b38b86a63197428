use super::*;
use backend::{BackendError, Entry, KvIter, MemoryBackend};
use proptest::prelude::*;

// -------------------- Helpers --------------------

fn k(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

fn backing(pairs: &[(&str, &str)]) -> MemoryBackend {
    let db = MemoryBackend::new();
    let mut b = WriteBatch::new();
    for (key, value) in pairs {
        b.try_put(k(key), k(value));
    }
    db.write(b).unwrap();
    db
}

fn collect(iter: impl Iterator<Item = BackendResult<Entry>>) -> Vec<(String, String)> {
    iter.map(|e| {
        let (key, value) = e.unwrap();
        (
            String::from_utf8(key).unwrap(),
            String::from_utf8(value).unwrap(),
        )
    })
    .collect()
}

fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
    list.iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
}

/// Backing reader whose cursor fails after `ok` entries.
struct Flaky {
    entries: Vec<Entry>,
    ok: usize,
}

impl KvRead for Flaky {
    fn get(&self, _key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        Err(BackendError::Corrupt)
    }

    fn iter(&self, _range: &KeyRange, _reverse: bool) -> BackendResult<KvIter> {
        let ok: Vec<BackendResult<Entry>> =
            self.entries.iter().take(self.ok).cloned().map(Ok).collect();
        Ok(Box::new(
            ok.into_iter()
                .chain(std::iter::once(Err(BackendError::Corrupt)))
                .chain(std::iter::once(Ok((k("zz"), k("late"))))),
        ))
    }
}

// -------------------- Point reads --------------------

#[test]
fn get_after_put_delete_and_range() {
    let db = backing(&[("a", "0"), ("b", "0"), ("c", "0"), ("d", "0")]);
    let mut log = ChangeLog::new();

    log.put(k("a"), k("1"));
    assert_eq!(log.get(b"a", &db).unwrap(), Some(k("1")));

    log.delete(k("b"));
    assert_eq!(log.get(b"b", &db).unwrap(), None);

    log.delete_range(k("c"), k("d"));
    assert_eq!(log.get(b"c", &db).unwrap(), None);
    // end is exclusive
    assert_eq!(log.get(b"d", &db).unwrap(), Some(k("0")));
    // untouched keys fall through
    assert_eq!(log.get(b"x", &db).unwrap(), None);
}

#[test]
fn later_changes_win() {
    let db = MemoryBackend::new();
    let mut log = ChangeLog::new();
    log.put(k("a"), k("1"));
    log.delete_range(k("a"), k("b"));
    assert_eq!(log.get(b"a", &db).unwrap(), None);

    log.put(k("a"), k("2"));
    assert_eq!(log.get(b"a", &db).unwrap(), Some(k("2")));

    log.delete(k("a"));
    log.put(k("a"), k("3"));
    assert_eq!(log.get(b"a", &db).unwrap(), Some(k("3")));
}

#[test]
fn empty_log_delegates_without_indexing() {
    let db = backing(&[("a", "1")]);
    let mut log = ChangeLog::new();
    assert_eq!(log.get(b"a", &db).unwrap(), Some(k("1")));
    assert!(log.is_empty());
}

#[test]
fn lookup_sees_unindexed_tail() {
    let mut log = ChangeLog::new();
    log.put(k("a"), k("1"));
    log.index_all();
    log.put(k("a"), k("2"));
    log.delete_range(k("m"), k("p"));
    assert_eq!(log.lookup(b"a"), Lookup::Value(b"2"));
    assert_eq!(log.lookup(b"n"), Lookup::Deleted);
    assert_eq!(log.lookup(b"z"), Lookup::Miss);
}

#[test]
fn inverted_range_delete_is_ignored() {
    let db = backing(&[("b", "1")]);
    let mut log = ChangeLog::new();
    log.delete_range(k("c"), k("a"));
    assert_eq!(log.get(b"b", &db).unwrap(), Some(k("1")));
    assert_eq!(
        collect(log.iter(&db, &KeyRange::all(), false).unwrap()),
        pairs(&[("b", "1")])
    );
}

// -------------------- Snapshots --------------------

#[test]
fn snapshot_isolated_from_later_mutation() {
    let mut log = ChangeLog::new();
    log.put(k("a"), k("1"));
    let snap = log.snapshot();

    log.put(k("a"), k("2"));
    log.delete_range(k("a"), k("z"));
    log.apply(&[Change::Put {
        key: k("b"),
        value: k("3"),
    }])
    .unwrap();

    assert_eq!(snap.lookup(b"a"), Lookup::Value(b"1"));
    assert_eq!(snap.lookup(b"b"), Lookup::Miss);
    assert_eq!(snap.len(), 1);
    assert_eq!(log.len(), 4);
}

#[test]
fn snapshot_shares_arrays_until_mutation() {
    let mut log = ChangeLog::new();
    log.put(k("a"), k("1"));
    let snap = log.snapshot();
    assert!(Arc::ptr_eq(&log.changes, &snap.changes));

    log.put(k("b"), k("2"));
    assert!(!Arc::ptr_eq(&log.changes, &snap.changes));
}

#[test]
fn apply_on_snapshot_is_illegal() {
    let mut log = ChangeLog::new();
    let mut snap = log.snapshot();
    assert!(snap.is_snapshot());
    assert_eq!(
        snap.apply(&[Change::Delete { key: k("a") }]),
        Err(ChangeLogError::IllegalMutation)
    );
    assert!(log.apply(&[]).is_ok());
}

#[test]
fn clear_leaves_snapshots_alone() {
    let mut log = ChangeLog::new();
    log.put(k("a"), k("1"));
    let snap = log.snapshot();
    log.clear();
    assert!(log.is_empty());
    assert_eq!(log.lookup(b"a"), Lookup::Miss);
    assert_eq!(snap.lookup(b"a"), Lookup::Value(b"1"));
}

#[test]
fn truncate_rolls_back_indexed_changes() {
    let db = backing(&[("a", "0")]);
    let mut log = ChangeLog::new();
    log.put(k("b"), k("1"));
    let mark = log.len();
    log.delete(k("a"));
    log.put(k("b"), k("2"));
    assert_eq!(log.get(b"b", &db).unwrap(), Some(k("2")));

    log.truncate(mark);
    assert_eq!(log.get(b"a", &db).unwrap(), Some(k("0")));
    assert_eq!(log.get(b"b", &db).unwrap(), Some(k("1")));
}

// -------------------- Flush --------------------

#[test]
fn flush_replays_in_order() {
    let db = backing(&[("a", "0"), ("b", "0"), ("c", "0")]);
    let mut log = ChangeLog::new();
    log.delete_range(k("a"), k("c"));
    log.put(k("b"), k("new"));
    log.delete(k("c"));
    log.flush(&db).unwrap();

    assert_eq!(
        collect(db.iter(&KeyRange::all(), false).unwrap()),
        pairs(&[("b", "new")])
    );
    assert_eq!(log.to_batch().len(), 3);
}

// -------------------- Merged iteration --------------------

#[test]
fn merge_forward_and_reverse() {
    let db = backing(&[("a", "0"), ("c", "0"), ("e", "0"), ("g", "0")]);
    let mut log = ChangeLog::new();
    log.put(k("b"), k("1"));
    log.put(k("c"), k("2"));
    log.delete(k("e"));
    log.delete_range(k("f"), k("h"));
    log.put(k("h"), k("3"));

    let forward = collect(log.iter(&db, &KeyRange::all(), false).unwrap());
    assert_eq!(
        forward,
        pairs(&[("a", "0"), ("b", "1"), ("c", "2"), ("h", "3")])
    );

    let reverse = collect(log.iter(&db, &KeyRange::all(), true).unwrap());
    assert_eq!(
        reverse,
        pairs(&[("h", "3"), ("c", "2"), ("b", "1"), ("a", "0")])
    );
}

#[test]
fn merge_respects_bounds() {
    let db = backing(&[("a", "0"), ("c", "0"), ("e", "0")]);
    let mut log = ChangeLog::new();
    log.put(k("b"), k("1"));
    log.put(k("d"), k("1"));
    log.put(k("f"), k("1"));

    let range = KeyRange::new(k("b"), k("e"));
    assert_eq!(
        collect(log.iter(&db, &range, false).unwrap()),
        pairs(&[("b", "1"), ("c", "0"), ("d", "1")])
    );
    assert_eq!(
        collect(log.iter(&db, &range, true).unwrap()),
        pairs(&[("d", "1"), ("c", "0"), ("b", "1")])
    );
    assert!(collect(log.iter(&db, &KeyRange::new(k("c"), k("c")), false).unwrap()).is_empty());
}

#[test]
fn pending_puts_drain_after_backing_ends() {
    let db = backing(&[("a", "0")]);
    let mut log = ChangeLog::new();
    log.put(k("x"), k("1"));
    log.put(k("y"), k("2"));
    log.delete(k("z"));
    assert_eq!(
        collect(log.iter(&db, &KeyRange::all(), false).unwrap()),
        pairs(&[("a", "0"), ("x", "1"), ("y", "2")])
    );
}

#[test]
fn overlapping_ranges_resolve_positionally() {
    let db = backing(&[("a", "0"), ("b", "0"), ("c", "0"), ("d", "0"), ("e", "0")]);
    let mut log = ChangeLog::new();
    log.delete_range(k("a"), k("c"));
    log.delete_range(k("b"), k("e"));
    log.put(k("c"), k("1"));

    let want = pairs(&[("c", "1"), ("e", "0")]);
    assert_eq!(collect(log.iter(&db, &KeyRange::all(), false).unwrap()), want);
    let mut rev = want;
    rev.reverse();
    assert_eq!(collect(log.iter(&db, &KeyRange::all(), true).unwrap()), rev);
}

#[test]
fn backing_error_is_yielded_once_then_fused() {
    let flaky = Flaky {
        entries: vec![(k("a"), k("0")), (k("c"), k("0"))],
        ok: 1,
    };
    let mut log = ChangeLog::new();
    log.put(k("b"), k("1"));
    let mut it = log.iter(&flaky, &KeyRange::all(), false).unwrap();

    assert_eq!(it.next().unwrap().unwrap().0, k("a"));
    assert!(matches!(it.next(), Some(Err(BackendError::Corrupt))));
    assert!(it.next().is_none());
    assert!(it.next().is_none());
}

#[test]
fn backing_is_pulled_lazily() {
    let db = MemoryBackend::new();
    let mut b = WriteBatch::new();
    for i in 0..100u8 {
        b.try_put(vec![i], vec![i]);
    }
    db.write(b).unwrap();

    let mut log = ChangeLog::new();
    log.put(vec![0, 1], vec![9]);
    let first: Vec<_> = log
        .iter(&db, &KeyRange::all(), false)
        .unwrap()
        .take(3)
        .map(|e| e.unwrap().0)
        .collect();
    assert_eq!(first, vec![vec![0], vec![0, 1], vec![1]]);
}

// -------------------- OverlayView --------------------

#[test]
fn overlay_views_stack() {
    let db = backing(&[("a", "0"), ("b", "0"), ("c", "0")]);
    let base: Arc<dyn KvRead> = db.snapshot().unwrap();

    let mut lower = ChangeLog::new();
    lower.put(k("b"), k("1"));
    lower.delete(k("c"));
    let lower_view: Arc<dyn KvRead> = Arc::new(OverlayView::new(lower.snapshot(), base));

    let mut upper = ChangeLog::new();
    upper.put(k("c"), k("2"));
    upper.delete(k("a"));
    let view = OverlayView::new(upper.snapshot(), lower_view);

    assert_eq!(view.get(b"a").unwrap(), None);
    assert_eq!(view.get(b"b").unwrap(), Some(k("1")));
    assert_eq!(view.get(b"c").unwrap(), Some(k("2")));
    assert_eq!(
        view.get_many(&[k("c"), k("b"), k("zz"), k("a")]).unwrap(),
        vec![Some(k("2")), Some(k("1")), None, None]
    );
    assert_eq!(
        collect(view.iter(&KeyRange::all(), false).unwrap()),
        pairs(&[("b", "1"), ("c", "2")])
    );
}

#[test]
fn overlay_view_ignores_later_log_writes() {
    let db = backing(&[]);
    let mut log = ChangeLog::new();
    log.put(k("a"), k("1"));
    let view = OverlayView::new(log.snapshot(), db.snapshot().unwrap());
    log.put(k("a"), k("2"));
    assert_eq!(view.get(b"a").unwrap(), Some(k("1")));
    assert_eq!(view.log().len(), 1);
}

// -------------------- Model check --------------------

#[derive(Debug, Clone)]
enum Op {
    Put(u8, u8),
    Delete(u8),
    DeleteRange(u8, u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..24, any::<u8>()).prop_map(|(k, v)| Op::Put(k, v)),
        2 => (0u8..24).prop_map(Op::Delete),
        1 => (0u8..24, 0u8..24).prop_map(|(a, b)| Op::DeleteRange(a, b)),
    ]
}

proptest! {
    /// Iterating the overlay equals iterating the backing store after the
    /// changes are applied to it.
    #[test]
    fn merged_iteration_matches_model(
        seed in proptest::collection::btree_map(0u8..24, any::<u8>(), 0..16),
        ops in proptest::collection::vec(op(), 0..32),
        lo in 0u8..24,
        hi in 0u8..26,
        reverse in any::<bool>(),
    ) {
        let db = MemoryBackend::new();
        let mut b = WriteBatch::new();
        for (key, value) in &seed {
            b.try_put(vec![*key], vec![*value]);
        }
        db.write(b).unwrap();

        let mut model = seed.clone();
        let mut log = ChangeLog::new();
        for op in &ops {
            match *op {
                Op::Put(key, value) => {
                    log.put(vec![key], vec![value]);
                    model.insert(key, value);
                }
                Op::Delete(key) => {
                    log.delete(vec![key]);
                    model.remove(&key);
                }
                Op::DeleteRange(a, z) => {
                    log.delete_range(vec![a], vec![z]);
                    model.retain(|key, _| !(*key >= a && *key < z));
                }
            }
        }

        let range = KeyRange::new(vec![lo], vec![hi]);
        let mut want: Vec<Entry> = model
            .iter()
            .filter(|(key, _)| **key >= lo && **key < hi)
            .map(|(key, value)| (vec![*key], vec![*value]))
            .collect();
        if reverse {
            want.reverse();
        }
        let got: Vec<Entry> = log
            .iter(&db, &range, reverse)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        prop_assert_eq!(got, want);

        for key in 0u8..24 {
            let got = log.get(&[key], &db).unwrap();
            prop_assert_eq!(got, model.get(&key).map(|v| vec![*v]));
        }

        // flushing produces the same state
        log.flush(&db).unwrap();
        let flushed: Vec<Entry> = db
            .iter(&KeyRange::all(), false)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        let all: Vec<Entry> = model.iter().map(|(key, value)| (vec![*key], vec![*value])).collect();
        prop_assert_eq!(flushed, all);
    }
}

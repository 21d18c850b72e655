//! The query engine running against the real storage kernel.

use nervusdb_api::{Direction, GraphView, IndexOrder, TripleCriteria, Uniqueness};
use nervusdb_query::{Criteria, QueryEngine, select_order};
use nervusdb_storage::{PersistentStore, StoreOptions};
use std::collections::BTreeSet;
use tempfile::tempdir;

fn populated(dir: &std::path::Path) -> PersistentStore {
    let mut store = PersistentStore::open(dir.join("graph.synapse"), StoreOptions::default())
        .unwrap();
    // 1,000 facts: one predicate, 100 subjects, a shared well-known object.
    for i in 0..1000 {
        let object = if i % 10 == 0 {
            "X".to_string()
        } else {
            format!("o{i}")
        };
        store
            .add_fact(&format!("s{}", i % 100), "R", &object)
            .unwrap();
    }
    store.flush().unwrap();
    store
}

#[test]
fn order_selection_matches_the_fixed_dimensions() {
    let dir = tempdir().unwrap();
    let store = populated(dir.path());
    let view = store.view();
    let engine = QueryEngine::new(&view);

    let r = view.lookup_id("R").unwrap();
    let x = view.lookup_id("X").unwrap();
    let s1 = view.lookup_id("s1").unwrap();

    let by_po = TripleCriteria {
        s: None,
        p: Some(r),
        o: Some(x),
    };
    let by_sp = TripleCriteria {
        s: Some(s1),
        p: Some(r),
        o: None,
    };
    assert_eq!(select_order(&by_po), IndexOrder::Pos);
    assert_eq!(select_order(&by_sp), IndexOrder::Spo);

    // Both plans agree with a brute-force filter over the full scan.
    let everything: BTreeSet<_> = view.scan(IndexOrder::Spo, None, None).collect();
    let po_scan: BTreeSet<_> = engine.query_ids(by_po).collect();
    let po_brute: BTreeSet<_> = everything
        .iter()
        .copied()
        .filter(|t| t.p == r && t.o == x)
        .collect();
    // i % 10 == 0 lands on ten distinct subjects, so ten (s, R, X) facts.
    assert_eq!(po_scan, po_brute);
    assert_eq!(po_scan.len(), 10);

    let sp_scan: BTreeSet<_> = engine.query_ids(by_sp).collect();
    let sp_brute: BTreeSet<_> = everything
        .iter()
        .copied()
        .filter(|t| t.s == s1 && t.p == r)
        .collect();
    assert_eq!(sp_scan, sp_brute);
    assert_eq!(sp_scan.len(), 10);
}

#[test]
fn staged_and_paged_facts_merge_in_queries() {
    let dir = tempdir().unwrap();
    let mut store = PersistentStore::open(
        dir.path().join("graph.synapse"),
        StoreOptions::default(),
    )
    .unwrap();
    store.add_fact("a", "r", "paged").unwrap();
    store.flush().unwrap();
    store.add_fact("a", "r", "staged").unwrap();

    let view = store.view();
    let engine = QueryEngine::new(&view);
    let got: Vec<_> = engine
        .query_resolved(&Criteria::default().subject("a"))
        .map(|f| f.object)
        .collect();
    assert_eq!(got, vec!["paged".to_string(), "staged".to_string()]);
}

#[test]
fn traversal_crosses_the_flush_boundary() {
    let dir = tempdir().unwrap();
    let mut store = PersistentStore::open(
        dir.path().join("graph.synapse"),
        StoreOptions::default(),
    )
    .unwrap();
    store.add_fact("s", "r", "a").unwrap();
    store.add_fact("a", "r", "b").unwrap();
    store.flush().unwrap();
    store.add_fact("b", "r", "c").unwrap(); // staged only

    let view = store.view();
    let engine = QueryEngine::new(&view);
    let s = view.lookup_id("s").unwrap();
    let r = view.lookup_id("r").unwrap();

    let walked: Vec<String> = engine
        .follow_path(
            BTreeSet::from([s]),
            r,
            1,
            5,
            Direction::Forward,
            Uniqueness::Node,
            None,
        )
        .unwrap()
        .filter_map(|t| view.resolve_value(t.o))
        .collect();
    assert_eq!(walked, vec!["a", "b", "c"]);

    let back = engine.traverse(
        &BTreeSet::from([view.lookup_id("c").unwrap()]),
        r,
        Direction::Reverse,
    );
    assert_eq!(back.facts.len(), 1);
    assert_eq!(
        back.next_frontier,
        BTreeSet::from([view.lookup_id("b").unwrap()])
    );
}

#[test]
fn deleted_facts_disappear_from_every_plan() {
    let dir = tempdir().unwrap();
    let mut store = PersistentStore::open(
        dir.path().join("graph.synapse"),
        StoreOptions::default(),
    )
    .unwrap();
    store.add_fact("a", "r", "b").unwrap();
    store.add_fact("a", "r", "c").unwrap();
    store.flush().unwrap();
    store.delete_fact("a", "r", "b").unwrap();

    let view = store.view();
    let engine = QueryEngine::new(&view);
    for criteria in [
        Criteria::default().subject("a"),
        Criteria::default().predicate("r"),
        Criteria::default().object("b"),
        Criteria::default().subject("a").object("b"),
    ] {
        let hits: Vec<_> = engine
            .query(&criteria)
            .filter(|t| view.resolve_value(t.o).as_deref() == Some("b"))
            .collect();
        assert!(hits.is_empty(), "criteria {criteria:?} still sees the tombstoned fact");
    }
}

//! End-to-end behaviour of the embedded database handle.

use nervusdb::{
    CompactMode, CompactOptions, Criteria, Database, Direction, FactProps, PropertyValue,
    StoreOptions, Uniqueness,
};
use std::collections::BTreeSet;
use tempfile::tempdir;

fn db_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("graph.synapse")
}

fn facts(db: &Database) -> BTreeSet<(String, String, String)> {
    db.query(&Criteria::default())
        .into_iter()
        .map(|f| (f.subject, f.predicate, f.object))
        .collect()
}

#[test]
fn durable_batch_survives_a_crash_and_applies_once() {
    let dir = tempdir().unwrap();
    {
        let mut db = Database::open(db_path(&dir)).unwrap();
        db.begin_batch(Some("T1"), Some("session-a")).unwrap();
        db.add_fact("S", "R", "A").unwrap();
        db.commit_batch(true).unwrap();
        // Crash: dropped without close or flush.
    }
    {
        // First recovery replays T1 from the WAL.
        let db = Database::open(db_path(&dir)).unwrap();
        assert_eq!(
            facts(&db),
            BTreeSet::from([("S".into(), "R".into(), "A".into())])
        );
        assert!(db.list_tx_ids(None).iter().any(|r| r.id == "T1"));
        // Crash again: the WAL still contains COMMIT(T1).
    }
    let mut db = Database::open(db_path(&dir)).unwrap();
    assert_eq!(facts(&db).len(), 1);
    db.flush().unwrap();

    // After the flush, the registry carries T1 across the WAL reset.
    drop(db);
    let db = Database::open(db_path(&dir)).unwrap();
    assert_eq!(facts(&db).len(), 1);
    assert!(db.list_tx_ids(Some("session-a")).iter().any(|r| r.id == "T1"));
}

#[test]
fn chained_associative_traversal() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(db_path(&dir)).unwrap();
    db.add_fact("S", "R", "A").unwrap();
    db.add_fact("A", "R", "B").unwrap();
    db.add_fact("B", "R", "C").unwrap();
    db.flush().unwrap();

    let s = db.node_id("S").unwrap();
    let step1 = db.traverse(&BTreeSet::from([s]), "R", Direction::Forward);
    assert_eq!(step1.facts.len(), 1);
    assert_eq!(step1.next_frontier, BTreeSet::from([db.node_id("A").unwrap()]));

    let step2 = db.traverse(&step1.next_frontier, "R", Direction::Forward);
    assert_eq!(step2.next_frontier, BTreeSet::from([db.node_id("B").unwrap()]));

    let step3 = db.traverse(&step2.next_frontier, "R", Direction::Forward);
    assert_eq!(step3.next_frontier, BTreeSet::from([db.node_id("C").unwrap()]));

    let step4 = db.traverse(&step3.next_frontier, "R", Direction::Forward);
    assert!(step4.facts.is_empty());

    // The same walk through the variable-length API.
    let walked = db
        .follow_path(
            &BTreeSet::from([s]),
            "R",
            1,
            3,
            Direction::Forward,
            Uniqueness::Node,
        )
        .unwrap();
    assert_eq!(walked.len(), 3);
    assert_eq!(walked[2].object, "C");
}

#[test]
fn snapshot_stays_stable_across_writer_churn() {
    let dir = tempdir().unwrap();
    let mut writer = Database::open(db_path(&dir)).unwrap();
    writer.add_fact("a", "R", "b").unwrap();
    writer.flush().unwrap();

    let mut reader = Database::open_reader(db_path(&dir)).unwrap();
    let baseline = facts(&reader);
    assert_eq!(baseline.len(), 1);

    reader
        .with_snapshot(|snap| {
            let before = snap.query(&Criteria::default().predicate("R"));
            assert_eq!(before.len(), 1);

            // The writer inserts, flushes, rewrites, and tries to GC
            // while the snapshot is open.
            for i in 0..100 {
                writer.add_fact(&format!("n{i}"), "R", "b").unwrap();
            }
            writer.flush().unwrap();
            writer
                .compact(CompactOptions {
                    mode: CompactMode::Rewrite,
                    ..CompactOptions::default()
                })
                .unwrap();
            let gc = writer.garbage_collect_pages(true).unwrap();
            assert!(gc.skipped, "pinned reader must block gc");

            let after = snap.query(&Criteria::default().predicate("R"));
            assert_eq!(after, before, "pinned reads changed under churn");
        })
        .unwrap();

    // The reader catches up once it refreshes.
    reader.refresh().unwrap();
    assert_eq!(facts(&reader).len(), 101);

    reader.close().unwrap();
    let gc = writer.garbage_collect_pages(true).unwrap();
    assert!(!gc.skipped);
    assert_eq!(facts(&writer).len(), 101);
    writer.close().unwrap();
}

#[test]
fn crash_before_manifest_install_keeps_the_previous_epoch() {
    let dir = tempdir().unwrap();
    {
        let mut db = Database::open(db_path(&dir)).unwrap();
        db.add_fact("base", "R", "x").unwrap();
        db.flush().unwrap();
        db.begin_batch(Some("T-delta"), None).unwrap();
        db.add_fact("delta", "R", "y").unwrap();
        db.commit_batch(true).unwrap();

        // Model a flush that died after writing page bytes but before the
        // manifest rename: orphaned bytes at the tail of a page file.
        let spo = dir
            .path()
            .join("graph.synapse.pages")
            .join("SPO.idxpage");
        let mut bytes = std::fs::read(&spo).unwrap();
        bytes.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        std::fs::write(&spo, &bytes).unwrap();
        // Crash without flushing the delta batch.
    }

    let mut db = Database::open(db_path(&dir)).unwrap();
    // The manifest is still the old epoch, the WAL restores the delta.
    assert_eq!(facts(&db).len(), 2);
    assert!(db.check(false).unwrap().is_clean());

    // The next flush publishes a fresh epoch past the junk bytes.
    let epoch_before = db.epoch();
    db.flush().unwrap();
    assert!(db.epoch() > epoch_before);
    assert_eq!(facts(&db).len(), 2);
    assert!(db.check(false).unwrap().is_clean());
}

#[test]
fn property_documents_version_on_every_write() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(db_path(&dir)).unwrap();
    let fact = db
        .add_fact_with(
            "ada",
            "knows",
            "grace",
            FactProps {
                subject: Some(PropertyValue::Map(vec![(
                    "born".to_string(),
                    PropertyValue::Int(1815),
                )])),
                edge: Some(PropertyValue::Map(vec![(
                    "since".to_string(),
                    PropertyValue::Int(1830),
                )])),
                ..FactProps::default()
            },
        )
        .unwrap();

    let ada = fact.key.s;
    assert_eq!(db.get_node_properties(ada).unwrap().version, 1);

    // Identical overwrite still acknowledges the write.
    let v = db
        .set_node_properties(
            ada,
            &PropertyValue::Map(vec![("born".to_string(), PropertyValue::Int(1815))]),
        )
        .unwrap();
    assert_eq!(v, 2);

    db.flush().unwrap();
    drop(db);
    let db = Database::open(db_path(&dir)).unwrap();
    let doc = db.get_node_properties(db.node_id("ada").unwrap()).unwrap();
    assert_eq!(doc.version, 2);
    assert_eq!(
        doc.value.get("born").and_then(|v| v.as_f64()),
        Some(1815.0)
    );
    assert_eq!(db.get_edge_properties(fact.key).unwrap().version, 1);
}

#[test]
fn weighted_paths_read_edge_documents() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(db_path(&dir)).unwrap();
    let cheap1 = db.add_fact("a", "road", "b").unwrap();
    let cheap2 = db.add_fact("b", "road", "c").unwrap();
    let direct = db.add_fact("a", "road", "c").unwrap();
    db.set_edge_properties(
        cheap1.key,
        &PropertyValue::Map(vec![("km".to_string(), PropertyValue::Float(2.0))]),
    )
    .unwrap();
    db.set_edge_properties(
        cheap2.key,
        &PropertyValue::Map(vec![("km".to_string(), PropertyValue::Float(3.0))]),
    )
    .unwrap();
    db.set_edge_properties(
        direct.key,
        &PropertyValue::Map(vec![("km".to_string(), PropertyValue::Float(9.0))]),
    )
    .unwrap();
    db.flush().unwrap();

    let (path, cost) = db.shortest_path_weighted("a", "c", "road", "km").unwrap();
    assert_eq!(path.len(), 2);
    assert!((cost - 5.0).abs() < 1e-9);

    // Hop count beats weight when asked for the unweighted path.
    let hops = db.shortest_path("a", "c", "road", 5).unwrap();
    assert_eq!(hops.len(), 1);

    let both = db
        .bidirectional_path("a", "c", &["road"], 4)
        .unwrap();
    assert!(!both.is_empty());
}

#[test]
fn compaction_and_reopen_preserve_random_workloads() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(db_path(&dir)).unwrap();
    let mut model: BTreeSet<(String, String, String)> = BTreeSet::new();

    // Deterministic pseudo-random add/delete/flush workload.
    let mut state = 0x2545_f491_4f6c_dd1du64;
    let mut rng = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    for _ in 0..600 {
        let s = format!("s{}", rng() % 40);
        let p = format!("p{}", rng() % 3);
        let o = format!("o{}", rng() % 25);
        match rng() % 10 {
            0..=6 => {
                db.add_fact(&s, &p, &o).unwrap();
                model.insert((s, p, o));
            }
            7 | 8 => {
                db.delete_fact(&s, &p, &o).unwrap();
                model.remove(&(s, p, o));
            }
            _ => {
                db.flush().unwrap();
            }
        }
    }
    db.flush().unwrap();
    assert_eq!(facts(&db), model);

    db.compact(CompactOptions {
        mode: CompactMode::Rewrite,
        ..CompactOptions::default()
    })
    .unwrap();
    assert_eq!(facts(&db), model);

    db.garbage_collect_pages(true).unwrap();
    assert_eq!(facts(&db), model);
    db.close().unwrap();

    let db = Database::open(db_path(&dir)).unwrap();
    assert_eq!(facts(&db), model);
    assert!(db.check(false).unwrap().is_clean());
}

#[test]
fn idempotent_adds_leave_no_trace() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(db_path(&dir)).unwrap();
    db.add_fact("a", "r", "b").unwrap();
    db.add_fact("a", "r", "b").unwrap();
    db.flush().unwrap();
    db.add_fact("a", "r", "b").unwrap();
    db.flush().unwrap();

    assert_eq!(facts(&db).len(), 1);
    assert!(db.contains("a", "r", "b"));
    assert!(!db.contains("a", "r", "missing"));
}

#[test]
fn hot_groups_show_up_in_list_hot() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(db_path(&dir)).unwrap();
    db.add_fact("popular", "r", "x").unwrap();
    db.add_fact("quiet", "r", "y").unwrap();
    db.flush().unwrap();

    for _ in 0..20 {
        db.query(&Criteria::default().subject("popular"));
    }
    db.query(&Criteria::default().subject("quiet"));

    let hot = db.list_hot(1);
    assert_eq!(hot.len(), 1);
    let hottest = db.node_value(hot[0].1).unwrap();
    assert_eq!(hottest, "popular");
}

#[test]
fn reader_handle_rejects_maintenance() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(db_path(&dir)).unwrap();
        db.close().unwrap();
    }
    let mut reader = Database::open_with(
        db_path(&dir),
        StoreOptions {
            enable_lock: false,
            ..StoreOptions::default()
        },
    )
    .unwrap();
    assert!(reader.garbage_collect_pages(true).is_err());
    assert!(reader.repair().is_err());
}

//! # NervusDB Tour
//!
//! A walk through the core workflow:
//! 1. Open a database.
//! 2. Write facts and property documents in a batch.
//! 3. Query by criteria and traverse the graph.
//! 4. Flush, snapshot, and run maintenance.

use anyhow::Result;
use nervusdb::{
    CompactOptions, Criteria, Database, Direction, FactProps, PropertyValue, Uniqueness,
};
use std::collections::BTreeSet;
use tempfile::tempdir;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("tour.synapse"))?;
    println!("opened {}", db.path().display());

    // Write a small social graph in one durable batch.
    db.begin_batch(Some("tour-setup"), None)?;
    db.add_fact_with(
        "ada",
        "knows",
        "grace",
        FactProps {
            subject: Some(PropertyValue::Map(vec![(
                "born".to_string(),
                PropertyValue::Int(1815),
            )])),
            edge: Some(PropertyValue::Map(vec![(
                "weight".to_string(),
                PropertyValue::Float(1.0),
            )])),
            ..FactProps::default()
        },
    )?;
    db.add_fact("grace", "knows", "barbara")?;
    db.add_fact("ada", "wrote", "notes")?;
    db.commit_batch(true)?;

    // Staged writes are visible immediately.
    for fact in db.query(&Criteria::default().predicate("knows")) {
        println!("{} knows {}", fact.subject, fact.object);
    }

    // Chained traversal: who does ada reach transitively?
    let ada = db.node_id("ada").expect("ada was just interned");
    let reached = db.follow_path(
        &BTreeSet::from([ada]),
        "knows",
        1,
        5,
        Direction::Forward,
        Uniqueness::Node,
    )?;
    println!("ada reaches {} nodes over 'knows'", reached.len());

    // Merge to pages and pin a snapshot while we keep writing.
    db.flush()?;
    let report = db.with_snapshot(|snap| snap.query(&Criteria::default()).len())?;
    println!("snapshot saw {report} facts");

    // Maintenance: score-driven compaction plus reader-respecting GC.
    let (compact, gc) = db.auto_compact(CompactOptions::default())?;
    println!(
        "compaction rewrote {} groups, gc reclaimed {} bytes (skipped: {})",
        compact.groups_rewritten, gc.reclaimed_bytes, gc.skipped
    );

    let check = db.check(false)?;
    println!("check clean: {}", check.is_clean());
    db.close()?;
    Ok(())
}

//! # NervusDB
//!
//! An embedded triple store in the spirit of SQLite: a single-process
//! library managing `(subject, predicate, object)` facts with per-node
//! and per-edge property documents, backed by one main data file plus
//! sibling directories for paged indexes, a write-ahead log, and
//! registries.
//!
//! ## Quickstart
//!
//! ```no_run
//! use nervusdb::{Criteria, Database, Result};
//!
//! fn main() -> Result<()> {
//!     let mut db = Database::open("people.synapse")?;
//!     db.add_fact("ada", "knows", "grace")?;
//!     db.flush()?;
//!
//!     for fact in db.query(&Criteria::default().predicate("knows")) {
//!         println!("{} knows {}", fact.subject, fact.object);
//!     }
//!     db.close()
//! }
//! ```
//!
//! ## Core concepts
//!
//! - [`Database`]: the handle. One writer per database (advisory file
//!   lock); any number of reader handles across processes.
//! - Batches: `begin_batch` / `commit_batch` group mutations into one
//!   WAL transaction with idempotent replay.
//! - `flush`: merges staged writes into the paged indexes and publishes
//!   a new manifest epoch.
//! - [`Database::with_snapshot`]: pins the current epoch for a run of
//!   consistent chained queries, shielded from concurrent flushes,
//!   compaction, and GC.

mod error;

pub use error::{Error, Result};
pub use nervusdb_api::{
    Direction, Document, GraphView, IndexOrder, NodeId, PropertyValue, ResolvedTriple, Triple,
    TripleCriteria, Uniqueness,
};
pub use nervusdb_query::{Criteria, QueryEngine, TraversalStep, WeightedPath};
pub use nervusdb_storage::manifest::{Codec, Compression};
pub use nervusdb_storage::maintenance::{
    CheckReport, CompactMode, CompactOptions, CompactReport, GcReport, PageDump, RepairReport,
    ScoreWeights,
};
pub use nervusdb_storage::readers::ReaderRecord;
pub use nervusdb_storage::store::{FlushReport, PinnedView, StoreView};
pub use nervusdb_storage::txids::TxRecord;
pub use nervusdb_storage::{PersistentStore, StagingMode, StoreOptions};
use std::collections::BTreeSet;
use std::path::Path;

/// Property documents attached to a fact's endpoints and edge.
#[derive(Debug, Default, Clone)]
pub struct FactProps {
    pub subject: Option<PropertyValue>,
    pub object: Option<PropertyValue>,
    pub edge: Option<PropertyValue>,
}

/// The main database handle.
///
/// All mutations on one handle are sequenced; background maintenance
/// runs as explicit calls on the same handle.
#[derive(Debug)]
pub struct Database {
    store: PersistentStore,
}

impl Database {
    /// Opens (or creates) the database at `path` with default options:
    /// exclusive writer lock, default page size, no compression.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        Ok(Self {
            store: PersistentStore::open(path, options)?,
        })
    }

    /// Opens a read-side handle: no write lock, registered as a reader.
    pub fn open_reader(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StoreOptions::reader())
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Epoch of the currently loaded manifest.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.store.epoch()
    }

    /// Access to the underlying store for advanced callers.
    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut PersistentStore {
        &mut self.store
    }

    // ---------------------------------------------------------------
    // Facts and properties
    // ---------------------------------------------------------------

    pub fn add_fact(&mut self, s: &str, p: &str, o: &str) -> Result<ResolvedTriple> {
        Ok(self.store.add_fact(s, p, o)?)
    }

    /// Adds a fact together with its endpoint/edge documents in a single
    /// batch.
    pub fn add_fact_with(
        &mut self,
        s: &str,
        p: &str,
        o: &str,
        props: FactProps,
    ) -> Result<ResolvedTriple> {
        let owns_batch = !self.store.in_batch();
        if owns_batch {
            self.store.begin_batch(None, None)?;
        }
        let result = (|| -> Result<ResolvedTriple> {
            let fact = self.store.add_fact(s, p, o)?;
            if let Some(doc) = &props.subject {
                self.store.set_node_properties(fact.key.s, doc)?;
            }
            if let Some(doc) = &props.object {
                self.store.set_node_properties(fact.key.o, doc)?;
            }
            if let Some(doc) = &props.edge {
                self.store.set_edge_properties(fact.key, doc)?;
            }
            Ok(fact)
        })();
        if owns_batch {
            match &result {
                Ok(_) => self.store.commit_batch(false)?,
                Err(_) => {
                    let _ = self.store.abort_batch();
                }
            }
        }
        result
    }

    /// Logically deletes a fact; returns whether anything changed.
    pub fn delete_fact(&mut self, s: &str, p: &str, o: &str) -> Result<bool> {
        Ok(self.store.delete_fact(s, p, o)?)
    }

    pub fn contains(&self, s: &str, p: &str, o: &str) -> bool {
        let view = self.store.view();
        match (view.lookup_id(s), view.lookup_id(p), view.lookup_id(o)) {
            (Some(s), Some(p), Some(o)) => self.store.contains_fact(Triple::new(s, p, o)),
            _ => false,
        }
    }

    pub fn node_id(&self, value: &str) -> Option<NodeId> {
        self.store.view().lookup_id(value)
    }

    pub fn node_value(&self, id: NodeId) -> Option<String> {
        self.store.view().resolve_value(id)
    }

    /// Writes a node document, returning its new `__v`.
    pub fn set_node_properties(&mut self, id: NodeId, doc: &PropertyValue) -> Result<u64> {
        Ok(self.store.set_node_properties(id, doc)?)
    }

    pub fn get_node_properties(&self, id: NodeId) -> Option<Document> {
        self.store.get_node_properties(id)
    }

    /// Writes an edge document keyed by the full triple.
    pub fn set_edge_properties(&mut self, key: Triple, doc: &PropertyValue) -> Result<u64> {
        Ok(self.store.set_edge_properties(key, doc)?)
    }

    pub fn get_edge_properties(&self, key: Triple) -> Option<Document> {
        self.store.get_edge_properties(key)
    }

    // ---------------------------------------------------------------
    // Batches and durability
    // ---------------------------------------------------------------

    /// Opens a batch; mutations become visible to this handle
    /// immediately and durable at `commit_batch`.
    pub fn begin_batch(
        &mut self,
        tx_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<String> {
        Ok(self
            .store
            .begin_batch(tx_id.map(str::to_owned), session_id.map(str::to_owned))?)
    }

    /// With `durable`, the WAL is fsynced before returning.
    pub fn commit_batch(&mut self, durable: bool) -> Result<()> {
        Ok(self.store.commit_batch(durable)?)
    }

    pub fn abort_batch(&mut self) -> Result<()> {
        Ok(self.store.abort_batch()?)
    }

    /// Merges staged writes into the paged indexes and publishes a new
    /// epoch.
    pub fn flush(&mut self) -> Result<FlushReport> {
        Ok(self.store.flush()?)
    }

    // ---------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------

    /// Criteria lookup against the live state (staging over pages).
    /// Unknown strings yield an empty result.
    pub fn query(&self, criteria: &Criteria) -> Vec<ResolvedTriple> {
        let view = self.store.view();
        let engine = QueryEngine::new(&view);
        engine.query_resolved(criteria).collect()
    }

    /// Criteria lookup against a pinned epoch (see
    /// [`with_snapshot`](Self::with_snapshot)).
    pub fn query_at(&self, criteria: &Criteria, epoch: u64) -> Result<Vec<ResolvedTriple>> {
        let view = self.store.pinned_view(epoch)?;
        let engine = QueryEngine::new(&view);
        Ok(engine.query_resolved(criteria).collect())
    }

    /// One associative traversal layer over the live state.
    pub fn traverse(
        &self,
        frontier: &BTreeSet<NodeId>,
        predicate: &str,
        direction: Direction,
    ) -> TraversalStep {
        let view = self.store.view();
        let Some(p) = view.lookup_id(predicate) else {
            return TraversalStep::default();
        };
        QueryEngine::new(&view).traverse(frontier, p, direction)
    }

    /// Variable-length traversal emitting facts at depth `min..=max`.
    pub fn follow_path(
        &self,
        frontier: &BTreeSet<NodeId>,
        predicate: &str,
        min: usize,
        max: usize,
        direction: Direction,
        uniqueness: Uniqueness,
    ) -> Result<Vec<ResolvedTriple>> {
        let view = self.store.view();
        let Some(p) = view.lookup_id(predicate) else {
            return Ok(Vec::new());
        };
        let engine = QueryEngine::new(&view);
        let triples: Vec<Triple> = engine
            .follow_path(frontier.clone(), p, min, max, direction, uniqueness, None)?
            .collect();
        Ok(self.resolve_all(triples))
    }

    /// Fewest-hops directed path, or `None` within `max_hops`.
    pub fn shortest_path(
        &self,
        source: &str,
        target: &str,
        predicate: &str,
        max_hops: usize,
    ) -> Option<Vec<ResolvedTriple>> {
        let view = self.store.view();
        let (s, t, p) = (
            view.lookup_id(source)?,
            view.lookup_id(target)?,
            view.lookup_id(predicate)?,
        );
        let edges = QueryEngine::new(&view).shortest_path(s, t, p, max_hops)?;
        Some(self.resolve_all(edges))
    }

    /// Interleaved two-sided search over several predicates.
    pub fn bidirectional_path(
        &self,
        source: &str,
        target: &str,
        predicates: &[&str],
        max_hops: usize,
    ) -> Option<Vec<ResolvedTriple>> {
        let view = self.store.view();
        let (s, t) = (view.lookup_id(source)?, view.lookup_id(target)?);
        let ids: BTreeSet<NodeId> = predicates
            .iter()
            .filter_map(|p| view.lookup_id(p))
            .collect();
        let edges = QueryEngine::new(&view).bidirectional_path(s, t, &ids, max_hops)?;
        Some(self.resolve_all(edges))
    }

    /// Dijkstra over the numeric `weight_key` of edge documents; missing
    /// or non-finite weights count as 1.
    pub fn shortest_path_weighted(
        &self,
        source: &str,
        target: &str,
        predicate: &str,
        weight_key: &str,
    ) -> Option<(Vec<ResolvedTriple>, f64)> {
        let view = self.store.view();
        let (s, t, p) = (
            view.lookup_id(source)?,
            view.lookup_id(target)?,
            view.lookup_id(predicate)?,
        );
        let path = QueryEngine::new(&view).shortest_path_weighted(s, t, p, weight_key)?;
        Some((self.resolve_all(path.edges), path.cost))
    }

    fn resolve_all(&self, triples: Vec<Triple>) -> Vec<ResolvedTriple> {
        let view = self.store.view();
        triples
            .into_iter()
            .filter_map(|t| view.resolve_triple(t))
            .collect()
    }

    // ---------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------

    /// Pins the current epoch, runs `f` against the frozen paged state,
    /// and releases the pin. Concurrent flush/compaction/GC from other
    /// handles cannot change what `f` observes.
    pub fn with_snapshot<R>(&mut self, f: impl FnOnce(&Snapshot<'_>) -> R) -> Result<R> {
        let epoch = self.store.push_snapshot()?;
        let result = {
            let view = self.store.pinned_view(epoch)?;
            let snapshot = Snapshot { view, epoch };
            f(&snapshot)
        };
        self.store.pop_snapshot()?;
        Ok(result)
    }

    /// Explicit pin; pair with [`pop_snapshot`](Self::pop_snapshot).
    pub fn push_snapshot(&mut self) -> Result<u64> {
        Ok(self.store.push_snapshot()?)
    }

    pub fn pop_snapshot(&mut self) -> Result<()> {
        Ok(self.store.pop_snapshot()?)
    }

    /// Reloads the published state; how reader handles observe epochs
    /// published by the writer.
    pub fn refresh(&mut self) -> Result<u64> {
        Ok(self.store.refresh()?)
    }

    // ---------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------

    pub fn check(&self, strict: bool) -> Result<CheckReport> {
        Ok(self.store.check(strict)?)
    }

    pub fn repair(&mut self) -> Result<RepairReport> {
        Ok(self.store.repair()?)
    }

    pub fn compact(&mut self, options: CompactOptions) -> Result<CompactReport> {
        Ok(self.store.compact(options)?)
    }

    pub fn auto_compact(&mut self, options: CompactOptions) -> Result<(CompactReport, GcReport)> {
        Ok(self.store.auto_compact(options)?)
    }

    pub fn garbage_collect_pages(&mut self, respect_readers: bool) -> Result<GcReport> {
        Ok(self.store.garbage_collect_pages(respect_readers)?)
    }

    pub fn list_hot(&self, top: usize) -> Vec<(IndexOrder, u64, f64)> {
        self.store.list_hot(top)
    }

    /// Decoded pages of one posting group, by primary string value.
    pub fn dump_page(&self, order: IndexOrder, primary: &str) -> Vec<PageDump> {
        match self.node_id(primary) {
            Some(id) => self.store.dump_page(order, id),
            None => Vec::new(),
        }
    }

    pub fn list_readers(&self) -> Result<Vec<ReaderRecord>> {
        Ok(self.store.list_readers()?)
    }

    pub fn list_tx_ids(&self, session_id: Option<&str>) -> Vec<TxRecord> {
        self.store.list_tx_ids(session_id, None)
    }

    /// Graceful shutdown: flush (writer handles), unregister, unlock.
    pub fn close(self) -> Result<()> {
        Ok(self.store.close()?)
    }
}

/// A pinned-epoch read handle produced by [`Database::with_snapshot`].
pub struct Snapshot<'a> {
    view: PinnedView<'a>,
    epoch: u64,
}

impl<'a> Snapshot<'a> {
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Criteria lookup against the frozen paged state only.
    pub fn query(&self, criteria: &Criteria) -> Vec<ResolvedTriple> {
        QueryEngine::new(&self.view).query_resolved(criteria).collect()
    }

    pub fn view(&self) -> &PinnedView<'a> {
        &self.view
    }
}

//! The persistent store: opens the database, composes the kernel pieces,
//! and serves every public operation.
//!
//! One handle is single-threaded cooperative: mutations take `&mut self`
//! and are sequenced by the borrow checker; cross-process exclusion is the
//! advisory file lock. Readers in other processes see a new epoch after
//! `refresh`.

use crate::datafile;
use crate::dictionary::Dictionary;
use crate::hotness::HotnessTracker;
use crate::lock::FileLock;
use crate::manifest::{Compression, Manifest};
use crate::page;
use crate::paged::PagedIndex;
use crate::properties::{PropertyStore, StoredDoc};
use crate::readers::{ReaderGuard, ReaderRecord, ReaderRegistry};
use crate::staging::StagingIndex;
use crate::triples::TripleStore;
use crate::txids::{self, TxIdRegistry, TxRecord};
use crate::wal::{Wal, WalRecord};
use crate::{DEFAULT_PAGE_SIZE, Error, Result};
use chrono::{DateTime, Utc};
use nervusdb_api::{Document, GraphView, IndexOrder, NodeId, PropertyValue, ResolvedTriple, Triple};
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StagingMode {
    /// Merge a flush group into its primary's last page when it fits.
    #[default]
    Default,
    /// Always append fresh pages; leave merging to compaction.
    LsmLite,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Overrides the default `P.pages` sibling directory.
    pub index_directory: Option<PathBuf>,
    /// Triples-per-page bound.
    pub page_size: usize,
    /// Create an empty manifest when none exists next to an existing
    /// database.
    pub rebuild_indexes: bool,
    pub compression: Compression,
    pub enable_lock: bool,
    pub register_reader: bool,
    pub staging_mode: StagingMode,
    pub enable_persistent_tx_dedupe: bool,
    pub max_remember_tx_ids: usize,
    pub session_id: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            index_directory: None,
            page_size: DEFAULT_PAGE_SIZE,
            rebuild_indexes: true,
            compression: Compression::default(),
            enable_lock: true,
            register_reader: false,
            staging_mode: StagingMode::Default,
            enable_persistent_tx_dedupe: true,
            max_remember_tx_ids: txids::DEFAULT_MAX_REMEMBER,
            session_id: None,
        }
    }
}

impl StoreOptions {
    /// A read-side handle: no write lock, registered in the reader
    /// registry so maintenance sees it.
    pub fn reader() -> Self {
        Self {
            enable_lock: false,
            register_reader: true,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct ActiveBatch {
    tx_id: String,
    session_id: Option<String>,
    triples_snapshot: (BTreeSet<Triple>, BTreeSet<Triple>, u64),
    prop_undo: Vec<PropUndo>,
    prop_version: u64,
}

#[derive(Debug)]
enum PropUndo {
    Node(NodeId, Option<StoredDoc>),
    Edge(Triple, Option<StoredDoc>),
}

#[derive(Debug)]
struct EpochPin {
    epoch: u64,
    manifest: Arc<Manifest>,
    guard: Option<ReaderGuard>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlushReport {
    pub epoch: u64,
    pub pages_written: usize,
    pub groups_merged: usize,
    pub skipped: bool,
}

#[derive(Debug)]
pub struct PersistentStore {
    pub(crate) base_path: PathBuf,
    pub(crate) pages_dir: PathBuf,
    pub(crate) options: StoreOptions,
    lock: Option<FileLock>,
    pub(crate) dictionary: Dictionary,
    pub(crate) triples: TripleStore,
    pub(crate) staging: StagingIndex,
    pub(crate) properties: PropertyStore,
    pub(crate) wal: Wal,
    pub(crate) manifest: Arc<Manifest>,
    pub(crate) paged: PagedIndex,
    pub(crate) hotness: Mutex<HotnessTracker>,
    pub(crate) readers: ReaderRegistry,
    pub(crate) txids: TxIdRegistry,
    batch: Option<ActiveBatch>,
    pins: Vec<EpochPin>,
    reader_guard: Option<ReaderGuard>,
}

impl PersistentStore {
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        if base_path.file_name().is_none() {
            return Err(Error::InvalidArgument(format!(
                "not a database path: {}",
                base_path.display()
            )));
        }
        if let Some(parent) = base_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let lock = if options.enable_lock {
            Some(FileLock::acquire(sibling(&base_path, "lock"))?)
        } else {
            None
        };

        let pages_dir = options
            .index_directory
            .clone()
            .unwrap_or_else(|| sibling(&base_path, "pages"));
        let paged = PagedIndex::open(&pages_dir)?;
        let readers = ReaderRegistry::open(&pages_dir)?;

        let data = datafile::load(&base_path)?;
        let had_data = data.is_some();
        let contents = data.unwrap_or_default();
        let mut dictionary = contents.dictionary;
        let mut properties = contents.properties;
        let mut triples = TripleStore::new();
        let mut staging = StagingIndex::new();
        for t in contents.staged {
            triples.add(t);
            staging.add(t);
        }
        for t in contents.pending_tombstones {
            triples.remove(t, true);
        }

        let manifest = if Manifest::exists(&pages_dir) {
            Manifest::load(&pages_dir)?
        } else if had_data && !options.rebuild_indexes {
            return Err(Error::ManifestCorrupt("manifest missing".to_string()));
        } else {
            Manifest::empty(options.page_size as u32, options.compression)
        };

        let mut txids = TxIdRegistry::load(
            &pages_dir,
            options.enable_persistent_tx_dedupe,
            options.max_remember_tx_ids,
        );
        let hotness = HotnessTracker::load(&pages_dir);

        let mut wal = Wal::open(sibling(&base_path, "wal"))?;
        let outcome = wal.replay(lock.is_some(), |tx| txids.contains(tx))?;
        let replayed = outcome.batches.len();
        for batch in outcome.batches {
            apply_batch_ops(
                &batch.ops,
                &mut dictionary,
                &mut triples,
                &mut staging,
                &mut properties,
                &manifest,
                &paged,
            );
            txids.record(&batch.tx_id, batch.session_id.as_deref());
        }
        if replayed > 0 || outcome.truncated {
            info!(
                batches = replayed,
                deduplicated = outcome.deduplicated,
                truncated = outcome.truncated,
                "wal replay complete"
            );
        }

        let manifest = Arc::new(manifest);
        let reader_guard = if options.register_reader {
            Some(readers.register(manifest.epoch, options.session_id.as_deref())?)
        } else {
            None
        };

        Ok(Self {
            base_path,
            pages_dir,
            options,
            lock,
            dictionary,
            triples,
            staging,
            properties,
            wal,
            manifest,
            paged,
            hotness: Mutex::new(hotness),
            readers,
            txids,
            batch: None,
            pins: Vec::new(),
            reader_guard,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.base_path
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        self.manifest.epoch
    }

    #[inline]
    pub fn is_writer(&self) -> bool {
        self.lock.is_some()
    }

    /// Mutations and maintenance need the handle that holds the write
    /// lock; reader handles only observe.
    pub(crate) fn require_writer(&self) -> Result<()> {
        if self.is_writer() {
            Ok(())
        } else {
            Err(Error::InvalidArgument(
                "operation requires the writer handle".to_string(),
            ))
        }
    }

    // ---------------------------------------------------------------
    // Facts
    // ---------------------------------------------------------------

    pub fn add_fact(&mut self, s: &str, p: &str, o: &str) -> Result<ResolvedTriple> {
        self.autocommit(|store| store.add_fact_in_batch(s, p, o))
    }

    fn add_fact_in_batch(&mut self, s: &str, p: &str, o: &str) -> Result<ResolvedTriple> {
        let t = Triple::new(
            self.dictionary.intern(s),
            self.dictionary.intern(p),
            self.dictionary.intern(o),
        );
        if self.triples.add(t) {
            self.staging.add(t);
            self.wal.append(&WalRecord::Add {
                s: s.to_owned(),
                p: p.to_owned(),
                o: o.to_owned(),
            })?;
        }
        Ok(ResolvedTriple {
            subject: s.to_owned(),
            predicate: p.to_owned(),
            object: o.to_owned(),
            key: t,
        })
    }

    pub fn delete_fact(&mut self, s: &str, p: &str, o: &str) -> Result<bool> {
        self.autocommit(|store| store.delete_fact_in_batch(s, p, o))
    }

    fn delete_fact_in_batch(&mut self, s: &str, p: &str, o: &str) -> Result<bool> {
        let (Some(sid), Some(pid), Some(oid)) = (
            self.dictionary.get_id(s),
            self.dictionary.get_id(p),
            self.dictionary.get_id(o),
        ) else {
            // Unknown strings cannot name a stored fact.
            return Ok(false);
        };
        let t = Triple::new(sid, pid, oid);
        let was_paged = self.contains_paged(t);
        let changed = self.triples.remove(t, was_paged);
        if changed {
            self.staging.remove(t);
            self.wal.append(&WalRecord::Delete {
                s: s.to_owned(),
                p: p.to_owned(),
                o: o.to_owned(),
            })?;
        }
        Ok(changed)
    }

    /// True when the current paged state (ignoring tombstones) physically
    /// holds `t`.
    pub(crate) fn contains_paged(&self, t: Triple) -> bool {
        let manifest = Arc::clone(&self.manifest);
        self.contains_paged_at(&manifest, t)
    }

    pub(crate) fn contains_paged_at(&self, manifest: &Manifest, t: Triple) -> bool {
        let order = IndexOrder::Spo;
        let (primary, secondary, tertiary) = order.permute(t);
        for entry in manifest.pages_for(order, primary) {
            match self.paged.read_entry(order, &entry) {
                Ok(data) => {
                    if data.entries.binary_search(&(secondary, tertiary)).is_ok() {
                        return true;
                    }
                }
                Err(e) => {
                    warn!(order = %order, page = entry.page_id, error = %e, "page suppressed");
                }
            }
        }
        false
    }

    /// Visible set membership: staging wins, pending and manifest
    /// tombstones suppress, pages answer the rest.
    pub fn contains_fact(&self, t: Triple) -> bool {
        if self.triples.contains(t) {
            return true;
        }
        if self.triples.is_tombstoned(t) || self.manifest.is_tombstoned(t) {
            return false;
        }
        self.contains_paged(t)
    }

    // ---------------------------------------------------------------
    // Properties
    // ---------------------------------------------------------------

    pub fn set_node_properties(&mut self, id: NodeId, value: &PropertyValue) -> Result<u64> {
        self.autocommit(|store| store.set_node_properties_in_batch(id, value))
    }

    fn set_node_properties_in_batch(&mut self, id: NodeId, value: &PropertyValue) -> Result<u64> {
        let Some(name) = self.dictionary.get_value(id).map(str::to_owned) else {
            return Err(Error::InvalidArgument(format!("unknown node id {id}")));
        };
        let prior = self.properties.raw_node(id).cloned();
        let version = self.properties.set_node(id, value);
        if let Some(batch) = self.batch.as_mut() {
            batch.prop_undo.push(PropUndo::Node(id, prior));
        }
        self.wal.append(&WalRecord::NodeProps {
            node: name,
            bytes: value.encode(),
            version,
        })?;
        Ok(version)
    }

    pub fn get_node_properties(&self, id: NodeId) -> Option<Document> {
        self.properties.get_node(id)
    }

    pub fn set_edge_properties(&mut self, key: Triple, value: &PropertyValue) -> Result<u64> {
        self.autocommit(|store| store.set_edge_properties_in_batch(key, value))
    }

    fn set_edge_properties_in_batch(&mut self, key: Triple, value: &PropertyValue) -> Result<u64> {
        let names = (
            self.dictionary.get_value(key.s).map(str::to_owned),
            self.dictionary.get_value(key.p).map(str::to_owned),
            self.dictionary.get_value(key.o).map(str::to_owned),
        );
        let (Some(s), Some(p), Some(o)) = names else {
            return Err(Error::InvalidArgument(format!(
                "unknown edge key ({}, {}, {})",
                key.s, key.p, key.o
            )));
        };
        let prior = self.properties.raw_edge(key).cloned();
        let version = self.properties.set_edge(key, value);
        if let Some(batch) = self.batch.as_mut() {
            batch.prop_undo.push(PropUndo::Edge(key, prior));
        }
        self.wal.append(&WalRecord::EdgeProps {
            s,
            p,
            o,
            bytes: value.encode(),
            version,
        })?;
        Ok(version)
    }

    pub fn get_edge_properties(&self, key: Triple) -> Option<Document> {
        self.properties.get_edge(key)
    }

    // ---------------------------------------------------------------
    // Batches
    // ---------------------------------------------------------------

    pub fn begin_batch(
        &mut self,
        tx_id: Option<String>,
        session_id: Option<String>,
    ) -> Result<String> {
        self.require_writer()?;
        if self.batch.is_some() {
            return Err(Error::InvalidArgument(
                "a batch is already open on this handle".to_string(),
            ));
        }
        let tx_id = tx_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.wal.append(&WalRecord::Begin {
            tx_id: tx_id.clone(),
            session_id: session_id.clone(),
            ts_millis: Utc::now().timestamp_millis(),
        })?;
        self.batch = Some(ActiveBatch {
            tx_id: tx_id.clone(),
            session_id,
            triples_snapshot: self.triples.snapshot(),
            prop_undo: Vec::new(),
            prop_version: self.properties.version(),
        });
        Ok(tx_id)
    }

    pub fn commit_batch(&mut self, durable: bool) -> Result<()> {
        let Some(batch) = self.batch.take() else {
            return Err(Error::InvalidArgument("no open batch".to_string()));
        };
        self.wal.append(&WalRecord::Commit {
            tx_id: batch.tx_id.clone(),
            durable,
        })?;
        if durable {
            self.wal.fsync()?;
        }
        self.txids
            .record(&batch.tx_id, batch.session_id.as_deref());
        debug!(tx_id = %batch.tx_id, durable, "batch committed");
        Ok(())
    }

    pub fn abort_batch(&mut self) -> Result<()> {
        let Some(batch) = self.batch.take() else {
            return Err(Error::InvalidArgument("no open batch".to_string()));
        };
        self.wal.append(&WalRecord::Abort {
            tx_id: batch.tx_id.clone(),
        })?;

        let (added, pending, version) = batch.triples_snapshot;
        self.triples.restore(added, pending, version);
        self.staging.clear();
        for t in self.triples.added().iter().copied().collect::<Vec<_>>() {
            self.staging.add(t);
        }
        for undo in batch.prop_undo.into_iter().rev() {
            match undo {
                PropUndo::Node(id, doc) => self.properties.restore_node(id, doc),
                PropUndo::Edge(key, doc) => self.properties.restore_edge(key, doc),
            }
        }
        self.properties.restore_version(batch.prop_version);
        debug!(tx_id = %batch.tx_id, "batch aborted");
        Ok(())
    }

    pub fn in_batch(&self) -> bool {
        self.batch.is_some()
    }

    /// Wraps a single mutation in an implicit batch when none is open.
    fn autocommit<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        if self.batch.is_some() {
            return f(self);
        }
        self.begin_batch(None, None)?;
        match f(self) {
            Ok(value) => {
                self.commit_batch(false)?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.abort_batch();
                Err(e)
            }
        }
    }

    // ---------------------------------------------------------------
    // Flush
    // ---------------------------------------------------------------

    /// Merges staged state into the paged indexes and publishes a new
    /// manifest epoch: build and fsync pages, rewrite the main data file,
    /// install the manifest by atomic rename, persist the tx-id registry,
    /// then reset the WAL.
    pub fn flush(&mut self) -> Result<FlushReport> {
        self.require_writer()?;
        if self.batch.is_some() {
            return Err(Error::InvalidArgument(
                "cannot flush while a batch is open".to_string(),
            ));
        }
        if self.wal.is_empty() && self.triples.is_empty() {
            return Ok(FlushReport {
                epoch: self.manifest.epoch,
                skipped: true,
                ..FlushReport::default()
            });
        }

        let mut manifest = (*self.manifest).clone();
        let page_size = manifest.page_size();
        let mut next_page_id = manifest.next_page_id();
        let mut report = FlushReport::default();

        for order in IndexOrder::ALL {
            for primary in self.staging.primaries(order) {
                let staged = self.staging.group(order, primary);
                let existing_pages = manifest.pages_for(order, primary);
                let mut existing: BTreeSet<(u64, u64)> = BTreeSet::new();
                for entry in &existing_pages {
                    match self.paged.read_entry(order, entry) {
                        Ok(data) => existing.extend(data.entries),
                        Err(e) => {
                            warn!(order = %order, page = entry.page_id, error = %e,
                                "unreadable page skipped during flush");
                        }
                    }
                }
                let fresh: Vec<(u64, u64)> = staged
                    .into_iter()
                    .filter(|pair| !existing.contains(pair))
                    .collect();
                if fresh.is_empty() {
                    continue;
                }

                let merge_target = match self.options.staging_mode {
                    StagingMode::Default => existing_pages
                        .last()
                        .filter(|last| last.count as usize + fresh.len() <= page_size)
                        .copied(),
                    StagingMode::LsmLite => None,
                };

                if let Some(last) = merge_target {
                    let mut merged: BTreeSet<(u64, u64)> = match self.paged.read_entry(order, &last)
                    {
                        Ok(data) => data.entries.into_iter().collect(),
                        Err(_) => BTreeSet::new(),
                    };
                    merged.extend(fresh.iter().copied());
                    let merged: Vec<(u64, u64)> = merged.into_iter().collect();
                    let entry = self.write_page(
                        &mut manifest,
                        order,
                        primary,
                        &merged,
                        &mut next_page_id,
                    )?;
                    let entries = manifest.entries_mut(order);
                    if let Some(at) = entries.iter().position(|e| e.page_id == last.page_id) {
                        entries.remove(at);
                    }
                    manifest.entries_mut(order).push(entry);
                    manifest.orphans.insert(last.page_id);
                    report.groups_merged += 1;
                    report.pages_written += 1;
                } else {
                    for chunk in fresh.chunks(page_size.max(1)) {
                        let entry = self.write_page(
                            &mut manifest,
                            order,
                            primary,
                            chunk,
                            &mut next_page_id,
                        )?;
                        manifest.entries_mut(order).push(entry);
                        report.pages_written += 1;
                    }
                }
            }
        }

        // Tombstone bookkeeping: re-added triples revive, fresh deletes
        // suppress.
        let added = self.triples.added();
        manifest.tombstones.retain(|t| !added.contains(&Triple::from(*t)));
        for t in self.triples.pending_tombstones() {
            manifest.tombstones.insert(t.as_tuple());
        }

        self.paged.sync_all()?;
        let empty = BTreeSet::new();
        datafile::save(&self.base_path, &self.dictionary, &empty, &empty, &self.properties)?;

        manifest.epoch += 1;
        manifest.checkpoint = self.wal.next_seq();
        manifest.install(&self.pages_dir)?;
        self.txids.save()?;
        self.wal.reset(manifest.checkpoint)?;

        self.triples.clear();
        self.staging.clear();
        report.epoch = manifest.epoch;
        self.manifest = Arc::new(manifest);
        if let Err(e) = self.hotness.lock().unwrap().save() {
            warn!(error = %e, "hotness save failed");
        }
        info!(
            epoch = report.epoch,
            pages = report.pages_written,
            merged = report.groups_merged,
            "flush complete"
        );
        Ok(report)
    }

    fn write_page(
        &mut self,
        manifest: &Manifest,
        order: IndexOrder,
        primary: u64,
        entries: &[(u64, u64)],
        next_page_id: &mut u64,
    ) -> Result<crate::manifest::PageEntry> {
        let bytes = page::encode_page(primary, entries, manifest.compression);
        let (offset, length) = self.paged.append_page(order, &bytes)?;
        let entry = crate::manifest::PageEntry {
            primary_value: primary,
            page_id: *next_page_id,
            offset,
            length,
            crc32: page::page_crc(&bytes),
            count: entries.len() as u32,
        };
        *next_page_id += 1;
        Ok(entry)
    }

    // ---------------------------------------------------------------
    // Views and epoch pins
    // ---------------------------------------------------------------

    /// Live view: staging merged over the current manifest.
    pub fn view(&self) -> StoreView<'_> {
        StoreView { store: self }
    }

    /// Pins the current epoch: registers a reader record and freezes the
    /// manifest until the matching `pop_snapshot`.
    pub fn push_snapshot(&mut self) -> Result<u64> {
        let manifest = Arc::clone(&self.manifest);
        let epoch = manifest.epoch;
        let guard = self
            .readers
            .register(epoch, self.options.session_id.as_deref())?;
        self.pins.push(EpochPin {
            epoch,
            manifest,
            guard: Some(guard),
        });
        Ok(epoch)
    }

    pub fn pop_snapshot(&mut self) -> Result<()> {
        let Some(pin) = self.pins.pop() else {
            return Err(Error::InvalidArgument("no pinned epoch".to_string()));
        };
        if let Some(guard) = pin.guard {
            self.readers.unregister(guard)?;
        }
        Ok(())
    }

    /// Frozen view of a pinned epoch; the epoch must have been pinned on
    /// this handle via `push_snapshot`.
    pub fn pinned_view(&self, epoch: u64) -> Result<PinnedView<'_>> {
        let pin = self
            .pins
            .iter()
            .rev()
            .find(|pin| pin.epoch == epoch)
            .ok_or_else(|| Error::InvalidArgument(format!("epoch {epoch} is not pinned")))?;
        Ok(PinnedView {
            store: self,
            manifest: Arc::clone(&pin.manifest),
        })
    }

    /// Re-reads the on-disk state published by the writer. A no-op on the
    /// writing handle; reader handles observe new epochs here.
    pub fn refresh(&mut self) -> Result<u64> {
        if self.lock.is_some() {
            return Ok(self.manifest.epoch);
        }
        if let Some(contents) = datafile::load(&self.base_path)? {
            self.dictionary = contents.dictionary;
            self.properties = contents.properties;
        }
        if Manifest::exists(&self.pages_dir) {
            self.manifest = Arc::new(Manifest::load(&self.pages_dir)?);
        }
        Ok(self.manifest.epoch)
    }

    // ---------------------------------------------------------------
    // Registry surfaces
    // ---------------------------------------------------------------

    pub fn list_readers(&self) -> Result<Vec<ReaderRecord>> {
        self.readers.list()
    }

    pub fn list_tx_ids(
        &self,
        session_id: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Vec<TxRecord> {
        self.txids.list(session_id, since)
    }

    pub fn list_hot(&self, top: usize) -> Vec<(IndexOrder, u64, f64)> {
        self.hotness.lock().unwrap().hottest(top)
    }

    /// Graceful shutdown: abort any open batch, flush when this handle is
    /// the writer, release the pin stack, unregister, unlock.
    pub fn close(mut self) -> Result<()> {
        if self.batch.is_some() {
            self.abort_batch()?;
        }
        if self.lock.is_some() {
            self.flush()?;
        }
        while !self.pins.is_empty() {
            self.pop_snapshot()?;
        }
        if let Some(guard) = self.reader_guard.take() {
            self.readers.unregister(guard)?;
        }
        // Sidecars belong to the writer; readers only observe them.
        if self.is_writer() {
            if let Err(e) = self.hotness.lock().unwrap().save() {
                warn!(error = %e, "hotness save failed");
            }
            self.txids.save()?;
        }
        self.lock = None;
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Applies one committed batch's replayed ops to the in-memory state.
/// Strings re-intern in order, reproducing the original id assignment.
fn apply_batch_ops(
    ops: &[WalRecord],
    dictionary: &mut Dictionary,
    triples: &mut TripleStore,
    staging: &mut StagingIndex,
    properties: &mut PropertyStore,
    manifest: &Manifest,
    paged: &PagedIndex,
) {
    for op in ops {
        match op {
            WalRecord::Add { s, p, o } => {
                let t = Triple::new(
                    dictionary.intern(s),
                    dictionary.intern(p),
                    dictionary.intern(o),
                );
                if triples.add(t) {
                    staging.add(t);
                }
            }
            WalRecord::Delete { s, p, o } => {
                let (Some(sid), Some(pid), Some(oid)) = (
                    dictionary.get_id(s),
                    dictionary.get_id(p),
                    dictionary.get_id(o),
                ) else {
                    continue;
                };
                let t = Triple::new(sid, pid, oid);
                let was_paged = contains_paged_raw(paged, manifest, t);
                if triples.remove(t, was_paged) {
                    staging.remove(t);
                }
            }
            WalRecord::NodeProps {
                node,
                bytes,
                version,
            } => {
                let id = dictionary.intern(node);
                properties.apply_node(id, bytes.clone(), *version);
            }
            WalRecord::EdgeProps {
                s,
                p,
                o,
                bytes,
                version,
            } => {
                let key = Triple::new(
                    dictionary.intern(s),
                    dictionary.intern(p),
                    dictionary.intern(o),
                );
                properties.apply_edge(key, bytes.clone(), *version);
            }
            WalRecord::Begin { .. } | WalRecord::Commit { .. } | WalRecord::Abort { .. } => {}
        }
    }
}

fn contains_paged_raw(paged: &PagedIndex, manifest: &Manifest, t: Triple) -> bool {
    let order = IndexOrder::Spo;
    let (primary, secondary, tertiary) = order.permute(t);
    for entry in manifest.pages_for(order, primary) {
        if let Ok(data) = paged.read_entry(order, &entry)
            && data.entries.binary_search(&(secondary, tertiary)).is_ok()
        {
            return true;
        }
    }
    false
}

// -------------------------------------------------------------------
// Read views
// -------------------------------------------------------------------

/// Live read view over one store handle.
#[derive(Debug, Clone, Copy)]
pub struct StoreView<'a> {
    store: &'a PersistentStore,
}

/// Frozen view of a pinned manifest epoch. Ignores staging entirely and
/// reads only pages the pinned manifest references.
#[derive(Debug)]
pub struct PinnedView<'a> {
    store: &'a PersistentStore,
    manifest: Arc<Manifest>,
}

impl GraphView for StoreView<'_> {
    fn lookup_id(&self, value: &str) -> Option<NodeId> {
        self.store.dictionary.get_id(value)
    }

    fn resolve_value(&self, id: NodeId) -> Option<String> {
        self.store.dictionary.get_value(id).map(str::to_owned)
    }

    fn scan(
        &self,
        order: IndexOrder,
        primary: Option<NodeId>,
        secondary: Option<NodeId>,
    ) -> Box<dyn Iterator<Item = Triple> + '_> {
        Box::new(MergedScan::new(
            self.store,
            Arc::clone(&self.store.manifest),
            order,
            primary,
            secondary,
            true,
        ))
    }

    fn contains_triple(&self, triple: Triple) -> bool {
        self.store.contains_fact(triple)
    }

    fn node_document(&self, id: NodeId) -> Option<Document> {
        self.store.properties.get_node(id)
    }

    fn edge_document(&self, key: Triple) -> Option<Document> {
        self.store.properties.get_edge(key)
    }
}

impl GraphView for PinnedView<'_> {
    fn lookup_id(&self, value: &str) -> Option<NodeId> {
        self.store.dictionary.get_id(value)
    }

    fn resolve_value(&self, id: NodeId) -> Option<String> {
        self.store.dictionary.get_value(id).map(str::to_owned)
    }

    fn scan(
        &self,
        order: IndexOrder,
        primary: Option<NodeId>,
        secondary: Option<NodeId>,
    ) -> Box<dyn Iterator<Item = Triple> + '_> {
        Box::new(MergedScan::new(
            self.store,
            Arc::clone(&self.manifest),
            order,
            primary,
            secondary,
            false,
        ))
    }

    fn contains_triple(&self, triple: Triple) -> bool {
        if self.manifest.is_tombstoned(triple) {
            return false;
        }
        self.store.contains_paged_at(&self.manifest, triple)
    }

    fn node_document(&self, id: NodeId) -> Option<Document> {
        self.store.properties.get_node(id)
    }

    fn edge_document(&self, key: Triple) -> Option<Document> {
        self.store.properties.get_edge(key)
    }
}

/// Group-by-group merge of paged postings and the staging buffer for one
/// order. Loads one primary's postings at a time, so iteration yields
/// between page groups.
struct MergedScan<'a> {
    store: &'a PersistentStore,
    manifest: Arc<Manifest>,
    order: IndexOrder,
    secondary: Option<u64>,
    include_staging: bool,
    primaries: VecDeque<u64>,
    current: std::vec::IntoIter<Triple>,
}

impl<'a> MergedScan<'a> {
    fn new(
        store: &'a PersistentStore,
        manifest: Arc<Manifest>,
        order: IndexOrder,
        primary: Option<u64>,
        secondary: Option<u64>,
        include_staging: bool,
    ) -> Self {
        let primaries: VecDeque<u64> = match primary {
            Some(p) => VecDeque::from([p]),
            None => {
                let mut all: BTreeSet<u64> = manifest.primaries(order).into_iter().collect();
                if include_staging {
                    all.extend(store.staging.primaries(order));
                }
                all.into_iter().collect()
            }
        };
        Self {
            store,
            manifest,
            order,
            secondary,
            include_staging,
            primaries,
            current: Vec::new().into_iter(),
        }
    }

    fn load_group(&mut self, primary: u64) {
        let mut pairs: BTreeSet<(u64, u64)> = BTreeSet::new();
        for entry in self.manifest.pages_for(self.order, primary) {
            match self.store.paged.read_entry(self.order, &entry) {
                Ok(data) => {
                    pairs.extend(data.entries);
                }
                Err(e) => {
                    // A bad page mutes its own postings, nothing else.
                    warn!(order = %self.order, page = entry.page_id, error = %e,
                        "page suppressed from scan");
                }
            }
        }

        // Paged occurrences are masked by tombstones; the staging buffer
        // re-adds after them.
        pairs.retain(|&(secondary, tertiary)| {
            let t = self.order.restore(primary, secondary, tertiary);
            if self.manifest.is_tombstoned(t) {
                return false;
            }
            if self.include_staging && self.store.triples.is_tombstoned(t) {
                return false;
            }
            true
        });

        if self.include_staging {
            for (secondary, tertiary) in self.store.staging.group(self.order, primary) {
                pairs.insert((secondary, tertiary));
            }
        }

        self.store
            .hotness
            .lock()
            .unwrap()
            .record_access(self.order, primary);

        let order = self.order;
        let secondary_bound = self.secondary;
        let triples: Vec<Triple> = pairs
            .into_iter()
            .filter(|&(secondary, _)| secondary_bound.is_none_or(|want| want == secondary))
            .map(|(secondary, tertiary)| order.restore(primary, secondary, tertiary))
            .collect();
        self.current = triples.into_iter();
    }
}

impl Iterator for MergedScan<'_> {
    type Item = Triple;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(t) = self.current.next() {
                return Some(t);
            }
            let primary = self.primaries.pop_front()?;
            self.load_group(primary);
        }
    }
}

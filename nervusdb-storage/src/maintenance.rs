//! Maintenance: integrity checking, repair from surviving redundancy,
//! scored compaction, and page garbage collection.
//!
//! Every order stores the full triple set, so any readable order can
//! rebuild a damaged one. GC rewrites page files vacuum-style and never
//! runs while a reader is registered (conservative policy); a crash
//! between a file rewrite and the manifest install degrades to CRC
//! suppression plus `repair`.

use crate::manifest::{Compression, PageEntry};
use crate::page;
use crate::store::PersistentStore;
use crate::{Error, Result};
use nervusdb_api::{IndexOrder, Triple};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub hot: f64,
    pub pages: f64,
    pub tomb: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            hot: 1.0,
            pages: 0.5,
            tomb: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompactMode {
    /// Score-selected group merges.
    #[default]
    Incremental,
    /// Rewrite every group; eliminates tombstones.
    Rewrite,
}

#[derive(Debug, Clone)]
pub struct CompactOptions {
    pub mode: CompactMode,
    pub orders: Option<Vec<IndexOrder>>,
    pub min_merge_pages: usize,
    /// Groups at or above this tombstone ratio are compacted regardless
    /// of their score.
    pub tombstone_threshold: f64,
    pub score_weights: ScoreWeights,
    pub min_score: f64,
    pub max_primaries_per_order: Option<usize>,
    pub compression: Option<Compression>,
    pub dry_run: bool,
}

impl Default for CompactOptions {
    fn default() -> Self {
        Self {
            mode: CompactMode::Incremental,
            orders: None,
            min_merge_pages: 2,
            tombstone_threshold: 0.5,
            score_weights: ScoreWeights::default(),
            min_score: 1.0,
            max_primaries_per_order: None,
            compression: None,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompactCandidate {
    pub order: IndexOrder,
    pub primary: u64,
    pub score: f64,
    pub page_count: usize,
    pub tombstone_ratio: f64,
}

#[derive(Debug, Default)]
pub struct CompactReport {
    pub epoch: u64,
    pub skipped: bool,
    pub dry_run: bool,
    pub candidates: Vec<CompactCandidate>,
    pub groups_rewritten: usize,
    pub pages_written: usize,
    pub pages_orphaned: usize,
    pub tombstones_cleared: usize,
}

#[derive(Debug, Default)]
pub struct GcReport {
    pub skipped: bool,
    pub epoch: u64,
    pub deleted_pages: usize,
    pub reclaimed_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckProblem {
    PageOutOfBounds {
        order: IndexOrder,
        page_id: u64,
    },
    PageCrcMismatch {
        order: IndexOrder,
        page_id: u64,
    },
    PageUndecodable {
        order: IndexOrder,
        page_id: u64,
    },
    UnresolvableTombstone {
        triple: Triple,
    },
    OrphanReferenced {
        page_id: u64,
    },
    CheckpointAhead {
        checkpoint: u64,
        wal_seq: u64,
    },
}

#[derive(Debug, Default)]
pub struct CheckReport {
    pub problems: Vec<CheckProblem>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RepairReport {
    pub epoch: u64,
    pub orders_rebuilt: Vec<IndexOrder>,
    pub triples_recovered: usize,
}

#[derive(Debug)]
pub struct PageDump {
    pub entry: PageEntry,
    /// `None` when the page failed verification.
    pub triples: Option<Vec<Triple>>,
}

impl PersistentStore {
    // ---------------------------------------------------------------
    // check / repair
    // ---------------------------------------------------------------

    /// Validates catalog ranges and CRCs, tombstone resolvability, orphan
    /// disjointness, and the WAL checkpoint. With `strict`, the first
    /// corrupted page fails instead of being reported.
    pub fn check(&self, strict: bool) -> Result<CheckReport> {
        let mut report = CheckReport::default();
        let referenced = self.manifest.referenced_page_ids();

        for order in IndexOrder::ALL {
            let file_len = self.paged.file_len(order);
            for entry in self.manifest.entries(order) {
                let end = entry.offset.saturating_add(u64::from(entry.length));
                if end > file_len {
                    report.problems.push(CheckProblem::PageOutOfBounds {
                        order,
                        page_id: entry.page_id,
                    });
                    if strict {
                        return Err(Error::PageCrcMismatch {
                            order,
                            page_id: entry.page_id,
                        });
                    }
                    continue;
                }
                let bytes = self.paged.read_page_bytes(order, entry.offset, entry.length)?;
                if page::page_crc(&bytes) != entry.crc32 {
                    report.problems.push(CheckProblem::PageCrcMismatch {
                        order,
                        page_id: entry.page_id,
                    });
                    if strict {
                        return Err(Error::PageCrcMismatch {
                            order,
                            page_id: entry.page_id,
                        });
                    }
                    continue;
                }
                if page::decode_page(&bytes).is_err() {
                    report.problems.push(CheckProblem::PageUndecodable {
                        order,
                        page_id: entry.page_id,
                    });
                    if strict {
                        return Err(Error::PageCrcMismatch {
                            order,
                            page_id: entry.page_id,
                        });
                    }
                }
            }
        }

        for &(s, p, o) in &self.manifest.tombstones {
            let triple = Triple::new(s, p, o);
            if self.dictionary.get_value(s).is_none()
                || self.dictionary.get_value(p).is_none()
                || self.dictionary.get_value(o).is_none()
            {
                report
                    .problems
                    .push(CheckProblem::UnresolvableTombstone { triple });
            }
        }

        for page_id in self.manifest.orphans.intersection(&referenced) {
            report.problems.push(CheckProblem::OrphanReferenced {
                page_id: *page_id,
            });
        }

        if self.manifest.checkpoint > self.wal.next_seq() {
            report.problems.push(CheckProblem::CheckpointAhead {
                checkpoint: self.manifest.checkpoint,
                wal_seq: self.wal.next_seq(),
            });
        }

        Ok(report)
    }

    /// Rebuilds damaged orders from the union of every readable page
    /// across all six orders. Tombstoned entries are dropped physically;
    /// a fully rebuilt order needs no tombstone masking, but the set is
    /// kept for orders that were not rebuilt.
    pub fn repair(&mut self) -> Result<RepairReport> {
        self.require_writer()?;
        let report = self.check(false)?;
        let broken: BTreeSet<IndexOrder> = report
            .problems
            .iter()
            .filter_map(|p| match p {
                CheckProblem::PageOutOfBounds { order, .. }
                | CheckProblem::PageCrcMismatch { order, .. }
                | CheckProblem::PageUndecodable { order, .. } => Some(*order),
                _ => None,
            })
            .collect();
        if broken.is_empty() {
            return Ok(RepairReport {
                epoch: self.manifest.epoch,
                ..RepairReport::default()
            });
        }

        // Surviving paged state, from whichever orders can still be read.
        let mut recovered: BTreeSet<Triple> = BTreeSet::new();
        for order in IndexOrder::ALL {
            for entry in self.manifest.entries(order) {
                if let Ok(data) = self.paged.read_entry(order, entry) {
                    for (secondary, tertiary) in data.entries {
                        let t = order.restore(entry.primary_value, secondary, tertiary);
                        if !self.manifest.is_tombstoned(t) {
                            recovered.insert(t);
                        }
                    }
                }
            }
        }

        let mut manifest = (*self.manifest).clone();
        let mut next_page_id = manifest.next_page_id();
        let page_size = manifest.page_size();
        let compression = manifest.compression;

        for order in &broken {
            let order = *order;
            // Drop everything in the damaged file, then write the
            // recovered set back in fresh pages.
            self.paged.rewrite_order(order, &[])?;
            let mut entries: Vec<PageEntry> = Vec::new();
            let mut groups: BTreeMap<u64, Vec<(u64, u64)>> = BTreeMap::new();
            for &t in &recovered {
                let (primary, secondary, tertiary) = order.permute(t);
                groups.entry(primary).or_default().push((secondary, tertiary));
            }
            for (primary, mut pairs) in groups {
                pairs.sort_unstable();
                for chunk in pairs.chunks(page_size.max(1)) {
                    let bytes = page::encode_page(primary, chunk, compression);
                    let (offset, length) = self.paged.append_page(order, &bytes)?;
                    entries.push(PageEntry {
                        primary_value: primary,
                        page_id: next_page_id,
                        offset,
                        length,
                        crc32: page::page_crc(&bytes),
                        count: chunk.len() as u32,
                    });
                    next_page_id += 1;
                }
            }
            *manifest.entries_mut(order) = entries;
        }

        self.paged.sync_all()?;
        manifest.epoch += 1;
        manifest.install(&self.pages_dir)?;
        let epoch = manifest.epoch;
        self.manifest = std::sync::Arc::new(manifest);

        let rebuilt: Vec<IndexOrder> = broken.into_iter().collect();
        info!(?rebuilt, recovered = recovered.len(), epoch, "repair complete");
        Ok(RepairReport {
            epoch,
            orders_rebuilt: rebuilt,
            triples_recovered: recovered.len(),
        })
    }

    // ---------------------------------------------------------------
    // compaction
    // ---------------------------------------------------------------

    /// Candidate scoring over `(order, primary)` groups:
    /// `w_hot * hotness + w_pages * (pages - 1) + w_tomb * tombstoneRatio`,
    /// with the page term gated on `min_merge_pages`.
    pub fn compact_candidates(&self, options: &CompactOptions) -> Vec<CompactCandidate> {
        let orders = options
            .orders
            .clone()
            .unwrap_or_else(|| IndexOrder::ALL.to_vec());
        let hotness = self.hotness.lock().unwrap();
        let max_heat = hotness.max_heat();
        let mut candidates = Vec::new();

        for order in orders {
            let mut order_candidates = Vec::new();
            for primary in self.manifest.primaries(order) {
                let pages = self.manifest.pages_for(order, primary);
                let total: u64 = pages.iter().map(|e| u64::from(e.count)).sum();
                if total == 0 && pages.is_empty() {
                    continue;
                }
                let tomb_count = self
                    .manifest
                    .tombstones
                    .iter()
                    .filter(|&&(s, p, o)| order.permute(Triple::new(s, p, o)).0 == primary)
                    .count() as u64;
                let tombstone_ratio = if total == 0 {
                    0.0
                } else {
                    (tomb_count as f64 / total as f64).min(1.0)
                };
                let normalized_hotness = if max_heat > 0.0 {
                    hotness.heat(order, primary) / max_heat
                } else {
                    0.0
                };
                let mut score = options.score_weights.hot * normalized_hotness
                    + options.score_weights.tomb * tombstone_ratio;
                if pages.len() >= options.min_merge_pages {
                    score += options.score_weights.pages * (pages.len() as f64 - 1.0);
                }

                let selected = match options.mode {
                    CompactMode::Rewrite => true,
                    CompactMode::Incremental => {
                        score >= options.min_score
                            || (tombstone_ratio > 0.0
                                && tombstone_ratio >= options.tombstone_threshold)
                    }
                };
                if selected {
                    order_candidates.push(CompactCandidate {
                        order,
                        primary,
                        score,
                        page_count: pages.len(),
                        tombstone_ratio,
                    });
                }
            }

            order_candidates.sort_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then(b.page_count.cmp(&a.page_count))
                    .then_with(|| {
                        let ha = hotness.last_access_ms(a.order, a.primary);
                        let hb = hotness.last_access_ms(b.order, b.primary);
                        hb.cmp(&ha)
                    })
            });
            if let Some(cap) = options.max_primaries_per_order {
                order_candidates.truncate(cap);
            }
            candidates.extend(order_candidates);
        }
        candidates
    }

    pub fn compact(&mut self, options: CompactOptions) -> Result<CompactReport> {
        self.require_writer()?;
        let candidates = self.compact_candidates(&options);
        let mut report = CompactReport {
            epoch: self.manifest.epoch,
            dry_run: options.dry_run,
            ..CompactReport::default()
        };
        if candidates.is_empty() {
            report.skipped = true;
            return Ok(report);
        }
        if options.dry_run {
            report.candidates = candidates;
            return Ok(report);
        }

        let mut manifest = (*self.manifest).clone();
        if let Some(compression) = options.compression {
            manifest.compression = compression;
        }
        let compression = manifest.compression;
        let page_size = manifest.page_size();
        let mut next_page_id = manifest.next_page_id();

        for candidate in &candidates {
            let order = candidate.order;
            let primary = candidate.primary;
            let old_pages = manifest.pages_for(order, primary);

            // Merge all live entries of the group, dropping entries this
            // order's tombstones cover.
            let mut merged: BTreeSet<(u64, u64)> = BTreeSet::new();
            for entry in &old_pages {
                match self.paged.read_entry(order, entry) {
                    Ok(data) => merged.extend(data.entries),
                    Err(e) => {
                        warn!(order = %order, page = entry.page_id, error = %e,
                            "unreadable page dropped by compaction");
                    }
                }
            }
            merged.retain(|&(secondary, tertiary)| {
                !manifest.is_tombstoned(order.restore(primary, secondary, tertiary))
            });

            let entries = manifest.entries_mut(order);
            entries.retain(|e| e.primary_value != primary);
            for entry in &old_pages {
                manifest.orphans.insert(entry.page_id);
                report.pages_orphaned += 1;
            }

            let merged: Vec<(u64, u64)> = merged.into_iter().collect();
            for chunk in merged.chunks(page_size.max(1)) {
                let bytes = page::encode_page(primary, chunk, compression);
                let (offset, length) = self.paged.append_page(order, &bytes)?;
                manifest.entries_mut(order).push(PageEntry {
                    primary_value: primary,
                    page_id: next_page_id,
                    offset,
                    length,
                    crc32: page::page_crc(&bytes),
                    count: chunk.len() as u32,
                });
                next_page_id += 1;
                report.pages_written += 1;
            }
            report.groups_rewritten += 1;
        }

        // A full rewrite of every order eliminates the tombstone set; an
        // incremental pass keeps it, other orders may still hold covered
        // occurrences.
        if options.mode == CompactMode::Rewrite && options.orders.is_none() {
            report.tombstones_cleared = manifest.tombstones.len();
            manifest.tombstones.clear();
        }

        self.paged.sync_all()?;
        manifest.epoch += 1;
        manifest.install(&self.pages_dir)?;
        report.epoch = manifest.epoch;
        self.manifest = std::sync::Arc::new(manifest);
        info!(
            epoch = report.epoch,
            groups = report.groups_rewritten,
            pages = report.pages_written,
            "compaction complete"
        );
        Ok(report)
    }

    /// Scored incremental compaction followed by a reader-respecting GC
    /// pass.
    pub fn auto_compact(&mut self, options: CompactOptions) -> Result<(CompactReport, GcReport)> {
        let compact = self.compact(options)?;
        let gc = self.garbage_collect_pages(true)?;
        Ok((compact, gc))
    }

    // ---------------------------------------------------------------
    // GC
    // ---------------------------------------------------------------

    /// Reclaims orphaned pages by rewriting each order file with only the
    /// referenced pages. With `respect_readers`, any registered reader
    /// (including this handle's own pins) skips the pass.
    pub fn garbage_collect_pages(&mut self, respect_readers: bool) -> Result<GcReport> {
        self.require_writer()?;
        let mut report = GcReport {
            epoch: self.manifest.epoch,
            ..GcReport::default()
        };
        if self.manifest.orphans.is_empty() {
            return Ok(report);
        }
        if respect_readers && self.readers.any_registered()? {
            info!("gc skipped: readers registered");
            report.skipped = true;
            return Ok(report);
        }

        let mut manifest = (*self.manifest).clone();
        report.deleted_pages = manifest.orphans.len();

        for order in IndexOrder::ALL {
            let live = manifest.entries(order).to_vec();
            let (relocated, old_len, new_len) = self.paged.rewrite_order(order, &live)?;
            *manifest.entries_mut(order) = relocated;
            report.reclaimed_bytes += old_len.saturating_sub(new_len);
        }

        manifest.orphans.clear();
        manifest.epoch += 1;
        manifest.install(&self.pages_dir)?;
        report.epoch = manifest.epoch;
        self.manifest = std::sync::Arc::new(manifest);
        info!(
            epoch = report.epoch,
            pages = report.deleted_pages,
            bytes = report.reclaimed_bytes,
            "gc complete"
        );
        Ok(report)
    }

    // ---------------------------------------------------------------
    // inspection
    // ---------------------------------------------------------------

    /// Decoded postings of one `(order, primaryValue)` group; unreadable
    /// pages are returned with `triples: None`.
    pub fn dump_page(&self, order: IndexOrder, primary: u64) -> Vec<PageDump> {
        self.manifest
            .pages_for(order, primary)
            .into_iter()
            .map(|entry| {
                let triples = self.paged.read_entry(order, &entry).ok().map(|data| {
                    data.entries
                        .into_iter()
                        .map(|(secondary, tertiary)| order.restore(primary, secondary, tertiary))
                        .collect()
                });
                PageDump { entry, triples }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;
    use nervusdb_api::GraphView;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> PersistentStore {
        PersistentStore::open(dir.join("graph.synapse"), StoreOptions::default()).unwrap()
    }

    fn all_facts(store: &PersistentStore) -> BTreeSet<Triple> {
        store.view().scan(IndexOrder::Spo, None, None).collect()
    }

    #[test]
    fn compaction_preserves_the_visible_set() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path());
        for i in 0..50 {
            store
                .add_fact(&format!("s{}", i % 5), "r", &format!("o{i}"))
                .unwrap();
            store.flush().unwrap();
        }
        store.delete_fact("s0", "r", "o0").unwrap();
        store.flush().unwrap();

        let before = all_facts(&store);
        let report = store
            .compact(CompactOptions {
                mode: CompactMode::Rewrite,
                ..CompactOptions::default()
            })
            .unwrap();
        assert!(!report.skipped);
        assert!(report.tombstones_cleared > 0);
        assert_eq!(all_facts(&store), before);
        assert!(store.manifest.tombstones.is_empty());
    }

    #[test]
    fn incremental_compaction_scores_multi_page_groups() {
        let dir = tempdir().unwrap();
        let mut store = PersistentStore::open(
            dir.path().join("graph.synapse"),
            StoreOptions {
                staging_mode: crate::store::StagingMode::LsmLite,
                ..StoreOptions::default()
            },
        )
        .unwrap();
        // Many flushes of the same subject pile up pages for one primary.
        for i in 0..6 {
            store.add_fact("hot", "r", &format!("o{i}")).unwrap();
            store.flush().unwrap();
        }
        assert!(store.manifest.pages_for(IndexOrder::Spo, 1).len() > 1);

        let before = all_facts(&store);
        let report = store.compact(CompactOptions::default()).unwrap();
        assert!(!report.skipped);
        assert!(report.groups_rewritten > 0);
        assert_eq!(store.manifest.pages_for(IndexOrder::Spo, 1).len(), 1);
        assert_eq!(all_facts(&store), before);
    }

    #[test]
    fn dry_run_reports_without_writing() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path());
        store.add_fact("a", "r", "b").unwrap();
        store.flush().unwrap();
        let epoch = store.epoch();
        let report = store
            .compact(CompactOptions {
                mode: CompactMode::Rewrite,
                dry_run: true,
                ..CompactOptions::default()
            })
            .unwrap();
        assert!(report.dry_run);
        assert!(!report.candidates.is_empty());
        assert_eq!(store.epoch(), epoch);
    }

    #[test]
    fn gc_respects_registered_readers() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path());
        store.add_fact("a", "r", "b").unwrap();
        store.flush().unwrap();
        store.add_fact("a", "r", "c").unwrap();
        store.flush().unwrap();
        store
            .compact(CompactOptions {
                mode: CompactMode::Rewrite,
                ..CompactOptions::default()
            })
            .unwrap();
        assert!(!store.manifest.orphans.is_empty());

        store.push_snapshot().unwrap();
        let report = store.garbage_collect_pages(true).unwrap();
        assert!(report.skipped);
        assert!(!store.manifest.orphans.is_empty());

        store.pop_snapshot().unwrap();
        let report = store.garbage_collect_pages(true).unwrap();
        assert!(!report.skipped);
        assert!(report.deleted_pages > 0);
        assert!(store.manifest.orphans.is_empty());
        assert_eq!(all_facts(&store).len(), 2);
    }

    #[test]
    fn check_flags_a_flipped_byte_in_exactly_one_page() {
        let dir = tempdir().unwrap();
        let mut store = open(dir.path());
        store.add_fact("a", "r", "b").unwrap();
        store.add_fact("c", "r", "d").unwrap();
        store.flush().unwrap();
        assert!(store.check(false).unwrap().is_clean());

        // Flip one byte inside the first SPO page.
        let entry = store.manifest.entries(IndexOrder::Spo)[0];
        store.close().unwrap();
        let path = dir.path().join("graph.synapse.pages").join("SPO.idxpage");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[entry.offset as usize + 5] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        let store = open(dir.path());

        let report = store.check(false).unwrap();
        let crc_problems: Vec<_> = report
            .problems
            .iter()
            .filter(|p| matches!(p, CheckProblem::PageCrcMismatch { .. }))
            .collect();
        assert_eq!(crc_problems.len(), 1);
        assert!(matches!(
            crc_problems[0],
            CheckProblem::PageCrcMismatch { order: IndexOrder::Spo, page_id } if *page_id == entry.page_id
        ));
        assert!(store.check(true).is_err());
    }

    #[test]
    fn repair_rebuilds_a_corrupted_order_from_the_others() {
        let dir = tempdir().unwrap();
        let facts_before;
        {
            let mut store = open(dir.path());
            for i in 0..20 {
                store.add_fact(&format!("s{i}"), "r", &format!("o{i}")).unwrap();
            }
            store.flush().unwrap();
            facts_before = all_facts(&store);
            store.close().unwrap();
        }

        // Wreck the whole SPO file.
        let path = dir.path().join("graph.synapse.pages").join("SPO.idxpage");
        let len = std::fs::metadata(&path).unwrap().len();
        std::fs::write(&path, vec![0xAB; len as usize]).unwrap();

        let mut store = open(dir.path());
        let report = store.repair().unwrap();
        assert!(report.orders_rebuilt.contains(&IndexOrder::Spo));
        assert_eq!(report.triples_recovered, 20);
        assert!(store.check(false).unwrap().is_clean());
        assert_eq!(all_facts(&store), facts_before);
    }
}

//! The paged-index manifest: epoch, page catalog per order, tombstones,
//! orphans, and the WAL checkpoint. Persisted as `index-manifest.json`
//! and installed atomically (write temp, fsync, rename, fsync directory).

use crate::{DEFAULT_PAGE_SIZE, Error, Result};
use nervusdb_api::{IndexOrder, Triple};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::debug;

pub const MANIFEST_FILE: &str = "index-manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    None,
    Brotli,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Compression {
    pub codec: Codec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
}

impl Compression {
    pub fn brotli(level: u32) -> Self {
        Self {
            codec: Codec::Brotli,
            level: Some(level),
        }
    }
}

/// One on-disk page of a posting list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageEntry {
    pub primary_value: u64,
    pub page_id: u64,
    pub offset: u64,
    pub length: u32,
    pub crc32: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub epoch: u64,
    pub page_size: u32,
    pub compression: Compression,
    /// Page catalog, keyed by order name (SPO .. OPS).
    pub lookups: BTreeMap<String, Vec<PageEntry>>,
    /// Triples logically deleted from the paged state.
    pub tombstones: BTreeSet<(u64, u64, u64)>,
    /// Pages no longer referenced by this epoch, awaiting GC.
    pub orphans: BTreeSet<u64>,
    /// Highest WAL sequence folded into the paged state.
    pub checkpoint: u64,
}

impl Manifest {
    pub fn empty(page_size: u32, compression: Compression) -> Self {
        let lookups = IndexOrder::ALL
            .into_iter()
            .map(|order| (order.name().to_string(), Vec::new()))
            .collect();
        Self {
            epoch: 0,
            page_size,
            compression,
            lookups,
            tombstones: BTreeSet::new(),
            orphans: BTreeSet::new(),
            checkpoint: 0,
        }
    }

    pub fn entries(&self, order: IndexOrder) -> &[PageEntry] {
        self.lookups
            .get(order.name())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entries_mut(&mut self, order: IndexOrder) -> &mut Vec<PageEntry> {
        self.lookups.entry(order.name().to_string()).or_default()
    }

    /// Catalog pages of one primary, in catalog order.
    pub fn pages_for(&self, order: IndexOrder, primary: u64) -> Vec<PageEntry> {
        self.entries(order)
            .iter()
            .filter(|e| e.primary_value == primary)
            .copied()
            .collect()
    }

    /// Distinct primaries present in one order, ascending.
    pub fn primaries(&self, order: IndexOrder) -> Vec<u64> {
        let mut out: BTreeSet<u64> = BTreeSet::new();
        for entry in self.entries(order) {
            out.insert(entry.primary_value);
        }
        out.into_iter().collect()
    }

    pub fn is_tombstoned(&self, t: Triple) -> bool {
        self.tombstones.contains(&t.as_tuple())
    }

    /// Next unused page id. Deleted ids may be reissued; live and orphaned
    /// ids never collide.
    pub fn next_page_id(&self) -> u64 {
        let referenced = self
            .lookups
            .values()
            .flatten()
            .map(|e| e.page_id)
            .max()
            .unwrap_or(0);
        let orphaned = self.orphans.iter().copied().max().unwrap_or(0);
        referenced.max(orphaned) + 1
    }

    pub fn referenced_page_ids(&self) -> BTreeSet<u64> {
        self.lookups
            .values()
            .flatten()
            .map(|e| e.page_id)
            .collect()
    }

    pub fn page_size(&self) -> usize {
        if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size as usize
        }
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = fs::read(&path)?;
        serde_json::from_slice(&bytes).map_err(|e| Error::ManifestCorrupt(e.to_string()))
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(MANIFEST_FILE).exists()
    }

    /// Atomic install: temp file, fsync, rename over the live manifest,
    /// fsync the directory. Readers holding the old manifest keep reading
    /// the pages it listed.
    pub fn install(&self, dir: &Path) -> Result<()> {
        let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
        let bytes =
            serde_json::to_vec_pretty(self).map_err(|e| Error::ManifestCorrupt(e.to_string()))?;
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
        sync_dir(dir)?;
        debug!(epoch = self.epoch, "manifest installed");
        Ok(())
    }
}

pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    // Directory fsync is advisory on some platforms; ignore denials.
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn install_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mut manifest = Manifest::empty(512, Compression::default());
        manifest.epoch = 3;
        manifest.entries_mut(IndexOrder::Pos).push(PageEntry {
            primary_value: 7,
            page_id: 1,
            offset: 0,
            length: 64,
            crc32: 0xDEAD_BEEF,
            count: 10,
        });
        manifest.tombstones.insert((1, 2, 3));
        manifest.orphans.insert(9);
        manifest.install(dir.path()).unwrap();

        let loaded = Manifest::load(dir.path()).unwrap();
        assert_eq!(loaded.epoch, 3);
        assert_eq!(loaded.entries(IndexOrder::Pos).len(), 1);
        assert!(loaded.is_tombstoned(Triple::new(1, 2, 3)));
        assert_eq!(loaded.next_page_id(), 10);
    }

    #[test]
    fn stable_json_key_names() {
        let manifest = Manifest::empty(256, Compression::brotli(5));
        let json = serde_json::to_string(&manifest).unwrap();
        for key in [
            "\"epoch\"",
            "\"pageSize\"",
            "\"compression\"",
            "\"codec\"",
            "\"brotli\"",
            "\"lookups\"",
            "\"tombstones\"",
            "\"orphans\"",
            "\"checkpoint\"",
        ] {
            assert!(json.contains(key), "missing {key} in {json}");
        }
    }

    #[test]
    fn parse_failure_is_corruption() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), b"{not json").unwrap();
        let err = Manifest::load(dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Corruption);
    }
}

//! Persisted ring of recently committed transaction ids.
//!
//! Replay consults this registry so a batch whose commit survived in both
//! the WAL and the paged state (crash between manifest install and WAL
//! reset, or a retried commit) applies at most once across restarts.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const TXIDS_FILE: &str = "txids.json";
const TXIDS_FORMAT_VERSION: u32 = 1;
pub const DEFAULT_MAX_REMEMBER: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRecord {
    pub id: String,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxIdsFile {
    version: u32,
    tx_ids: Vec<TxRecord>,
    max: usize,
}

#[derive(Debug)]
pub struct TxIdRegistry {
    path: PathBuf,
    entries: VecDeque<TxRecord>,
    index: HashSet<String>,
    max_remember: usize,
    enabled: bool,
    dirty: bool,
}

impl TxIdRegistry {
    pub fn load(pages_dir: &Path, enabled: bool, max_remember: usize) -> Self {
        let path = pages_dir.join(TXIDS_FILE);
        let mut entries = VecDeque::new();
        let mut index = HashSet::new();
        if enabled
            && let Ok(bytes) = fs::read(&path)
            && let Ok(file) = serde_json::from_slice::<TxIdsFile>(&bytes)
        {
            for record in file.tx_ids {
                index.insert(record.id.clone());
                entries.push_back(record);
            }
        }
        Self {
            path,
            entries,
            index,
            max_remember: max_remember.max(1),
            enabled,
            dirty: false,
        }
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.index.contains(tx_id)
    }

    pub fn record(&mut self, tx_id: &str, session_id: Option<&str>) {
        if self.index.contains(tx_id) {
            return;
        }
        self.entries.push_back(TxRecord {
            id: tx_id.to_owned(),
            ts: Utc::now(),
            session_id: session_id.map(str::to_owned),
        });
        self.index.insert(tx_id.to_owned());
        while self.entries.len() > self.max_remember {
            if let Some(evicted) = self.entries.pop_front() {
                self.index.remove(&evicted.id);
            }
        }
        self.dirty = true;
    }

    pub fn list(&self, session_id: Option<&str>, since: Option<DateTime<Utc>>) -> Vec<TxRecord> {
        self.entries
            .iter()
            .filter(|r| session_id.is_none_or(|s| r.session_id.as_deref() == Some(s)))
            .filter(|r| since.is_none_or(|ts| r.ts >= ts))
            .cloned()
            .collect()
    }

    /// Persist atomically. A no-op when persistence is disabled; the
    /// in-memory set still dedupes within one open handle.
    pub fn save(&mut self) -> Result<()> {
        if !self.enabled || !self.dirty {
            return Ok(());
        }
        let file = TxIdsFile {
            version: TXIDS_FORMAT_VERSION,
            tx_ids: self.entries.iter().cloned().collect(),
            max: self.max_remember,
        };
        let bytes = serde_json::to_vec(&file).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut out = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            out.write_all(&bytes)?;
            out.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn record_and_reload() {
        let dir = tempdir().unwrap();
        {
            let mut registry = TxIdRegistry::load(dir.path(), true, 10);
            registry.record("t1", Some("s1"));
            registry.record("t1", Some("s1"));
            registry.record("t2", None);
            registry.save().unwrap();
        }
        let registry = TxIdRegistry::load(dir.path(), true, 10);
        assert!(registry.contains("t1"));
        assert!(registry.contains("t2"));
        assert!(!registry.contains("t3"));
        assert_eq!(registry.list(Some("s1"), None).len(), 1);
    }

    #[test]
    fn ring_is_bounded() {
        let dir = tempdir().unwrap();
        let mut registry = TxIdRegistry::load(dir.path(), true, 3);
        for i in 0..5 {
            registry.record(&format!("t{i}"), None);
        }
        assert!(!registry.contains("t0"));
        assert!(!registry.contains("t1"));
        assert!(registry.contains("t4"));
        assert_eq!(registry.list(None, None).len(), 3);
    }

    #[test]
    fn disabled_registry_does_not_persist() {
        let dir = tempdir().unwrap();
        {
            let mut registry = TxIdRegistry::load(dir.path(), false, 10);
            registry.record("t1", None);
            assert!(registry.contains("t1"));
            registry.save().unwrap();
        }
        let registry = TxIdRegistry::load(dir.path(), true, 10);
        assert!(!registry.contains("t1"));
    }
}

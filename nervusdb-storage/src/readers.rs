//! Cross-process registry of live readers.
//!
//! One JSON file per registered reader under `P.pages/readers/`. A clean
//! close removes the record; a crashed process leaves it behind, which
//! keeps conservative GC from deleting pages the dead reader might have
//! pinned until an operator clears it.

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const READERS_DIR: &str = "readers";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderRecord {
    pub pid: u32,
    pub epoch: u64,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug)]
pub struct ReaderGuard {
    path: PathBuf,
    pub epoch: u64,
}

#[derive(Debug)]
pub struct ReaderRegistry {
    dir: PathBuf,
}

impl ReaderRegistry {
    pub fn open(pages_dir: &Path) -> Result<Self> {
        let dir = pages_dir.join(READERS_DIR);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn register(&self, epoch: u64, session_id: Option<&str>) -> Result<ReaderGuard> {
        let record = ReaderRecord {
            pid: std::process::id(),
            epoch,
            ts: Utc::now(),
            session_id: session_id.map(str::to_owned),
        };
        let nonce: u32 = rand::random();
        let path = self.dir.join(format!("{}-{:08x}.json", record.pid, nonce));
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&serde_json::to_vec(&record).expect("reader record serializes"))?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(epoch, path = %path.display(), "reader registered");
        Ok(ReaderGuard { path, epoch })
    }

    pub fn unregister(&self, guard: ReaderGuard) -> Result<()> {
        match fs::remove_file(&guard.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All readable records; unparsable files are skipped, not fatal.
    pub fn list(&self) -> Result<Vec<ReaderRecord>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(bytes) = fs::read(&path)
                && let Ok(record) = serde_json::from_slice::<ReaderRecord>(&bytes)
            {
                out.push(record);
            }
        }
        out.sort_by_key(|r| (r.epoch, r.pid));
        Ok(out)
    }

    pub fn any_registered(&self) -> Result<bool> {
        Ok(!self.list()?.is_empty())
    }
}

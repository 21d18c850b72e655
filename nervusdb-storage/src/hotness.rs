//! Per-primary access counters with half-life decay.
//!
//! Every posting-group read bumps its `(order, primary)` counter; counts
//! decay exponentially so compaction scoring favours what is hot *now*.
//! Persisted as `hotness.json` next to the page files.

use crate::{Error, Result};
use chrono::Utc;
use nervusdb_api::IndexOrder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const HOTNESS_FILE: &str = "hotness.json";
const DEFAULT_HALF_LIFE_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HotEntry {
    count: f64,
    last_access_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HotnessFile {
    half_life_ms: i64,
    /// Keyed by `"<ORDER>:<primary>"`.
    counters: HashMap<String, HotEntry>,
}

#[derive(Debug)]
pub struct HotnessTracker {
    path: PathBuf,
    half_life_ms: i64,
    counters: HashMap<(IndexOrder, u64), HotEntry>,
    dirty: bool,
}

impl HotnessTracker {
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(HOTNESS_FILE);
        let mut counters = HashMap::new();
        let mut half_life_ms = DEFAULT_HALF_LIFE_MS;
        if let Ok(bytes) = fs::read(&path)
            && let Ok(file) = serde_json::from_slice::<HotnessFile>(&bytes)
        {
            half_life_ms = file.half_life_ms.max(1);
            for (key, entry) in file.counters {
                if let Some(parsed) = parse_key(&key) {
                    counters.insert(parsed, entry);
                }
            }
        }
        Self {
            path,
            half_life_ms,
            counters,
            dirty: false,
        }
    }

    pub fn record_access(&mut self, order: IndexOrder, primary: u64) {
        let now = now_ms();
        let entry = self
            .counters
            .entry((order, primary))
            .or_insert(HotEntry {
                count: 0.0,
                last_access_ms: now,
            });
        entry.count = decayed(entry.count, entry.last_access_ms, now, self.half_life_ms) + 1.0;
        entry.last_access_ms = now;
        self.dirty = true;
    }

    /// Decayed counter as of now; 0 for untouched groups.
    pub fn heat(&self, order: IndexOrder, primary: u64) -> f64 {
        let now = now_ms();
        self.counters
            .get(&(order, primary))
            .map(|e| decayed(e.count, e.last_access_ms, now, self.half_life_ms))
            .unwrap_or(0.0)
    }

    pub fn last_access_ms(&self, order: IndexOrder, primary: u64) -> i64 {
        self.counters
            .get(&(order, primary))
            .map(|e| e.last_access_ms)
            .unwrap_or(0)
    }

    /// Hottest decayed counter, for normalizing scores.
    pub fn max_heat(&self) -> f64 {
        let now = now_ms();
        self.counters
            .values()
            .map(|e| decayed(e.count, e.last_access_ms, now, self.half_life_ms))
            .fold(0.0, f64::max)
    }

    /// Top `n` groups by decayed heat, hottest first.
    pub fn hottest(&self, n: usize) -> Vec<(IndexOrder, u64, f64)> {
        let now = now_ms();
        let mut all: Vec<(IndexOrder, u64, f64)> = self
            .counters
            .iter()
            .map(|(&(order, primary), e)| {
                (
                    order,
                    primary,
                    decayed(e.count, e.last_access_ms, now, self.half_life_ms),
                )
            })
            .collect();
        all.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.1.cmp(&b.1)));
        all.truncate(n);
        all
    }

    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let file = HotnessFile {
            half_life_ms: self.half_life_ms,
            counters: self
                .counters
                .iter()
                .map(|(&(order, primary), entry)| (format!("{order}:{primary}"), *entry))
                .collect(),
        };
        let bytes =
            serde_json::to_vec(&file).map_err(|e| Error::InvalidArgument(e.to_string()))?;
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

fn decayed(count: f64, last_ms: i64, now_ms: i64, half_life_ms: i64) -> f64 {
    if count <= 0.0 {
        return 0.0;
    }
    let dt = (now_ms - last_ms).max(0) as f64;
    count * 0.5f64.powf(dt / half_life_ms as f64)
}

fn parse_key(key: &str) -> Option<(IndexOrder, u64)> {
    let (order, primary) = key.split_once(':')?;
    Some((IndexOrder::parse(order)?, primary.parse().ok()?))
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

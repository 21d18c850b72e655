//! The unflushed write buffer: staged adds plus pending tombstones.
//!
//! The triple set is a mathematical set; version counters advance only on
//! observable change so no-op writes stay invisible.

use nervusdb_api::Triple;
use std::collections::BTreeSet;

#[derive(Debug, Default)]
pub struct TripleStore {
    added: BTreeSet<Triple>,
    /// Deletions of paged triples awaiting the next flush.
    pending_tombstones: BTreeSet<Triple>,
    version: u64,
}

impl TripleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages `t` for the next flush. A pending tombstone on the same
    /// triple is withdrawn (re-add after delete).
    pub fn add(&mut self, t: Triple) -> bool {
        let revived = self.pending_tombstones.remove(&t);
        let inserted = self.added.insert(t);
        if revived || inserted {
            self.version += 1;
        }
        revived || inserted
    }

    /// Unstages `t`; when `was_paged`, records a tombstone for the paged
    /// occurrence.
    pub fn remove(&mut self, t: Triple, was_paged: bool) -> bool {
        let unstaged = self.added.remove(&t);
        let tombstoned = was_paged && self.pending_tombstones.insert(t);
        if unstaged || tombstoned {
            self.version += 1;
        }
        unstaged || tombstoned
    }

    pub fn contains(&self, t: Triple) -> bool {
        self.added.contains(&t)
    }

    pub fn is_tombstoned(&self, t: Triple) -> bool {
        self.pending_tombstones.contains(&t)
    }

    pub fn added(&self) -> &BTreeSet<Triple> {
        &self.added
    }

    pub fn pending_tombstones(&self) -> &BTreeSet<Triple> {
        &self.pending_tombstones
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.pending_tombstones.is_empty()
    }

    /// Drops everything merged by a successful flush.
    pub fn clear(&mut self) {
        self.added.clear();
        self.pending_tombstones.clear();
    }

    /// Buffered state plus version, captured at batch start.
    pub fn snapshot(&self) -> (BTreeSet<Triple>, BTreeSet<Triple>, u64) {
        (
            self.added.clone(),
            self.pending_tombstones.clone(),
            self.version,
        )
    }

    /// Restores buffered state, used by recovery and abort undo.
    pub fn restore(
        &mut self,
        added: BTreeSet<Triple>,
        pending_tombstones: BTreeSet<Triple>,
        version: u64,
    ) {
        self.added = added;
        self.pending_tombstones = pending_tombstones;
        self.version = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_remove_is_a_noop_set() {
        let mut store = TripleStore::new();
        let t = Triple::new(1, 2, 3);
        assert!(store.add(t));
        assert!(store.remove(t, false));
        assert!(store.is_empty());
        assert!(!store.is_tombstoned(t));
    }

    #[test]
    fn remove_of_paged_triple_records_tombstone() {
        let mut store = TripleStore::new();
        let t = Triple::new(1, 2, 3);
        assert!(store.remove(t, true));
        assert!(store.is_tombstoned(t));
        // Re-add withdraws the pending tombstone.
        assert!(store.add(t));
        assert!(!store.is_tombstoned(t));
        assert!(store.contains(t));
    }

    #[test]
    fn version_only_moves_on_change() {
        let mut store = TripleStore::new();
        let t = Triple::new(1, 2, 3);
        store.add(t);
        let v = store.version();
        assert!(!store.add(t));
        assert_eq!(store.version(), v);
        assert!(!store.remove(Triple::new(9, 9, 9), false));
        assert_eq!(store.version(), v);
    }
}

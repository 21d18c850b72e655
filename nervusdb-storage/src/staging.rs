//! In-memory six-order index over unflushed triples.
//!
//! Each order keeps the same triple set permuted into its
//! `(primary, secondary, tertiary)` shape inside a `BTreeSet`, so prefix
//! scans are plain range queries.

use nervusdb_api::{IndexOrder, NodeId, Triple};
use std::collections::BTreeSet;

#[derive(Debug, Default)]
pub struct StagingIndex {
    orders: [BTreeSet<(u64, u64, u64)>; 6],
}

impl StagingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, order: IndexOrder) -> &BTreeSet<(u64, u64, u64)> {
        &self.orders[order_slot(order)]
    }

    /// Idempotent insert; returns true when the set changed.
    pub fn add(&mut self, t: Triple) -> bool {
        let mut changed = false;
        for order in IndexOrder::ALL {
            changed |= self.orders[order_slot(order)].insert(order.permute(t));
        }
        changed
    }

    /// Returns true when the set changed.
    pub fn remove(&mut self, t: Triple) -> bool {
        let mut changed = false;
        for order in IndexOrder::ALL {
            changed |= self.orders[order_slot(order)].remove(&order.permute(t));
        }
        changed
    }

    pub fn contains(&self, t: Triple) -> bool {
        self.bucket(IndexOrder::Spo).contains(&(t.s, t.p, t.o))
    }

    pub fn len(&self) -> usize {
        self.bucket(IndexOrder::Spo).len()
    }

    pub fn is_empty(&self) -> bool {
        self.bucket(IndexOrder::Spo).is_empty()
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.orders {
            bucket.clear();
        }
    }

    /// Ordered scan of one bucket with an optional fixed prefix.
    pub fn iter_range(
        &self,
        order: IndexOrder,
        primary: Option<NodeId>,
        secondary: Option<NodeId>,
    ) -> impl Iterator<Item = Triple> + '_ {
        let (lo, hi) = range_bounds(primary, secondary);
        self.bucket(order)
            .range(lo..=hi)
            .map(move |&(p, s, t)| order.restore(p, s, t))
    }

    /// `(secondary, tertiary)` pairs of one primary bucket.
    pub fn group(&self, order: IndexOrder, primary: NodeId) -> Vec<(u64, u64)> {
        self.bucket(order)
            .range((primary, u64::MIN, u64::MIN)..=(primary, u64::MAX, u64::MAX))
            .map(|&(_, s, t)| (s, t))
            .collect()
    }

    /// Distinct primary values present in one order, ascending.
    pub fn primaries(&self, order: IndexOrder) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = Vec::new();
        for &(p, _, _) in self.bucket(order) {
            if out.last() != Some(&p) {
                out.push(p);
            }
        }
        out
    }

    pub fn iter_all(&self) -> impl Iterator<Item = Triple> + '_ {
        self.bucket(IndexOrder::Spo)
            .iter()
            .map(|&(s, p, o)| Triple::new(s, p, o))
    }
}

const fn order_slot(order: IndexOrder) -> usize {
    match order {
        IndexOrder::Spo => 0,
        IndexOrder::Sop => 1,
        IndexOrder::Pos => 2,
        IndexOrder::Pso => 3,
        IndexOrder::Osp => 4,
        IndexOrder::Ops => 5,
    }
}

fn range_bounds(
    primary: Option<NodeId>,
    secondary: Option<NodeId>,
) -> ((u64, u64, u64), (u64, u64, u64)) {
    match (primary, secondary) {
        (Some(p), Some(s)) => ((p, s, u64::MIN), (p, s, u64::MAX)),
        (Some(p), None) => ((p, u64::MIN, u64::MIN), (p, u64::MAX, u64::MAX)),
        (None, _) => (
            (u64::MIN, u64::MIN, u64::MIN),
            (u64::MAX, u64::MAX, u64::MAX),
        ),
    }
}

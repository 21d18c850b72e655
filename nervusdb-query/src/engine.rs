//! Criteria execution: resolve strings, pick an order, run a bounded
//! scan against the view.

use crate::paths::{self, WeightedPath};
use crate::plan;
use crate::traverse::{self, EdgeFilter, PathIter, TraversalStep};
use crate::{Error, Result};
use nervusdb_api::{
    Direction, GraphView, NodeId, ResolvedTriple, Triple, TripleCriteria, Uniqueness,
};
use std::collections::BTreeSet;

/// A lookup pattern over strings; unknown strings make the result empty
/// rather than failing.
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    pub s: Option<String>,
    pub p: Option<String>,
    pub o: Option<String>,
}

impl Criteria {
    pub fn subject(mut self, s: impl Into<String>) -> Self {
        self.s = Some(s.into());
        self
    }

    pub fn predicate(mut self, p: impl Into<String>) -> Self {
        self.p = Some(p.into());
        self
    }

    pub fn object(mut self, o: impl Into<String>) -> Self {
        self.o = Some(o.into());
        self
    }
}

pub struct QueryEngine<'a, V: GraphView> {
    view: &'a V,
}

impl<'a, V: GraphView> QueryEngine<'a, V> {
    pub fn new(view: &'a V) -> Self {
        Self { view }
    }

    #[inline]
    pub fn view(&self) -> &'a V {
        self.view
    }

    /// Resolves a string criterion against the dictionary. `None` means
    /// some term is unknown, so no triple can match.
    pub fn resolve_criteria(&self, criteria: &Criteria) -> Option<TripleCriteria> {
        let mut out = TripleCriteria::default();
        for (value, slot) in [
            (&criteria.s, &mut out.s),
            (&criteria.p, &mut out.p),
            (&criteria.o, &mut out.o),
        ] {
            if let Some(value) = value {
                *slot = Some(self.view.lookup_id(value)?);
            }
        }
        Some(out)
    }

    /// Criteria lookup over ids. Selects the best order, scans its fixed
    /// prefix, and filters any dimension the prefix could not bind.
    pub fn query_ids(&self, criteria: TripleCriteria) -> Box<dyn Iterator<Item = Triple> + 'a> {
        let order = plan::select_order(&criteria);
        let (primary, secondary) = plan::scan_bounds(order, &criteria);
        let scan = self.view.scan(order, primary, secondary);
        // The prefix binds at most two dimensions; recheck the rest.
        Box::new(scan.filter(move |t| criteria.matches(*t)))
    }

    /// String-criteria lookup; unknown strings yield an empty iterator.
    pub fn query(&self, criteria: &Criteria) -> Box<dyn Iterator<Item = Triple> + 'a> {
        match self.resolve_criteria(criteria) {
            Some(ids) => self.query_ids(ids),
            None => Box::new(std::iter::empty()),
        }
    }

    /// As [`query`](Self::query), with ids resolved back to strings.
    pub fn query_resolved(
        &self,
        criteria: &Criteria,
    ) -> Box<dyn Iterator<Item = ResolvedTriple> + 'a> {
        let view = self.view;
        Box::new(self.query(criteria).filter_map(|t| view.resolve_triple(t)))
    }

    /// One traversal layer: every `(n, predicate, ?)` (forward) or
    /// `(?, predicate, n)` (reverse) fact of the frontier nodes.
    pub fn traverse(
        &self,
        frontier: &BTreeSet<NodeId>,
        predicate: NodeId,
        direction: Direction,
    ) -> TraversalStep {
        traverse::traverse(self.view, frontier, predicate, direction)
    }

    /// Variable-length breadth-first traversal emitting facts whose depth
    /// falls within `min..=max`.
    pub fn follow_path(
        &self,
        frontier: BTreeSet<NodeId>,
        predicate: NodeId,
        min: usize,
        max: usize,
        direction: Direction,
        uniqueness: Uniqueness,
        filter: Option<EdgeFilter<'a>>,
    ) -> Result<PathIter<'a, V>> {
        if min > max {
            return Err(Error::InvalidArgument(format!(
                "invalid depth range [{min}, {max}]"
            )));
        }
        Ok(traverse::follow_path(
            self.view, frontier, predicate, min, max, direction, uniqueness, filter,
        ))
    }

    /// Fewest-hops path along `predicate`, or `None` within `max_hops`.
    pub fn shortest_path(
        &self,
        source: NodeId,
        target: NodeId,
        predicate: NodeId,
        max_hops: usize,
    ) -> Option<Vec<Triple>> {
        paths::shortest_path(self.view, source, target, predicate, max_hops)
    }

    /// Interleaved two-sided search over a predicate set.
    pub fn bidirectional_path(
        &self,
        source: NodeId,
        target: NodeId,
        predicates: &BTreeSet<NodeId>,
        max_hops: usize,
    ) -> Option<Vec<Triple>> {
        paths::bidirectional_path(self.view, source, target, predicates, max_hops)
    }

    /// Dijkstra over edge-document weights under `weight_key`; missing or
    /// non-finite weights count as 1.
    pub fn shortest_path_weighted(
        &self,
        source: NodeId,
        target: NodeId,
        predicate: NodeId,
        weight_key: &str,
    ) -> Option<WeightedPath> {
        paths::shortest_path_weighted(self.view, source, target, predicate, weight_key)
    }
}

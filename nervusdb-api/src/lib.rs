pub mod property;

pub use property::{Document, PropertyDecodeError, PropertyValue};

use serde::{Deserialize, Serialize};

/// Identifier assigned to every interned string. Ids start at 1 and are
/// never reused for the lifetime of a database.
pub type NodeId = u64;

/// A `(subject, predicate, object)` fact over interned ids.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Triple {
    pub s: NodeId,
    pub p: NodeId,
    pub o: NodeId,
}

impl Triple {
    pub const fn new(s: NodeId, p: NodeId, o: NodeId) -> Self {
        Self { s, p, o }
    }

    pub const fn as_tuple(self) -> (NodeId, NodeId, NodeId) {
        (self.s, self.p, self.o)
    }
}

impl From<(NodeId, NodeId, NodeId)> for Triple {
    fn from((s, p, o): (NodeId, NodeId, NodeId)) -> Self {
        Self { s, p, o }
    }
}

/// The six posting orders. The name spells out primary, secondary and
/// tertiary dimension: SPO buckets by subject and sorts by predicate then
/// object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexOrder {
    Spo,
    Sop,
    Pos,
    Pso,
    Osp,
    Ops,
}

impl IndexOrder {
    pub const ALL: [IndexOrder; 6] = [
        IndexOrder::Spo,
        IndexOrder::Sop,
        IndexOrder::Pos,
        IndexOrder::Pso,
        IndexOrder::Osp,
        IndexOrder::Ops,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            IndexOrder::Spo => "SPO",
            IndexOrder::Sop => "SOP",
            IndexOrder::Pos => "POS",
            IndexOrder::Pso => "PSO",
            IndexOrder::Osp => "OSP",
            IndexOrder::Ops => "OPS",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        IndexOrder::ALL.into_iter().find(|o| o.name() == name)
    }

    /// Reorders a triple into this order's `(primary, secondary, tertiary)`.
    pub const fn permute(self, t: Triple) -> (NodeId, NodeId, NodeId) {
        match self {
            IndexOrder::Spo => (t.s, t.p, t.o),
            IndexOrder::Sop => (t.s, t.o, t.p),
            IndexOrder::Pos => (t.p, t.o, t.s),
            IndexOrder::Pso => (t.p, t.s, t.o),
            IndexOrder::Osp => (t.o, t.s, t.p),
            IndexOrder::Ops => (t.o, t.p, t.s),
        }
    }

    /// Inverse of [`permute`](Self::permute).
    pub const fn restore(self, primary: NodeId, secondary: NodeId, tertiary: NodeId) -> Triple {
        match self {
            IndexOrder::Spo => Triple::new(primary, secondary, tertiary),
            IndexOrder::Sop => Triple::new(primary, tertiary, secondary),
            IndexOrder::Pos => Triple::new(tertiary, primary, secondary),
            IndexOrder::Pso => Triple::new(secondary, primary, tertiary),
            IndexOrder::Osp => Triple::new(secondary, tertiary, primary),
            IndexOrder::Ops => Triple::new(tertiary, secondary, primary),
        }
    }
}

impl std::fmt::Display for IndexOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Direction of an associative traversal step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Cycle handling for variable-length traversals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Uniqueness {
    /// Never revisit a node.
    #[default]
    Node,
    /// Never re-emit an edge; nodes may repeat.
    Edge,
    /// No visited tracking; the depth bound is the only brake.
    None,
}

/// A lookup pattern: any subset of the three dimensions may be fixed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TripleCriteria {
    pub s: Option<NodeId>,
    pub p: Option<NodeId>,
    pub o: Option<NodeId>,
}

impl TripleCriteria {
    pub fn matches(&self, t: Triple) -> bool {
        self.s.is_none_or(|s| s == t.s)
            && self.p.is_none_or(|p| p == t.p)
            && self.o.is_none_or(|o| o == t.o)
    }
}

/// A triple whose three ids have been resolved back to their strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTriple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub key: Triple,
}

/// Read-side contract the query engine executes against.
///
/// Implemented by the live store view (staging merged over pages) and by
/// pinned-epoch views (frozen paged state only).
pub trait GraphView {
    fn lookup_id(&self, value: &str) -> Option<NodeId>;

    fn resolve_value(&self, id: NodeId) -> Option<String>;

    /// Ordered scan of one posting order, optionally bounded by a fixed
    /// primary and secondary value. Yields deduplicated, tombstone-free
    /// triples in `(primary, secondary, tertiary)` order.
    fn scan(
        &self,
        order: IndexOrder,
        primary: Option<NodeId>,
        secondary: Option<NodeId>,
    ) -> Box<dyn Iterator<Item = Triple> + '_>;

    fn contains_triple(&self, triple: Triple) -> bool {
        let (p, s, _) = IndexOrder::Spo.permute(triple);
        self.scan(IndexOrder::Spo, Some(p), Some(s))
            .any(|t| t == triple)
    }

    fn node_document(&self, id: NodeId) -> Option<Document>;

    fn edge_document(&self, key: Triple) -> Option<Document>;

    fn resolve_triple(&self, t: Triple) -> Option<ResolvedTriple> {
        Some(ResolvedTriple {
            subject: self.resolve_value(t.s)?,
            predicate: self.resolve_value(t.p)?,
            object: self.resolve_value(t.o)?,
            key: t,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permute_restore_roundtrip_all_orders() {
        let t = Triple::new(11, 22, 33);
        for order in IndexOrder::ALL {
            let (p, s, r) = order.permute(t);
            assert_eq!(order.restore(p, s, r), t, "order {order}");
        }
    }

    #[test]
    fn order_names_parse_back() {
        for order in IndexOrder::ALL {
            assert_eq!(IndexOrder::parse(order.name()), Some(order));
        }
        assert_eq!(IndexOrder::parse("XYZ"), None);
    }

    #[test]
    fn criteria_matching() {
        let c = TripleCriteria {
            s: Some(1),
            p: None,
            o: Some(3),
        };
        assert!(c.matches(Triple::new(1, 9, 3)));
        assert!(!c.matches(Triple::new(1, 9, 4)));
        assert!(TripleCriteria::default().matches(Triple::new(7, 8, 9)));
    }
}

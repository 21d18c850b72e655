//! Path search: unweighted BFS, interleaved bidirectional BFS, and
//! Dijkstra over edge-document weights.

use crate::traverse::neighbors;
use nervusdb_api::{Direction, GraphView, NodeId, Triple};
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};

/// An ordered edge list with its accumulated weight.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedPath {
    pub edges: Vec<Triple>,
    pub cost: f64,
}

/// Fewest-hops directed path `source → target` along `predicate`.
pub fn shortest_path<V: GraphView>(
    view: &V,
    source: NodeId,
    target: NodeId,
    predicate: NodeId,
    max_hops: usize,
) -> Option<Vec<Triple>> {
    if source == target {
        return Some(Vec::new());
    }
    let mut parents: HashMap<NodeId, Triple> = HashMap::new();
    let mut queue: VecDeque<(NodeId, usize)> = VecDeque::from([(source, 0)]);
    let mut visited: HashSet<NodeId> = HashSet::from([source]);

    while let Some((node, depth)) = queue.pop_front() {
        if depth >= max_hops {
            continue;
        }
        for t in neighbors(view, node, predicate, Direction::Forward) {
            if !visited.insert(t.o) {
                continue;
            }
            parents.insert(t.o, t);
            if t.o == target {
                return Some(reconstruct_forward(&parents, source, target));
            }
            queue.push_back((t.o, depth + 1));
        }
    }
    None
}

/// Interleaved forward-from-source / reverse-from-target search over a
/// predicate set; `None` when no path within `max_hops` exists.
pub fn bidirectional_path<V: GraphView>(
    view: &V,
    source: NodeId,
    target: NodeId,
    predicates: &BTreeSet<NodeId>,
    max_hops: usize,
) -> Option<Vec<Triple>> {
    if predicates.is_empty() {
        return None;
    }
    if source == target {
        return Some(Vec::new());
    }

    // parent edge toward the node, per side.
    let mut forward_parents: HashMap<NodeId, Triple> = HashMap::new();
    let mut backward_parents: HashMap<NodeId, Triple> = HashMap::new();
    let mut forward_seen: HashSet<NodeId> = HashSet::from([source]);
    let mut backward_seen: HashSet<NodeId> = HashSet::from([target]);
    let mut forward_frontier: BTreeSet<NodeId> = BTreeSet::from([source]);
    let mut backward_frontier: BTreeSet<NodeId> = BTreeSet::from([target]);
    let mut hops = 0;

    while hops < max_hops && !forward_frontier.is_empty() && !backward_frontier.is_empty() {
        hops += 1;
        // Expand the smaller side first; ties expand forward.
        let expand_forward = forward_frontier.len() <= backward_frontier.len();
        if expand_forward {
            let mut next = BTreeSet::new();
            for &node in &forward_frontier {
                for predicate in predicates {
                    for t in neighbors(view, node, *predicate, Direction::Forward) {
                        if !forward_seen.insert(t.o) {
                            continue;
                        }
                        forward_parents.insert(t.o, t);
                        if backward_seen.contains(&t.o) {
                            return Some(join_paths(
                                &forward_parents,
                                &backward_parents,
                                source,
                                target,
                                t.o,
                            ));
                        }
                        next.insert(t.o);
                    }
                }
            }
            forward_frontier = next;
        } else {
            let mut next = BTreeSet::new();
            for &node in &backward_frontier {
                for predicate in predicates {
                    for t in neighbors(view, node, *predicate, Direction::Reverse) {
                        if !backward_seen.insert(t.s) {
                            continue;
                        }
                        backward_parents.insert(t.s, t);
                        if forward_seen.contains(&t.s) {
                            return Some(join_paths(
                                &forward_parents,
                                &backward_parents,
                                source,
                                target,
                                t.s,
                            ));
                        }
                        next.insert(t.s);
                    }
                }
            }
            backward_frontier = next;
        }
    }
    None
}

/// Dijkstra on the outgoing-edge oracle; weights come from the edge
/// document's `weight_key`, defaulting to 1 when missing or non-finite.
pub fn shortest_path_weighted<V: GraphView>(
    view: &V,
    source: NodeId,
    target: NodeId,
    predicate: NodeId,
    weight_key: &str,
) -> Option<WeightedPath> {
    if source == target {
        return Some(WeightedPath {
            edges: Vec::new(),
            cost: 0.0,
        });
    }

    let mut dist: HashMap<NodeId, f64> = HashMap::from([(source, 0.0)]);
    let mut parents: HashMap<NodeId, Triple> = HashMap::new();
    let mut settled: HashSet<NodeId> = HashSet::new();
    let mut heap: BinaryHeap<Reverse<(OrderedFloat<f64>, NodeId)>> = BinaryHeap::new();
    heap.push(Reverse((OrderedFloat(0.0), source)));

    while let Some(Reverse((OrderedFloat(cost), node))) = heap.pop() {
        if !settled.insert(node) {
            continue;
        }
        if node == target {
            return Some(WeightedPath {
                edges: reconstruct_forward(&parents, source, target),
                cost,
            });
        }
        for t in neighbors(view, node, predicate, Direction::Forward) {
            if settled.contains(&t.o) {
                continue;
            }
            let next_cost = cost + edge_weight(view, t, weight_key);
            let better = dist.get(&t.o).is_none_or(|&known| next_cost < known);
            if better {
                dist.insert(t.o, next_cost);
                parents.insert(t.o, t);
                heap.push(Reverse((OrderedFloat(next_cost), t.o)));
            }
        }
    }
    None
}

fn edge_weight<V: GraphView>(view: &V, edge: Triple, weight_key: &str) -> f64 {
    view.edge_document(edge)
        .and_then(|doc| doc.value.get(weight_key).and_then(|v| v.as_f64()))
        .filter(|w| w.is_finite())
        .unwrap_or(1.0)
}

fn reconstruct_forward(
    parents: &HashMap<NodeId, Triple>,
    source: NodeId,
    target: NodeId,
) -> Vec<Triple> {
    let mut edges = Vec::new();
    let mut node = target;
    while node != source {
        let Some(&edge) = parents.get(&node) else {
            break;
        };
        edges.push(edge);
        node = edge.s;
    }
    edges.reverse();
    edges
}

fn join_paths(
    forward_parents: &HashMap<NodeId, Triple>,
    backward_parents: &HashMap<NodeId, Triple>,
    source: NodeId,
    target: NodeId,
    meeting: NodeId,
) -> Vec<Triple> {
    let mut edges = reconstruct_forward(forward_parents, source, meeting);
    let mut node = meeting;
    while node != target {
        let Some(&edge) = backward_parents.get(&node) else {
            break;
        };
        edges.push(edge);
        node = edge.o;
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::MemoryView;
    use nervusdb_api::PropertyValue;

    fn weight(view: &mut MemoryView, t: Triple, w: f64) {
        view.edge_docs.insert(
            t,
            PropertyValue::Map(vec![("w".to_string(), PropertyValue::Float(w))]),
        );
    }

    #[test]
    fn bfs_finds_fewest_hops() {
        let mut view = MemoryView::default();
        view.add("a", "r", "b");
        view.add("b", "r", "c");
        view.add("a", "r", "c");
        let (a, r, c) = (
            view.lookup_id("a").unwrap(),
            view.lookup_id("r").unwrap(),
            view.lookup_id("c").unwrap(),
        );
        let path = shortest_path(&view, a, c, r, 10).unwrap();
        assert_eq!(path, vec![Triple::new(a, r, c)]);
        assert!(shortest_path(&view, c, a, r, 10).is_none());
    }

    #[test]
    fn hop_bound_is_respected() {
        let mut view = MemoryView::default();
        view.add("a", "r", "b");
        view.add("b", "r", "c");
        let (a, r, c) = (
            view.lookup_id("a").unwrap(),
            view.lookup_id("r").unwrap(),
            view.lookup_id("c").unwrap(),
        );
        assert!(shortest_path(&view, a, c, r, 1).is_none());
        assert_eq!(shortest_path(&view, a, c, r, 2).unwrap().len(), 2);
    }

    #[test]
    fn bidirectional_meets_in_the_middle() {
        let mut view = MemoryView::default();
        for (s, o) in [("a", "b"), ("b", "c"), ("c", "d"), ("d", "e")] {
            view.add(s, "r", o);
        }
        let (a, r, e) = (
            view.lookup_id("a").unwrap(),
            view.lookup_id("r").unwrap(),
            view.lookup_id("e").unwrap(),
        );
        let path = bidirectional_path(&view, a, e, &BTreeSet::from([r]), 4).unwrap();
        assert_eq!(path.len(), 4);
        assert_eq!(path[0].s, a);
        assert_eq!(path[3].o, e);
        // Consecutive edges chain endpoint to endpoint.
        for pair in path.windows(2) {
            assert_eq!(pair[0].o, pair[1].s);
        }
        assert!(bidirectional_path(&view, a, e, &BTreeSet::from([r]), 3).is_none());
    }

    #[test]
    fn dijkstra_prefers_cheap_detours() {
        let mut view = MemoryView::default();
        let direct = view.add("a", "r", "c");
        let leg1 = view.add("a", "r", "b");
        let leg2 = view.add("b", "r", "c");
        weight(&mut view, direct, 10.0);
        weight(&mut view, leg1, 1.0);
        weight(&mut view, leg2, 2.0);

        let (a, r, c) = (
            view.lookup_id("a").unwrap(),
            view.lookup_id("r").unwrap(),
            view.lookup_id("c").unwrap(),
        );
        let path = shortest_path_weighted(&view, a, c, r, "w").unwrap();
        assert_eq!(path.edges, vec![leg1, leg2]);
        assert!((path.cost - 3.0).abs() < 1e-9);
    }

    #[test]
    fn missing_and_non_finite_weights_count_as_one() {
        let mut view = MemoryView::default();
        let direct = view.add("a", "r", "c");
        let leg1 = view.add("a", "r", "b");
        let leg2 = view.add("b", "r", "c");
        // direct has a NaN weight -> 1; legs have no docs -> 1 each.
        view.edge_docs.insert(
            direct,
            PropertyValue::Map(vec![("w".to_string(), PropertyValue::Float(f64::NAN))]),
        );
        let (a, r, c) = (
            view.lookup_id("a").unwrap(),
            view.lookup_id("r").unwrap(),
            view.lookup_id("c").unwrap(),
        );
        let path = shortest_path_weighted(&view, a, c, r, "w").unwrap();
        assert_eq!(path.edges, vec![direct]);
        assert!((path.cost - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unreachable_target_is_none() {
        let mut view = MemoryView::default();
        view.add("a", "r", "b");
        view.add("x", "r", "y");
        let (a, r, y) = (
            view.lookup_id("a").unwrap(),
            view.lookup_id("r").unwrap(),
            view.lookup_id("y").unwrap(),
        );
        assert!(shortest_path_weighted(&view, a, y, r, "w").is_none());
    }
}

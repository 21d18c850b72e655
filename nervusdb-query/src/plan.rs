//! Index-order selection: pick the order whose fixed prefix covers the
//! criterion, so the scan is a contiguous range instead of a filter.

use nervusdb_api::{IndexOrder, TripleCriteria};

/// | fixed        | order |
/// |--------------|-------|
/// | s, p, o      | SPO   |
/// | s, p         | SPO   |
/// | s, o         | SOP   |
/// | p, o         | POS   |
/// | s            | SPO   |
/// | p            | POS   |
/// | o            | OSP   |
/// | none         | SPO (full scan) |
pub fn select_order(criteria: &TripleCriteria) -> IndexOrder {
    match (criteria.s, criteria.p, criteria.o) {
        (Some(_), Some(_), _) => IndexOrder::Spo,
        (Some(_), None, Some(_)) => IndexOrder::Sop,
        (None, Some(_), Some(_)) => IndexOrder::Pos,
        (Some(_), None, None) => IndexOrder::Spo,
        (None, Some(_), None) => IndexOrder::Pos,
        (None, None, Some(_)) => IndexOrder::Osp,
        (None, None, None) => IndexOrder::Spo,
    }
}

/// Bounds the chosen order's scan: fixed primary and, when the criterion
/// covers it, fixed secondary.
pub(crate) fn scan_bounds(
    order: IndexOrder,
    criteria: &TripleCriteria,
) -> (Option<u64>, Option<u64>) {
    let probe = nervusdb_api::Triple::new(
        criteria.s.unwrap_or(0),
        criteria.p.unwrap_or(0),
        criteria.o.unwrap_or(0),
    );
    let (primary, secondary, _) = order.permute(probe);
    let fixed = |dim: Option<u64>, value: u64| dim.map(|_| value);
    match order {
        IndexOrder::Spo => (fixed(criteria.s, primary), fixed(criteria.p, secondary)),
        IndexOrder::Sop => (fixed(criteria.s, primary), fixed(criteria.o, secondary)),
        IndexOrder::Pos => (fixed(criteria.p, primary), fixed(criteria.o, secondary)),
        IndexOrder::Pso => (fixed(criteria.p, primary), fixed(criteria.s, secondary)),
        IndexOrder::Osp => (fixed(criteria.o, primary), fixed(criteria.s, secondary)),
        IndexOrder::Ops => (fixed(criteria.o, primary), fixed(criteria.p, secondary)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria(s: Option<u64>, p: Option<u64>, o: Option<u64>) -> TripleCriteria {
        TripleCriteria { s, p, o }
    }

    #[test]
    fn selection_table() {
        assert_eq!(select_order(&criteria(Some(1), Some(2), None)), IndexOrder::Spo);
        assert_eq!(select_order(&criteria(Some(1), None, Some(3))), IndexOrder::Sop);
        assert_eq!(select_order(&criteria(None, Some(2), Some(3))), IndexOrder::Pos);
        assert_eq!(select_order(&criteria(Some(1), None, None)), IndexOrder::Spo);
        assert_eq!(select_order(&criteria(None, Some(2), None)), IndexOrder::Pos);
        assert_eq!(select_order(&criteria(None, None, Some(3))), IndexOrder::Osp);
        assert_eq!(select_order(&criteria(None, None, None)), IndexOrder::Spo);
        assert_eq!(
            select_order(&criteria(Some(1), Some(2), Some(3))),
            IndexOrder::Spo
        );
    }

    #[test]
    fn bounds_follow_the_fixed_prefix() {
        let c = criteria(None, Some(7), Some(9));
        let order = select_order(&c);
        assert_eq!(scan_bounds(order, &c), (Some(7), Some(9)));

        let c = criteria(Some(4), None, None);
        assert_eq!(scan_bounds(select_order(&c), &c), (Some(4), None));

        let c = criteria(None, None, None);
        assert_eq!(scan_bounds(select_order(&c), &c), (None, None));
    }
}

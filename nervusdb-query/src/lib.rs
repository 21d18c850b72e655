//! Criteria lookup, chained associative traversal, and path search over
//! any [`GraphView`].

mod engine;
mod error;
mod paths;
mod plan;
mod traverse;

pub use engine::{Criteria, QueryEngine};
pub use error::{Error, Result};
pub use paths::WeightedPath;
pub use plan::select_order;
pub use traverse::{EdgeFilter, PathIter, TraversalStep};

pub use nervusdb_api::{Direction, GraphView, IndexOrder, NodeId, Triple, Uniqueness};

//! R-tree spatial index.
//!
//! A bulk R-tree with quadratic split, condense-with-reinsert deletion,
//! overlap search, priority-queue nearest-neighbor traversal, and a
//! deterministic pre-order save/load used by snapshots.

#![warn(clippy::all)]

mod rtree;

pub use rtree::{RTree, RTreeStats};

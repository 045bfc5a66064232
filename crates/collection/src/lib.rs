//! Multi-indexed storage of geospatial items.
//!
//! A [`Collection`] ties together an id-ordered map, a value-ordered set for
//! non-spatial strings, an R-tree over spatial objects, and the column-packed
//! field store. Area expressions ([`AreaExpression`]) compose spatial
//! predicates with NOT/AND/OR, and the snapshot module serializes a whole
//! collection to its five-file on-disk form.

#![warn(clippy::all)]

mod area;
mod collection;
mod field_values;
mod parse;
pub mod snapshot;

pub use area::{AreaExpression, BinaryOp};
pub use collection::{Collection, CollectionStats, CollectionStatsSnapshot, Cursor};
pub use field_values::{FieldSlot, FieldValues, NIL_SLOT};
pub use parse::{parse_area, parse_area_expression, parse_nearby_area, ColLookup};

//! The collection: one keyspace entry tying together the id index, the
//! value index, the R-tree, and the field store.
//!
//! Iteration is cursor-driven and cooperative: every 256th step the iterator
//! yields the OS scheduler and checks the transaction status, surfacing an
//! abort as an error through `?` rather than a panic. Spatial queries go
//! through the R-tree; string values through the value-ordered set; plain
//! scans through the id-ordered map.

use crate::area::AreaExpression;
use crate::field_values::{FieldSlot, FieldValues, NIL_SLOT};
use meridian_core::geometry::{Point, Rect};
use meridian_core::{dist, Object};
use meridian_index::{RTree, RTreeStats};
use meridian_txn::{Status, TxnError};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Force the iterator to yield the OS scheduler every 256 steps.
const YIELD_STEP: u64 = 255;

/// Paging cursor handed through Scan, Within, Intersects and Nearby.
/// Stepping takes `&self` so the same state can back the caller's output
/// writer while the iteration advances it.
pub trait Cursor {
    /// Items already visited by previous calls.
    fn offset(&self) -> u64;
    /// Record `count` additional iterations.
    fn step(&self, count: u64);
}

/// Per-operation counters, exposed through STATS. Read-path counters bump
/// through shared references, so the fields are atomics.
#[derive(Debug, Default)]
pub struct CollectionStats {
    set: AtomicU64,
    delete: AtomicU64,
    scan: AtomicU64,
    search_values: AtomicU64,
    within: AtomicU64,
    intersects: AtomicU64,
    nearby: AtomicU64,
}

/// Plain-value view of [`CollectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStatsSnapshot {
    pub set: u64,
    pub delete: u64,
    pub scan: u64,
    pub search_values: u64,
    pub within: u64,
    pub intersects: u64,
    pub nearby: u64,
}

impl CollectionStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> CollectionStatsSnapshot {
        CollectionStatsSnapshot {
            set: self.set.load(AtomicOrdering::Relaxed),
            delete: self.delete.load(AtomicOrdering::Relaxed),
            scan: self.scan.load(AtomicOrdering::Relaxed),
            search_values: self.search_values.load(AtomicOrdering::Relaxed),
            within: self.within.load(AtomicOrdering::Relaxed),
            intersects: self.intersects.load(AtomicOrdering::Relaxed),
            nearby: self.nearby.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Item {
    pub(crate) obj: Arc<Object>,
    pub(crate) slot: FieldSlot,
}

/// A collection of geospatial items addressed by id.
#[derive(Default, Debug)]
pub struct Collection {
    pub(crate) items: BTreeMap<Arc<str>, Item>,
    /// (value, id) pairs for non-spatial string objects only.
    pub(crate) values: BTreeSet<(Arc<str>, Arc<str>)>,
    pub(crate) index: RTree<Arc<str>>,
    pub(crate) field_map: HashMap<String, usize>,
    /// Field names in sorted order.
    pub(crate) field_arr: Vec<String>,
    pub(crate) field_values: FieldValues,
    pub(crate) weight: usize,
    pub(crate) points: usize,
    /// Spatial object count.
    pub(crate) objects: usize,
    /// Non-spatial (string) object count.
    pub(crate) nobjects: usize,
    stats: CollectionStats,
}

impl Collection {
    pub fn new() -> Self {
        Collection::default()
    }

    /// Number of objects in the collection.
    pub fn count(&self) -> usize {
        self.objects + self.nobjects
    }

    /// Number of string values.
    pub fn string_count(&self) -> usize {
        self.nobjects
    }

    /// Number of positions across all objects.
    pub fn point_count(&self) -> usize {
        self.points
    }

    /// Estimated in-memory cost in bytes.
    pub fn total_weight(&self) -> usize {
        self.weight
    }

    pub fn stats(&self) -> CollectionStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn tree_stats(&self) -> RTreeStats {
        self.index.stats()
    }

    /// Envelope of all spatial items.
    pub fn bounds(&self) -> Option<Rect> {
        self.index.bounds()
    }

    pub fn field_map(&self) -> &HashMap<String, usize> {
        &self.field_map
    }

    pub fn field_arr(&self) -> &[String] {
        &self.field_arr
    }

    fn obj_weight(&self, id: &str, obj: &Object, slot: FieldSlot) -> usize {
        obj.weight() + self.field_values.get(slot).len() * 8 + id.len()
    }

    fn index_insert(&mut self, id: &Arc<str>, obj: &Object) {
        if !obj.is_empty() {
            self.index.insert(obj.rect(), id.clone());
        }
    }

    fn index_delete(&mut self, id: &Arc<str>, obj: &Object) {
        if !obj.is_empty() {
            self.index.delete(&obj.rect(), id);
        }
    }

    /// Add or replace an item. A replaced item's field row carries over to
    /// the new item (the slot is preserved), then `fields`/`values` are
    /// applied on top. With no field names and a non-empty `values`, the
    /// values are taken as a raw row.
    ///
    /// Returns the old object, the old field row, and the new field row.
    pub fn set(
        &mut self,
        id: &str,
        obj: Object,
        fields: &[String],
        values: &[f64],
    ) -> (Option<Arc<Object>>, Vec<f64>, Vec<f64>) {
        CollectionStats::bump(&self.stats.set);
        let (key, old) = match self.items.remove_entry(id) {
            Some((key, item)) => (key, Some(item)),
            None => (Arc::<str>::from(id), None),
        };

        let mut old_obj = None;
        let mut old_fields = Vec::new();
        let mut slot = NIL_SLOT;
        if let Some(old_item) = old {
            if old_item.obj.is_spatial() {
                self.index_delete(&key, &old_item.obj);
                self.objects -= 1;
            } else {
                self.values
                    .remove(&(Arc::from(old_item.obj.string_repr()), key.clone()));
                self.nobjects -= 1;
            }
            self.points -= old_item.obj.num_points();
            self.weight -= self.obj_weight(&key, &old_item.obj, old_item.slot);
            old_fields = self.field_values.get(old_item.slot).to_vec();
            slot = old_item.slot;
            old_obj = Some(old_item.obj);
        }

        let mut new_fields = old_fields.clone();
        if fields.is_empty() {
            if !values.is_empty() {
                new_fields = values.to_vec();
                slot = self.field_values.set(slot, new_fields.clone());
            }
        } else {
            let (row, _, _) = self.set_field_values(&mut slot, fields, values);
            new_fields = row;
        }

        let obj = Arc::new(obj);
        if obj.is_spatial() {
            self.index_insert(&key, &obj);
            self.objects += 1;
        } else {
            self.values
                .insert((Arc::from(obj.string_repr()), key.clone()));
            self.nobjects += 1;
        }
        self.points += obj.num_points();
        let item = Item {
            obj: obj.clone(),
            slot,
        };
        self.weight += self.obj_weight(&key, &obj, slot);
        self.items.insert(key, item);

        (old_obj, old_fields, new_fields)
    }

    /// Remove an item, returning its object and field row.
    pub fn delete(&mut self, id: &str) -> Option<(Arc<Object>, Vec<f64>)> {
        CollectionStats::bump(&self.stats.delete);
        let (key, item) = self.items.remove_entry(id)?;
        if item.obj.is_spatial() {
            self.index_delete(&key, &item.obj);
            self.objects -= 1;
        } else {
            self.values
                .remove(&(Arc::from(item.obj.string_repr()), key.clone()));
            self.nobjects -= 1;
        }
        self.weight -= self.obj_weight(&key, &item.obj, item.slot);
        self.points -= item.obj.num_points();
        let fields = self.field_values.get(item.slot).to_vec();
        self.field_values.remove(item.slot);
        Some((item.obj, fields))
    }

    /// Look up an item.
    pub fn get(&self, id: &str) -> Option<(Arc<Object>, &[f64])> {
        let item = self.items.get(id)?;
        Some((item.obj.clone(), self.field_values.get(item.slot)))
    }

    /// Set one field. Returns the object, the new row, and whether the value
    /// actually changed.
    pub fn set_field(
        &mut self,
        id: &str,
        field: &str,
        value: f64,
    ) -> Option<(Arc<Object>, Vec<f64>, bool)> {
        self.set_fields(id, &[field.to_string()], &[value])
            .map(|(obj, row, updated)| (obj, row, updated > 0))
    }

    /// Set multiple fields at once. Returns the count of changed values.
    pub fn set_fields(
        &mut self,
        id: &str,
        fields: &[String],
        values: &[f64],
    ) -> Option<(Arc<Object>, Vec<f64>, usize)> {
        let (obj, mut slot) = {
            let item = self.items.get(id)?;
            (item.obj.clone(), item.slot)
        };
        let (row, updated, weight_delta) = self.set_field_values(&mut slot, fields, values);
        self.items.get_mut(id).expect("item vanished").slot = slot;
        self.weight += weight_delta;
        Some((obj, row, updated))
    }

    fn set_field_values(
        &mut self,
        slot: &mut FieldSlot,
        fields: &[String],
        values: &[f64],
    ) -> (Vec<f64>, usize, usize) {
        let mut row = self.field_values.get(*slot).to_vec();
        let mut updated = 0;
        let mut weight_delta = 0;
        for (i, name) in fields.iter().enumerate() {
            let idx = match self.field_map.get(name) {
                Some(&idx) => idx,
                None => {
                    let idx = self.field_map.len();
                    self.field_map.insert(name.clone(), idx);
                    let pos = self
                        .field_arr
                        .binary_search(name)
                        .unwrap_or_else(|pos| pos);
                    self.field_arr.insert(pos, name.clone());
                    idx
                }
            };
            while idx >= row.len() {
                row.push(0.0);
                weight_delta += 8;
            }
            let new_value = values.get(i).copied().unwrap_or(0.0);
            if row[idx] != new_value {
                updated += 1;
            }
            row[idx] = new_value;
        }
        *slot = self.field_values.set(*slot, row.clone());
        (row, updated, weight_delta)
    }

    // ------------------------------------------------------------------
    // iteration
    // ------------------------------------------------------------------

    /// Iterate items in id order. Returns false when the callback stopped
    /// the iteration, and an error when the status aborted it.
    pub fn scan(
        &self,
        desc: bool,
        cursor: Option<&dyn Cursor>,
        status: &Status,
        f: &mut dyn FnMut(&str, &Arc<Object>, &[f64]) -> bool,
    ) -> Result<bool, TxnError> {
        self.scan_from(None, desc, cursor, status, f)
    }

    /// Iterate items starting at `pivot` (inclusive), ascending or
    /// descending.
    pub fn scan_greater_or_equal(
        &self,
        pivot: &str,
        desc: bool,
        cursor: Option<&dyn Cursor>,
        status: &Status,
        f: &mut dyn FnMut(&str, &Arc<Object>, &[f64]) -> bool,
    ) -> Result<bool, TxnError> {
        self.scan_from(Some(pivot), desc, cursor, status, f)
    }

    fn scan_from(
        &self,
        pivot: Option<&str>,
        desc: bool,
        cursor: Option<&dyn Cursor>,
        status: &Status,
        f: &mut dyn FnMut(&str, &Arc<Object>, &[f64]) -> bool,
    ) -> Result<bool, TxnError> {
        CollectionStats::bump(&self.stats.scan);
        let offset = start_cursor(cursor);
        let iter: Box<dyn Iterator<Item = (&Arc<str>, &Item)>> = match (pivot, desc) {
            (None, false) => Box::new(self.items.iter()),
            (None, true) => Box::new(self.items.iter().rev()),
            (Some(p), false) => Box::new(
                self.items
                    .range::<str, _>((Bound::Included(p), Bound::Unbounded)),
            ),
            (Some(p), true) => Box::new(
                self.items
                    .range::<str, _>((Bound::Unbounded, Bound::Included(p)))
                    .rev(),
            ),
        };
        let mut count = 0u64;
        for (id, item) in iter {
            count += 1;
            if count <= offset {
                continue;
            }
            next_step(count, cursor, status)?;
            if !f(id, &item.obj, self.field_values.get(item.slot)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Iterate items in id order within `[start, end)` ascending, or from
    /// `start` down to (but excluding) `end` descending.
    pub fn scan_range(
        &self,
        start: &str,
        end: &str,
        desc: bool,
        cursor: Option<&dyn Cursor>,
        status: &Status,
        f: &mut dyn FnMut(&str, &Arc<Object>, &[f64]) -> bool,
    ) -> Result<bool, TxnError> {
        CollectionStats::bump(&self.stats.scan);
        let offset = start_cursor(cursor);
        let iter: Box<dyn Iterator<Item = (&Arc<str>, &Item)>> = if desc {
            Box::new(
                self.items
                    .range::<str, _>((Bound::Unbounded, Bound::Included(start)))
                    .rev(),
            )
        } else {
            Box::new(
                self.items
                    .range::<str, _>((Bound::Included(start), Bound::Unbounded)),
            )
        };
        let mut count = 0u64;
        for (id, item) in iter {
            count += 1;
            if count <= offset {
                continue;
            }
            next_step(count, cursor, status)?;
            if desc {
                if id.as_ref() <= end {
                    return Ok(false);
                }
            } else if id.as_ref() >= end {
                return Ok(false);
            }
            if !f(id, &item.obj, self.field_values.get(item.slot)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Iterate string objects in value order.
    pub fn search_values(
        &self,
        desc: bool,
        cursor: Option<&dyn Cursor>,
        status: &Status,
        f: &mut dyn FnMut(&str, &Arc<Object>, &[f64]) -> bool,
    ) -> Result<bool, TxnError> {
        CollectionStats::bump(&self.stats.search_values);
        let offset = start_cursor(cursor);
        let iter: Box<dyn Iterator<Item = &(Arc<str>, Arc<str>)>> = if desc {
            Box::new(self.values.iter().rev())
        } else {
            Box::new(self.values.iter())
        };
        self.walk_values(iter, offset, cursor, status, f)
    }

    /// Iterate string objects with values in `[start, end)`.
    pub fn search_values_range(
        &self,
        start: &str,
        end: &str,
        desc: bool,
        cursor: Option<&dyn Cursor>,
        status: &Status,
        f: &mut dyn FnMut(&str, &Arc<Object>, &[f64]) -> bool,
    ) -> Result<bool, TxnError> {
        CollectionStats::bump(&self.stats.search_values);
        let offset = start_cursor(cursor);
        // descending callers pass their bounds high-to-low
        let (lo_key, hi_key) = if desc { (end, start) } else { (start, end) };
        let lo: (Arc<str>, Arc<str>) = (Arc::from(lo_key), Arc::from(""));
        let hi: (Arc<str>, Arc<str>) = (Arc::from(hi_key), Arc::from(""));
        if lo >= hi {
            return Ok(true);
        }
        let range = self
            .values
            .range((Bound::Included(lo), Bound::Excluded(hi)));
        let iter: Box<dyn Iterator<Item = &(Arc<str>, Arc<str>)>> = if desc {
            Box::new(range.rev())
        } else {
            Box::new(range)
        };
        self.walk_values(iter, offset, cursor, status, f)
    }

    fn walk_values<'a>(
        &self,
        iter: Box<dyn Iterator<Item = &(Arc<str>, Arc<str>)> + 'a>,
        offset: u64,
        cursor: Option<&dyn Cursor>,
        status: &Status,
        f: &mut dyn FnMut(&str, &Arc<Object>, &[f64]) -> bool,
    ) -> Result<bool, TxnError> {
        let mut count = 0u64;
        for (_, id) in iter {
            count += 1;
            if count <= offset {
                continue;
            }
            next_step(count, cursor, status)?;
            let item = self.items.get(id).expect("value index out of sync");
            if !f(id, &item.obj, self.field_values.get(item.slot)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // spatial queries
    // ------------------------------------------------------------------

    /// Items fully contained in `obj`.
    pub fn within(
        &self,
        obj: &Object,
        sparse: u8,
        cursor: Option<&dyn Cursor>,
        status: &Status,
        f: &mut dyn FnMut(&str, &Arc<Object>, &[f64]) -> bool,
    ) -> Result<bool, TxnError> {
        CollectionStats::bump(&self.stats.within);
        self.geo_query(obj.rect(), &|o| o.within(obj), sparse, cursor, status, f)
    }

    /// Items fully contained in the area expression.
    pub fn within_expr(
        &self,
        expr: &AreaExpression,
        sparse: u8,
        cursor: Option<&dyn Cursor>,
        status: &Status,
        f: &mut dyn FnMut(&str, &Arc<Object>, &[f64]) -> bool,
    ) -> Result<bool, TxnError> {
        CollectionStats::bump(&self.stats.within);
        let rect = expr.rect(Rect::world());
        self.geo_query(rect, &|o| expr.contains(o), sparse, cursor, status, f)
    }

    /// Items intersecting `obj`.
    pub fn intersects(
        &self,
        obj: &Object,
        sparse: u8,
        cursor: Option<&dyn Cursor>,
        status: &Status,
        f: &mut dyn FnMut(&str, &Arc<Object>, &[f64]) -> bool,
    ) -> Result<bool, TxnError> {
        CollectionStats::bump(&self.stats.intersects);
        self.geo_query(obj.rect(), &|o| o.intersects(obj), sparse, cursor, status, f)
    }

    /// Items intersecting the area expression.
    pub fn intersects_expr(
        &self,
        expr: &AreaExpression,
        sparse: u8,
        cursor: Option<&dyn Cursor>,
        status: &Status,
        f: &mut dyn FnMut(&str, &Arc<Object>, &[f64]) -> bool,
    ) -> Result<bool, TxnError> {
        CollectionStats::bump(&self.stats.intersects);
        let rect = expr.rect(Rect::world());
        self.geo_query(rect, &|o| expr.intersects(o), sparse, cursor, status, f)
    }

    fn geo_query(
        &self,
        query_rect: Rect,
        test: &dyn Fn(&Object) -> bool,
        sparse: u8,
        cursor: Option<&dyn Cursor>,
        status: &Status,
        f: &mut dyn FnMut(&str, &Arc<Object>, &[f64]) -> bool,
    ) -> Result<bool, TxnError> {
        let offset = start_cursor(cursor);
        let mut count = 0u64;
        let mut abort: Option<TxnError> = None;

        let alive = if sparse > 0 {
            // recursively quarter the rect and round-robin the quadrants to
            // approximate an even sample
            let mut matched: HashSet<Arc<str>> = HashSet::new();
            self.geo_sparse_inner(query_rect, sparse, &mut |id, obj, fields| {
                if matched.contains(id.as_ref()) {
                    return (false, true);
                }
                count += 1;
                if count <= offset {
                    return (false, true);
                }
                if let Err(err) = next_step(count, cursor, status) {
                    abort = Some(err);
                    return (false, false);
                }
                if test(obj) {
                    matched.insert(id.clone());
                    (true, f(id, obj, fields))
                } else {
                    (false, true)
                }
            })
        } else {
            self.geo_search(&query_rect, &mut |id, obj, fields| {
                count += 1;
                if count <= offset {
                    return true;
                }
                if let Err(err) = next_step(count, cursor, status) {
                    abort = Some(err);
                    return false;
                }
                if test(obj) {
                    f(id, obj, fields)
                } else {
                    true
                }
            })
        };
        match abort {
            Some(err) => Err(err),
            None => Ok(alive),
        }
    }

    fn geo_search(
        &self,
        rect: &Rect,
        iter: &mut dyn FnMut(&Arc<str>, &Arc<Object>, &[f64]) -> bool,
    ) -> bool {
        let mut alive = true;
        self.index.search(rect, &mut |_, id| {
            let item = self.items.get(id.as_ref()).expect("index out of sync");
            alive = iter(id, &item.obj, self.field_values.get(item.slot));
            alive
        });
        alive
    }

    fn geo_sparse_inner(
        &self,
        rect: Rect,
        sparse: u8,
        iter: &mut dyn FnMut(&Arc<str>, &Arc<Object>, &[f64]) -> (bool, bool),
    ) -> bool {
        if sparse > 0 {
            let w = rect.width();
            let h = rect.height();
            let quads = [
                Rect::new(rect.min.x, rect.min.y + h / 2.0, rect.min.x + w / 2.0, rect.max.y),
                Rect::new(rect.min.x + w / 2.0, rect.min.y + h / 2.0, rect.max.x, rect.max.y),
                Rect::new(rect.min.x, rect.min.y, rect.min.x + w / 2.0, rect.min.y + h / 2.0),
                Rect::new(rect.min.x + w / 2.0, rect.min.y, rect.max.x, rect.min.y + h / 2.0),
            ];
            for quad in quads {
                if !self.geo_sparse_inner(quad, sparse - 1, iter) {
                    return false;
                }
            }
            return true;
        }
        let mut alive = true;
        self.geo_search(&rect, &mut |id, obj, fields| {
            let (matched, ok) = iter(id, obj, fields);
            if !ok {
                alive = false;
                return false;
            }
            // stop this quadrant after its first match
            !matched
        });
        alive
    }

    /// Nearest neighbors by geodetic distance, nearest first. The callback
    /// receives the lower-bound distance (meters) that ordered the item.
    pub fn nearby(
        &self,
        target: &Object,
        cursor: Option<&dyn Cursor>,
        status: &Status,
        f: &mut dyn FnMut(&str, &Arc<Object>, &[f64], f64) -> bool,
    ) -> Result<bool, TxnError> {
        CollectionStats::bump(&self.stats.nearby);
        // fast-fail a circle target with an empty enclosing rectangle
        if let Object::Circle(circle) = target {
            if circle.meters() > 0.0 {
                let mut exists = false;
                self.index.search(&circle.rect(), &mut |_, _| {
                    exists = true;
                    false
                });
                if !exists {
                    return Ok(true);
                }
            }
        }

        let center = target.center();
        let offset = start_cursor(cursor);
        let mut count = 0u64;
        let mut abort: Option<TxnError> = None;
        let box_dist = geodetic_dist_algo(center);

        let alive = self.index.nearby(&box_dist, &mut |_, id, d| {
            count += 1;
            if count <= offset {
                return true;
            }
            if let Err(err) = next_step(count, cursor, status) {
                abort = Some(err);
                return false;
            }
            let item = self.items.get(id.as_ref()).expect("index out of sync");
            f(id, &item.obj, self.field_values.get(item.slot), d)
        });
        match abort {
            Some(err) => Err(err),
            None => Ok(alive),
        }
    }

}

fn start_cursor(cursor: Option<&dyn Cursor>) -> u64 {
    match cursor {
        Some(c) => {
            let offset = c.offset();
            c.step(offset);
            offset
        }
        None => 0,
    }
}

fn next_step(step: u64, cursor: Option<&dyn Cursor>, status: &Status) -> Result<(), TxnError> {
    if step & YIELD_STEP == YIELD_STEP {
        std::thread::yield_now();
        if let Some(err) = status.error() {
            return Err(err);
        }
    }
    if let Some(c) = cursor {
        c.step(1);
    }
    Ok(())
}

/// Box-distance function for the kNN traversal: geodetic point-to-rect
/// distance on the unit sphere, scaled to meters.
fn geodetic_dist_algo(center: Point) -> impl Fn(&Rect) -> f64 {
    move |rect: &Rect| {
        dist::EARTH_RADIUS_M
            * dist::point_rect_dist_geodetic_deg(
                center.y, center.x, rect.min.y, rect.min.x, rect.max.y, rect.max.x,
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::geometry::Poly;

    fn bg() -> Status<'static> {
        Status::background()
    }

    struct TestCursor {
        offset: u64,
        iters: std::cell::Cell<u64>,
    }

    impl Cursor for TestCursor {
        fn offset(&self) -> u64 {
            self.offset
        }
        fn step(&self, count: u64) {
            self.iters.set(self.iters.get() + count);
        }
    }

    fn point(x: f64, y: f64) -> Object {
        Object::point(x, y)
    }

    fn naive_weight(c: &Collection) -> usize {
        let mut total = 0;
        for (id, item) in &c.items {
            total += item.obj.weight() + id.len() + c.field_values.get(item.slot).len() * 8;
        }
        total
    }

    #[test]
    fn test_set_get_delete_round_trip() {
        let mut c = Collection::new();
        c.set("truck1", point(-115.0, 33.0), &[], &[]);
        assert_eq!(c.count(), 1);

        let (obj, fields) = c.get("truck1").unwrap();
        assert_eq!(*obj, point(-115.0, 33.0));
        assert!(fields.is_empty());

        let (obj, fields) = c.delete("truck1").unwrap();
        assert_eq!(*obj, point(-115.0, 33.0));
        assert!(fields.is_empty());
        assert_eq!(c.count(), 0);
        assert!(c.get("truck1").is_none());
        assert!(c.delete("truck1").is_none());
    }

    #[test]
    fn test_replace_preserves_field_slot() {
        let mut c = Collection::new();
        c.set(
            "truck1",
            point(0.0, 0.0),
            &["speed".to_string()],
            &[55.0],
        );
        // replace the object without naming fields: the row carries over
        let (old, old_fields, new_fields) = c.set("truck1", point(1.0, 1.0), &[], &[]);
        assert_eq!(*old.unwrap(), point(0.0, 0.0));
        assert_eq!(old_fields, vec![55.0]);
        assert_eq!(new_fields, vec![55.0]);
        let (_, fields) = c.get("truck1").unwrap();
        assert_eq!(fields, &[55.0]);
        assert_eq!(c.count(), 1);
        assert_eq!(c.field_values.live_rows(), 1);
    }

    #[test]
    fn test_counts_split_spatial_and_strings() {
        let mut c = Collection::new();
        c.set("a", point(1.0, 1.0), &[], &[]);
        c.set("b", Object::String("hello".into()), &[], &[]);
        c.set("c", Object::String("world".into()), &[], &[]);
        assert_eq!(c.count(), 3);
        assert_eq!(c.string_count(), 2);
        assert_eq!(c.point_count(), 1);

        // replacing a string with a point moves it between indexes
        c.set("b", point(2.0, 2.0), &[], &[]);
        assert_eq!(c.string_count(), 1);
        assert_eq!(c.point_count(), 2);
        assert_eq!(c.count(), 3);
    }

    #[test]
    fn test_weight_matches_naive_recomputation() {
        let mut c = Collection::new();
        c.set("a", point(1.0, 1.0), &["speed".into(), "fuel".into()], &[9.0, 1.5]);
        c.set("b", Object::String("some value".into()), &[], &[]);
        c.set(
            "poly",
            Object::Polygon(Poly::from_rect(&Rect::new(0.0, 0.0, 10.0, 10.0))),
            &[],
            &[],
        );
        assert_eq!(c.total_weight(), naive_weight(&c));

        c.set_field("b", "speed", 3.0);
        assert_eq!(c.total_weight(), naive_weight(&c));

        c.set("a", point(2.0, 2.0), &[], &[]);
        assert_eq!(c.total_weight(), naive_weight(&c));

        c.delete("poly");
        c.delete("a");
        assert_eq!(c.total_weight(), naive_weight(&c));

        c.delete("b");
        assert_eq!(c.total_weight(), 0);
    }

    #[test]
    fn test_set_fields_updated_flags() {
        let mut c = Collection::new();
        c.set("t", point(0.0, 0.0), &[], &[]);
        let (_, row, updated) = c
            .set_fields("t", &["a".into(), "b".into()], &[1.0, 2.0])
            .unwrap();
        assert_eq!(updated, 2);
        assert_eq!(row, vec![1.0, 2.0]);
        // same values again: nothing changed
        let (_, _, updated) = c
            .set_fields("t", &["a".into(), "b".into()], &[1.0, 2.0])
            .unwrap();
        assert_eq!(updated, 0);
        // unknown field allocates the next column
        let (_, row, _) = c.set_fields("t", &["z".into()], &[9.0]).unwrap();
        assert_eq!(row, vec![1.0, 2.0, 9.0]);
        assert_eq!(c.field_map()["z"], 2);
        assert!(c.set_fields("missing", &["a".into()], &[1.0]).is_none());
    }

    #[test]
    fn test_scan_order_and_cursor() {
        let mut c = Collection::new();
        for i in 0..10 {
            c.set(&format!("id{:02}", i), point(i as f64, 0.0), &[], &[]);
        }
        let mut seen = Vec::new();
        c.scan(false, None, &bg(), &mut |id, _, _| {
            seen.push(id.to_string());
            true
        })
        .unwrap();
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));

        // cursor skips items already visited
        let cur = TestCursor { offset: 4, iters: std::cell::Cell::new(0) };
        let mut rest = Vec::new();
        c.scan(false, Some(&cur), &bg(), &mut |id, _, _| {
            rest.push(id.to_string());
            true
        })
        .unwrap();
        assert_eq!(rest, seen[4..].to_vec());
        assert_eq!(cur.iters.get(), 10);

        // descending
        let mut desc = Vec::new();
        c.scan(true, None, &bg(), &mut |id, _, _| {
            desc.push(id.to_string());
            true
        })
        .unwrap();
        let mut rev = seen.clone();
        rev.reverse();
        assert_eq!(desc, rev);
    }

    #[test]
    fn test_scan_range_half_open() {
        let mut c = Collection::new();
        for id in ["a", "b", "c", "d", "e"] {
            c.set(id, point(0.0, 0.0), &[], &[]);
        }
        let mut seen = Vec::new();
        c.scan_range("b", "d", false, None, &bg(), &mut |id, _, _| {
            seen.push(id.to_string());
            true
        })
        .unwrap();
        assert_eq!(seen, vec!["b", "c"]);

        let mut seen = Vec::new();
        c.scan_range("d", "b", true, None, &bg(), &mut |id, _, _| {
            seen.push(id.to_string());
            true
        })
        .unwrap();
        assert_eq!(seen, vec!["d", "c"]);
    }

    #[test]
    fn test_search_values_sorted_by_value() {
        let mut c = Collection::new();
        c.set("1", Object::String("banana".into()), &[], &[]);
        c.set("2", Object::String("apple".into()), &[], &[]);
        c.set("3", Object::String("cherry".into()), &[], &[]);
        c.set("x", point(0.0, 0.0), &[], &[]); // not a value
        let mut seen = Vec::new();
        c.search_values(false, None, &bg(), &mut |id, obj, _| {
            seen.push((id.to_string(), obj.string_repr()));
            true
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![
                ("2".to_string(), "apple".to_string()),
                ("1".to_string(), "banana".to_string()),
                ("3".to_string(), "cherry".to_string()),
            ]
        );

        let mut ranged = Vec::new();
        c.search_values_range("apple", "cherry", false, None, &bg(), &mut |id, _, _| {
            ranged.push(id.to_string());
            true
        })
        .unwrap();
        assert_eq!(ranged, vec!["2", "1"]);
    }

    #[test]
    fn test_within_and_intersects() {
        let mut c = Collection::new();
        c.set("in1", point(3.0, 3.0), &[], &[]);
        c.set("in2", point(7.0, 7.0), &[], &[]);
        c.set("out", point(20.0, 20.0), &[], &[]);
        c.set(
            "edge",
            Object::LineString(vec![Point::new(-5.0, 5.0), Point::new(5.0, 5.0)]),
            &[],
            &[],
        );
        let query = Object::Rect(Rect::new(0.0, 0.0, 10.0, 10.0));

        let mut within = Vec::new();
        c.within(&query, 0, None, &bg(), &mut |id, _, _| {
            within.push(id.to_string());
            true
        })
        .unwrap();
        within.sort();
        assert_eq!(within, vec!["in1", "in2"]);

        let mut isect = Vec::new();
        c.intersects(&query, 0, None, &bg(), &mut |id, _, _| {
            isect.push(id.to_string());
            true
        })
        .unwrap();
        isect.sort();
        assert_eq!(isect, vec!["edge", "in1", "in2"]);
    }

    #[test]
    fn test_within_sparse_samples_are_unique_matches() {
        let mut c = Collection::new();
        for i in 0..100 {
            let x = (i % 10) as f64;
            let y = (i / 10) as f64;
            c.set(&format!("p{}", i), point(x, y), &[], &[]);
        }
        let query = Object::Rect(Rect::new(-0.5, -0.5, 9.5, 9.5));
        let mut seen = Vec::new();
        c.within(&query, 2, None, &bg(), &mut |id, _, _| {
            seen.push(id.to_string());
            true
        })
        .unwrap();
        let unique: HashSet<_> = seen.iter().cloned().collect();
        assert_eq!(unique.len(), seen.len(), "sparse results must be unique");
        assert!(!seen.is_empty());
        // quartering two levels yields at most one match per final quadrant
        assert!(seen.len() <= 16, "got {} samples", seen.len());
    }

    #[test]
    fn test_nearby_yields_nondecreasing_distance() {
        let mut c = Collection::new();
        for i in 0..50 {
            let x = -115.0 + (i % 7) as f64 * 0.01;
            let y = 33.0 + (i / 7) as f64 * 0.01;
            c.set(&format!("t{}", i), point(x, y), &[], &[]);
        }
        let target = Object::point(-115.0, 33.0);
        let mut last = 0.0;
        let mut n = 0;
        c.nearby(&target, None, &bg(), &mut |_, _, _, d| {
            assert!(d >= last);
            last = d;
            n += 1;
            true
        })
        .unwrap();
        assert_eq!(n, 50);
    }

    #[test]
    fn test_nearby_circle_fast_fail() {
        let mut c = Collection::new();
        c.set("far", point(50.0, 50.0), &[], &[]);
        let circle = Object::Circle(meridian_core::object::Circle::new(
            Point::new(-115.0, 33.0),
            1000.0,
            64,
        ));
        let mut called = false;
        c.nearby(&circle, None, &bg(), &mut |_, _, _, _| {
            called = true;
            true
        })
        .unwrap();
        assert!(!called, "no candidates inside the circle's rect");
    }

    #[test]
    fn test_empty_object_not_indexed() {
        let mut c = Collection::new();
        c.set("empty", Object::LineString(Vec::new()), &[], &[]);
        assert_eq!(c.count(), 1);
        assert_eq!(c.index.len(), 0);
        let mut seen = 0;
        c.intersects(
            &Object::Rect(Rect::world()),
            0,
            None,
            &bg(),
            &mut |_, _, _| {
                seen += 1;
                true
            },
        )
        .unwrap();
        assert_eq!(seen, 0);
        c.delete("empty").unwrap();
        assert_eq!(c.count(), 0);
    }
}

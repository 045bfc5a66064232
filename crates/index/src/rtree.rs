//! The R-tree.
//!
//! Insertion descends along minimal enlargement (ties broken by smaller
//! area) and splits overflowing nodes with the quadratic seed-pair
//! heuristic. Deletion locates the leaf by rectangle containment plus item
//! equality, then condenses the tree, reinserting entries orphaned by
//! underflowed nodes. Search is the classic overlap recursion; `nearby` runs
//! a best-first traversal ordered by a caller-supplied box distance.

use meridian_core::geometry::Rect;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::{self, Read, Write};

const MAX_ENTRIES: usize = 16;
const MIN_ENTRIES: usize = MAX_ENTRIES * 40 / 100;

/// Operation counters exposed for observability.
#[derive(Debug, Clone, Copy, Default)]
pub struct RTreeStats {
    /// Node splits performed by inserts.
    pub splits: u64,
    /// Node merges performed by delete condensing.
    pub joins: u64,
}

#[derive(Debug)]
enum Entry<T> {
    Child(Box<Node<T>>),
    Item(Rect, T),
}

impl<T> Entry<T> {
    fn rect(&self) -> Rect {
        match self {
            Entry::Child(node) => node.rect,
            Entry::Item(rect, _) => *rect,
        }
    }
}

#[derive(Debug)]
struct Node<T> {
    rect: Rect,
    entries: Vec<Entry<T>>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Node {
            rect: Rect::default(),
            entries: Vec::with_capacity(MAX_ENTRIES + 1),
        }
    }

    fn recalc_rect(&mut self) {
        let mut it = self.entries.iter();
        self.rect = match it.next() {
            Some(e) => {
                let mut rect = e.rect();
                for e in it {
                    rect = rect.union(&e.rect());
                }
                rect
            }
            None => Rect::default(),
        };
    }
}

/// A 2-D R-tree mapping bounding rectangles to items.
#[derive(Debug)]
pub struct RTree<T> {
    root: Option<Box<Node<T>>>,
    /// Levels below the root; zero means the root is a leaf.
    height: usize,
    count: usize,
    stats: RTreeStats,
}

impl<T> Default for RTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RTree<T> {
    pub fn new() -> Self {
        RTree {
            root: None,
            height: 0,
            count: 0,
            stats: RTreeStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Tree height: levels below the root.
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stats(&self) -> RTreeStats {
        self.stats
    }

    /// Envelope of all indexed rectangles.
    pub fn bounds(&self) -> Option<Rect> {
        self.root.as_ref().map(|n| n.rect)
    }

    /// Mean entries per node, for observability.
    pub fn mean_fanout(&self) -> f64 {
        let (mut nodes, mut entries) = (0usize, 0usize);
        if let Some(root) = &self.root {
            count_fanout(root, &mut nodes, &mut entries);
        }
        if nodes == 0 {
            0.0
        } else {
            entries as f64 / nodes as f64
        }
    }

    pub fn insert(&mut self, rect: Rect, item: T) {
        self.count += 1;
        let height = self.height;
        match self.root.as_mut() {
            None => {
                let mut node = Box::new(Node::new());
                node.entries.push(Entry::Item(rect, item));
                node.recalc_rect();
                self.root = Some(node);
            }
            Some(root) => {
                if let Some(sibling) = insert_entry(root, height, rect, item, &mut self.stats) {
                    // root split: grow the tree by one level
                    let old_root = self.root.take().unwrap();
                    let mut new_root = Box::new(Node::new());
                    new_root.entries.push(Entry::Child(old_root));
                    new_root.entries.push(Entry::Child(sibling));
                    new_root.recalc_rect();
                    self.root = Some(new_root);
                    self.height += 1;
                }
            }
        }
    }

    /// Iterate every item whose rectangle intersects `rect`. The callback
    /// returns false to stop; the overall return is false when stopped early.
    pub fn search(&self, rect: &Rect, f: &mut dyn FnMut(&Rect, &T) -> bool) -> bool {
        match &self.root {
            Some(root) => search_node(root, rect, f),
            None => true,
        }
    }

    /// Best-first traversal ordered by `box_dist` over entry rectangles. The
    /// same function scores internal nodes and leaf items, so any metric that
    /// lower-bounds item distance by node distance yields items in
    /// non-decreasing order.
    pub fn nearby(
        &self,
        box_dist: &dyn Fn(&Rect) -> f64,
        f: &mut dyn FnMut(&Rect, &T, f64) -> bool,
    ) -> bool {
        let Some(root) = &self.root else {
            return true;
        };
        let mut heap: BinaryHeap<HeapEntry<'_, T>> = BinaryHeap::new();
        heap.push(HeapEntry {
            dist: box_dist(&root.rect),
            kind: HeapKind::Node(root),
        });
        while let Some(entry) = heap.pop() {
            match entry.kind {
                HeapKind::Node(node) => {
                    for e in &node.entries {
                        match e {
                            Entry::Child(child) => heap.push(HeapEntry {
                                dist: box_dist(&child.rect),
                                kind: HeapKind::Node(child),
                            }),
                            Entry::Item(rect, item) => heap.push(HeapEntry {
                                dist: box_dist(rect),
                                kind: HeapKind::Item(rect, item),
                            }),
                        }
                    }
                }
                HeapKind::Item(rect, item) => {
                    if !f(rect, item, entry.dist) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

impl<T: PartialEq> RTree<T> {
    /// Remove the entry matching `rect` and `item`. Returns whether an entry
    /// was removed.
    pub fn delete(&mut self, rect: &Rect, item: &T) -> bool {
        let height = self.height;
        let Some(root) = self.root.as_mut() else {
            return false;
        };
        let mut orphans: Vec<(Rect, T)> = Vec::new();
        let removed = delete_entry(root, height, rect, item, &mut orphans, &mut self.stats);
        if !removed {
            return false;
        }
        self.count -= 1;

        // shrink the root while it holds a single child
        loop {
            let root = self.root.as_mut().unwrap();
            if self.height > 0 && root.entries.len() == 1 {
                let entry = root.entries.pop().unwrap();
                match entry {
                    Entry::Child(child) => {
                        *root = child;
                        self.height -= 1;
                    }
                    item_entry @ Entry::Item(..) => {
                        root.entries.push(item_entry);
                        break;
                    }
                }
            } else {
                break;
            }
        }
        if self.root.as_ref().map_or(false, |r| r.entries.is_empty()) {
            self.root = None;
            self.height = 0;
        }

        self.count -= orphans.len();
        for (rect, item) in orphans {
            self.insert(rect, item);
        }
        true
    }
}

// ---------------------------------------------------------------------------
// insert
// ---------------------------------------------------------------------------

fn enlargement(rect: &Rect, add: &Rect) -> f64 {
    rect.union(add).area() - rect.area()
}

fn choose_subtree<T>(node: &Node<T>, rect: &Rect) -> usize {
    let mut best = 0;
    let mut best_enlargement = f64::INFINITY;
    let mut best_area = f64::INFINITY;
    for (i, e) in node.entries.iter().enumerate() {
        let r = e.rect();
        let grow = enlargement(&r, rect);
        let area = r.area();
        if grow < best_enlargement || (grow == best_enlargement && area < best_area) {
            best = i;
            best_enlargement = grow;
            best_area = area;
        }
    }
    best
}

fn insert_entry<T>(
    node: &mut Node<T>,
    level: usize,
    rect: Rect,
    item: T,
    stats: &mut RTreeStats,
) -> Option<Box<Node<T>>> {
    if level == 0 {
        node.entries.push(Entry::Item(rect, item));
    } else {
        let idx = choose_subtree(node, &rect);
        let split = match &mut node.entries[idx] {
            Entry::Child(child) => insert_entry(child, level - 1, rect, item, stats),
            Entry::Item(..) => unreachable!("item entry above leaf level"),
        };
        if let Some(sibling) = split {
            node.entries.push(Entry::Child(sibling));
        }
    }

    if node.entries.len() > MAX_ENTRIES {
        let sibling = split_node(node, stats);
        node.recalc_rect();
        return Some(sibling);
    }
    node.recalc_rect();
    None
}

/// Quadratic split: seed with the pair wasting the most area together, then
/// distribute remaining entries by least enlargement.
fn split_node<T>(node: &mut Node<T>, stats: &mut RTreeStats) -> Box<Node<T>> {
    stats.splits += 1;
    let entries = std::mem::take(&mut node.entries);

    // seed pair maximizing dead area
    let (mut seed_a, mut seed_b) = (0usize, 1usize);
    let mut worst = f64::NEG_INFINITY;
    for i in 0..entries.len() {
        for j in i + 1..entries.len() {
            let (ra, rb) = (entries[i].rect(), entries[j].rect());
            let dead = ra.union(&rb).area() - ra.area() - rb.area();
            if dead > worst {
                worst = dead;
                seed_a = i;
                seed_b = j;
            }
        }
    }

    let mut group_a: Vec<Entry<T>> = Vec::with_capacity(MAX_ENTRIES);
    let mut group_b: Vec<Entry<T>> = Vec::with_capacity(MAX_ENTRIES);
    let mut rect_a = entries[seed_a].rect();
    let mut rect_b = entries[seed_b].rect();

    for (i, entry) in entries.into_iter().enumerate() {
        if i == seed_a {
            group_a.push(entry);
            continue;
        }
        if i == seed_b {
            group_b.push(entry);
            continue;
        }
        let r = entry.rect();
        let remaining_capacity_matters =
            group_a.len() + 1 >= MAX_ENTRIES || group_b.len() + 1 >= MAX_ENTRIES;
        let pick_a = if remaining_capacity_matters {
            group_a.len() < group_b.len()
        } else {
            let grow_a = enlargement(&rect_a, &r);
            let grow_b = enlargement(&rect_b, &r);
            grow_a < grow_b || (grow_a == grow_b && rect_a.area() <= rect_b.area())
        };
        if pick_a {
            rect_a = rect_a.union(&r);
            group_a.push(entry);
        } else {
            rect_b = rect_b.union(&r);
            group_b.push(entry);
        }
    }

    node.entries = group_a;
    let mut sibling = Box::new(Node::new());
    sibling.entries = group_b;
    sibling.recalc_rect();
    sibling
}

// ---------------------------------------------------------------------------
// delete
// ---------------------------------------------------------------------------

fn delete_entry<T: PartialEq>(
    node: &mut Node<T>,
    level: usize,
    rect: &Rect,
    item: &T,
    orphans: &mut Vec<(Rect, T)>,
    stats: &mut RTreeStats,
) -> bool {
    if level == 0 {
        let pos = node.entries.iter().position(|e| match e {
            Entry::Item(r, it) => r == rect && it == item,
            Entry::Child(_) => false,
        });
        match pos {
            Some(i) => {
                node.entries.remove(i);
                node.recalc_rect();
                return true;
            }
            None => return false,
        }
    }

    for i in 0..node.entries.len() {
        let covers = node.entries[i].rect().contains_rect(rect);
        if !covers {
            continue;
        }
        let removed = match &mut node.entries[i] {
            Entry::Child(child) => delete_entry(child, level - 1, rect, item, orphans, stats),
            Entry::Item(..) => false,
        };
        if removed {
            let underflow = match &node.entries[i] {
                Entry::Child(child) => child.entries.len() < MIN_ENTRIES,
                Entry::Item(..) => false,
            };
            if underflow {
                stats.joins += 1;
                if let Entry::Child(child) = node.entries.remove(i) {
                    collect_items(*child, orphans);
                }
            }
            node.recalc_rect();
            return true;
        }
    }
    false
}

fn collect_items<T>(node: Node<T>, out: &mut Vec<(Rect, T)>) {
    for entry in node.entries {
        match entry {
            Entry::Child(child) => collect_items(*child, out),
            Entry::Item(rect, item) => out.push((rect, item)),
        }
    }
}

// ---------------------------------------------------------------------------
// search / nearby
// ---------------------------------------------------------------------------

fn search_node<T>(node: &Node<T>, rect: &Rect, f: &mut dyn FnMut(&Rect, &T) -> bool) -> bool {
    for entry in &node.entries {
        if !entry.rect().intersects_rect(rect) {
            continue;
        }
        match entry {
            Entry::Child(child) => {
                if !search_node(child, rect, f) {
                    return false;
                }
            }
            Entry::Item(r, item) => {
                if !f(r, item) {
                    return false;
                }
            }
        }
    }
    true
}

fn count_fanout<T>(node: &Node<T>, nodes: &mut usize, entries: &mut usize) {
    *nodes += 1;
    *entries += node.entries.len();
    for e in &node.entries {
        if let Entry::Child(child) = e {
            count_fanout(child, nodes, entries);
        }
    }
}

enum HeapKind<'a, T> {
    Node(&'a Node<T>),
    Item(&'a Rect, &'a T),
}

struct HeapEntry<'a, T> {
    dist: f64,
    kind: HeapKind<'a, T>,
}

impl<T> PartialEq for HeapEntry<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist
    }
}
impl<T> Eq for HeapEntry<'_, T> {}
impl<T> PartialOrd for HeapEntry<'_, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for HeapEntry<'_, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we want the nearest first
        other.dist.total_cmp(&self.dist)
    }
}

// ---------------------------------------------------------------------------
// save / load
// ---------------------------------------------------------------------------

impl<T> RTree<T> {
    /// Deterministic pre-order dump. Leaf payloads are written by
    /// `save_item`; rectangles are little-endian `f64`, counters big-endian.
    pub fn save(
        &self,
        w: &mut dyn Write,
        save_item: &mut dyn FnMut(&mut dyn Write, &T) -> io::Result<()>,
    ) -> io::Result<()> {
        w.write_all(&(self.height as u64).to_be_bytes())?;
        w.write_all(&(self.count as u64).to_be_bytes())?;
        w.write_all(&[self.root.is_some() as u8])?;
        if let Some(root) = &self.root {
            save_node(root, self.height, w, save_item)?;
        }
        Ok(())
    }

    /// Rebuild a tree written by [`RTree::save`].
    pub fn load(
        r: &mut dyn Read,
        load_item: &mut dyn FnMut(&mut dyn Read) -> io::Result<T>,
    ) -> io::Result<Self> {
        let height = read_u64_be(r)? as usize;
        let count = read_u64_be(r)? as usize;
        let mut got = [0u8; 1];
        r.read_exact(&mut got)?;
        let root = if got[0] != 0 {
            Some(load_node(r, load_item)?)
        } else {
            None
        };
        Ok(RTree {
            root,
            height,
            count,
            stats: RTreeStats::default(),
        })
    }
}

fn write_rect(w: &mut dyn Write, rect: &Rect) -> io::Result<()> {
    for v in [rect.min.x, rect.min.y, rect.max.x, rect.max.y] {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_rect(r: &mut dyn Read) -> io::Result<Rect> {
    let mut vals = [0f64; 4];
    for v in vals.iter_mut() {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf)?;
        *v = f64::from_le_bytes(buf);
    }
    Ok(Rect::new(vals[0], vals[1], vals[2], vals[3]))
}

fn read_u64_be(r: &mut dyn Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

fn save_node<T>(
    node: &Node<T>,
    level: usize,
    w: &mut dyn Write,
    save_item: &mut dyn FnMut(&mut dyn Write, &T) -> io::Result<()>,
) -> io::Result<()> {
    write_rect(w, &node.rect)?;
    w.write_all(&[node.entries.len() as u8])?;
    w.write_all(&[(level > 0) as u8])?;
    for entry in &node.entries {
        match entry {
            Entry::Child(child) => save_node(child, level - 1, w, save_item)?,
            Entry::Item(rect, item) => {
                write_rect(w, rect)?;
                save_item(w, item)?;
            }
        }
    }
    Ok(())
}

fn load_node<T>(
    r: &mut dyn Read,
    load_item: &mut dyn FnMut(&mut dyn Read) -> io::Result<T>,
) -> io::Result<Box<Node<T>>> {
    let rect = read_rect(r)?;
    let mut counts = [0u8; 2];
    r.read_exact(&mut counts)?;
    let n = counts[0] as usize;
    let has_children = counts[1] != 0;
    let mut node = Box::new(Node::new());
    node.rect = rect;
    for _ in 0..n {
        if has_children {
            node.entries.push(Entry::Child(load_node(r, load_item)?));
        } else {
            let rect = read_rect(r)?;
            let item = load_item(r)?;
            node.entries.push(Entry::Item(rect, item));
        }
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn pt_rect(x: f64, y: f64) -> Rect {
        Rect::new(x, y, x, y)
    }

    fn collect_all(tree: &RTree<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        tree.search(&Rect::world(), &mut |_, item| {
            out.push(*item);
            true
        });
        out.sort_unstable();
        out
    }

    #[test]
    fn test_insert_search() {
        let mut tree = RTree::new();
        for i in 0..100u32 {
            tree.insert(pt_rect(i as f64, i as f64), i);
        }
        assert_eq!(tree.len(), 100);
        let mut found = Vec::new();
        tree.search(&Rect::new(10.0, 10.0, 20.0, 20.0), &mut |_, item| {
            found.push(*item);
            true
        });
        found.sort_unstable();
        assert_eq!(found, (10..=20).collect::<Vec<u32>>());
        assert!(tree.stats().splits > 0);
    }

    #[test]
    fn test_search_early_stop() {
        let mut tree = RTree::new();
        for i in 0..50u32 {
            tree.insert(pt_rect(i as f64, 0.0), i);
        }
        let mut seen = 0;
        let alive = tree.search(&Rect::world(), &mut |_, _| {
            seen += 1;
            seen < 5
        });
        assert!(!alive);
        assert_eq!(seen, 5);
    }

    #[test]
    fn test_delete() {
        let mut tree = RTree::new();
        for i in 0..200u32 {
            tree.insert(pt_rect((i % 17) as f64, (i / 17) as f64), i);
        }
        for i in (0..200u32).step_by(2) {
            assert!(tree.delete(&pt_rect((i % 17) as f64, (i / 17) as f64), &i));
        }
        assert_eq!(tree.len(), 100);
        assert!(!tree.delete(&pt_rect(0.0, 0.0), &0));
        let remaining = collect_all(&tree);
        assert_eq!(remaining, (0..200).filter(|i| i % 2 == 1).collect::<Vec<_>>());
    }

    #[test]
    fn test_random_churn_keeps_membership() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut tree = RTree::new();
        let mut live: Vec<(Rect, u32)> = Vec::new();
        for i in 0..1000u32 {
            let rect = pt_rect(
                rng.gen_range(-180.0..180.0),
                rng.gen_range(-90.0..90.0),
            );
            tree.insert(rect, i);
            live.push((rect, i));
            if i % 3 == 0 && !live.is_empty() {
                let idx = rng.gen_range(0..live.len());
                let (rect, item) = live.swap_remove(idx);
                assert!(tree.delete(&rect, &item));
            }
        }
        assert_eq!(tree.len(), live.len());
        let mut expect: Vec<u32> = live.iter().map(|(_, i)| *i).collect();
        expect.sort_unstable();
        assert_eq!(collect_all(&tree), expect);
    }

    #[test]
    fn test_bounds_is_union_of_entries() {
        let mut tree = RTree::new();
        tree.insert(pt_rect(-10.0, -5.0), 1u32);
        tree.insert(pt_rect(20.0, 30.0), 2u32);
        assert_eq!(tree.bounds(), Some(Rect::new(-10.0, -5.0, 20.0, 30.0)));
    }

    #[test]
    fn test_nearby_orders_by_distance() {
        let mut tree = RTree::new();
        let mut rng = StdRng::seed_from_u64(42);
        for i in 0..300u32 {
            tree.insert(
                pt_rect(rng.gen_range(-50.0..50.0), rng.gen_range(-50.0..50.0)),
                i,
            );
        }
        let target = (3.0, 4.0);
        let box_dist = |rect: &Rect| -> f64 {
            let dx = (rect.min.x - target.0).max(target.0 - rect.max.x).max(0.0);
            let dy = (rect.min.y - target.1).max(target.1 - rect.max.y).max(0.0);
            (dx * dx + dy * dy).sqrt()
        };
        let mut last = 0.0f64;
        let mut seen = 0;
        tree.nearby(&box_dist, &mut |_, _, d| {
            assert!(d >= last, "distance went backwards: {} < {}", d, last);
            last = d;
            seen += 1;
            true
        });
        assert_eq!(seen, 300);
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut tree = RTree::new();
        for i in 0..500u32 {
            tree.insert(pt_rect((i % 31) as f64, (i / 31) as f64), i);
        }
        let mut buf = Vec::new();
        tree.save(&mut buf, &mut |w, item| w.write_all(&item.to_be_bytes()))
            .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let loaded: RTree<u32> = RTree::load(&mut cursor, &mut |r| {
            let mut b = [0u8; 4];
            r.read_exact(&mut b)?;
            Ok(u32::from_be_bytes(b))
        })
        .unwrap();
        assert_eq!(loaded.len(), tree.len());
        assert_eq!(loaded.height(), tree.height());
        assert_eq!(collect_all(&loaded), collect_all(&tree));
        assert_eq!(loaded.bounds(), tree.bounds());
    }

    #[test]
    fn test_empty_tree() {
        let tree: RTree<u32> = RTree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.bounds(), None);
        assert!(tree.search(&Rect::world(), &mut |_, _| panic!("no items")));
        assert!(tree.nearby(&|_| 0.0, &mut |_, _, _| panic!("no items")));
    }
}

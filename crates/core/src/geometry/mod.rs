//! Planar geometry kernel.
//!
//! Coordinates are WGS-84 degrees with `x = longitude`, `y = latitude`.
//! The kernel is deliberately small: points, rectangles, segments, rings and
//! polygons with holes, plus the predicates the search layer needs
//! (intersects / within / contains). Geodetic math lives in [`crate::dist`].

mod poly;
mod ring;

pub use poly::{line_intersects_line, line_rect, point_on_line, Poly};
pub use ring::{
    point_in_ring, point_on_ring, ring_contains_ring, ring_intersects_ring, ring_rect,
    segment_intersects_ring,
};

use serde::{Deserialize, Serialize};

/// A 2-D position. `x` is longitude, `y` is latitude.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }
}

/// An axis-aligned rectangle described by its min and max corners.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub min: Point,
    pub max: Point,
}

impl Rect {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Rect {
            min: Point::new(min_x, min_y),
            max: Point::new(max_x, max_y),
        }
    }

    /// The rectangle covering the whole coordinate space.
    pub fn world() -> Self {
        Rect::new(-180.0, -90.0, 180.0, 90.0)
    }

    pub fn center(&self) -> Point {
        Point::new(
            (self.min.x + self.max.x) / 2.0,
            (self.min.y + self.max.y) / 2.0,
        )
    }

    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// Smallest rectangle containing both `self` and `other`.
    pub fn union(&self, other: &Rect) -> Rect {
        Rect::new(
            self.min.x.min(other.min.x),
            self.min.y.min(other.min.y),
            self.max.x.max(other.max.x),
            self.max.y.max(other.max.y),
        )
    }

    /// Overlap of two rectangles; callers must check `intersects_rect` first
    /// if they need a non-degenerate result.
    pub fn intersection(&self, other: &Rect) -> Rect {
        Rect::new(
            self.min.x.max(other.min.x),
            self.min.y.max(other.min.y),
            self.max.x.min(other.max.x),
            self.max.y.min(other.max.y),
        )
    }

    pub fn expand_point(&mut self, p: Point) {
        self.min.x = self.min.x.min(p.x);
        self.min.y = self.min.y.min(p.y);
        self.max.x = self.max.x.max(p.x);
        self.max.y = self.max.y.max(p.y);
    }

    pub fn contains_point(&self, p: Point) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        self.contains_point(other.min) && self.contains_point(other.max)
    }

    pub fn intersects_rect(&self, other: &Rect) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    /// The rectangle's boundary as a closed ring, counter-clockwise.
    pub fn ring(&self) -> Vec<Point> {
        vec![
            Point::new(self.min.x, self.min.y),
            Point::new(self.max.x, self.min.y),
            Point::new(self.max.x, self.max.y),
            Point::new(self.min.x, self.max.y),
        ]
    }
}

/// A directed line segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub a: Point,
    pub b: Point,
}

impl Segment {
    pub fn new(a: Point, b: Point) -> Self {
        Segment { a, b }
    }

    pub fn rect(&self) -> Rect {
        Rect::new(
            self.a.x.min(self.b.x),
            self.a.y.min(self.b.y),
            self.a.x.max(self.b.x),
            self.a.y.max(self.b.y),
        )
    }

    /// Inclusive intersection test: touching endpoints and collinear overlap
    /// count as intersecting.
    pub fn intersects_segment(&self, other: &Segment) -> bool {
        let d1 = orient(other.a, other.b, self.a);
        let d2 = orient(other.a, other.b, self.b);
        let d3 = orient(self.a, self.b, other.a);
        let d4 = orient(self.a, self.b, other.b);

        if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
            && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
        {
            return true;
        }
        (d1 == 0.0 && on_segment(other.a, other.b, self.a))
            || (d2 == 0.0 && on_segment(other.a, other.b, self.b))
            || (d3 == 0.0 && on_segment(self.a, self.b, other.a))
            || (d4 == 0.0 && on_segment(self.a, self.b, other.b))
    }

    /// Strict intersection: the segment interiors cross. Shared endpoints and
    /// collinear touches do not count. Used by `within` tests, where a
    /// contained shape is allowed to touch the container's boundary.
    pub fn crosses_segment(&self, other: &Segment) -> bool {
        let d1 = orient(other.a, other.b, self.a);
        let d2 = orient(other.a, other.b, self.b);
        let d3 = orient(self.a, self.b, other.a);
        let d4 = orient(self.a, self.b, other.b);
        ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
            && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    }

    /// Whether `p` lies on the segment (inclusive of endpoints).
    pub fn contains_point(&self, p: Point) -> bool {
        orient(self.a, self.b, p) == 0.0 && on_segment(self.a, self.b, p)
    }
}

/// Cross-product orientation of `c` relative to the line `a -> b`.
/// Positive is counter-clockwise, negative clockwise, zero collinear.
fn orient(a: Point, b: Point, c: Point) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

/// For collinear points only: whether `p` falls inside the bounding range of
/// the segment `a -> b`.
fn on_segment(a: Point, b: Point, p: Point) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_union_intersection() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(5.0, 5.0, 15.0, 15.0);
        assert_eq!(a.union(&b), Rect::new(0.0, 0.0, 15.0, 15.0));
        assert_eq!(a.intersection(&b), Rect::new(5.0, 5.0, 10.0, 10.0));
        assert!(a.intersects_rect(&b));
        assert!(!a.contains_rect(&b));
        assert!(a.contains_rect(&Rect::new(1.0, 1.0, 2.0, 2.0)));
    }

    #[test]
    fn test_rect_disjoint() {
        let a = Rect::new(0.0, 0.0, 1.0, 1.0);
        let b = Rect::new(2.0, 2.0, 3.0, 3.0);
        assert!(!a.intersects_rect(&b));
    }

    #[test]
    fn test_segment_intersections() {
        let s1 = Segment::new(Point::new(0.0, 0.0), Point::new(10.0, 10.0));
        let s2 = Segment::new(Point::new(0.0, 10.0), Point::new(10.0, 0.0));
        assert!(s1.intersects_segment(&s2));
        assert!(s1.crosses_segment(&s2));

        // shared endpoint: touches but does not cross
        let s3 = Segment::new(Point::new(10.0, 10.0), Point::new(20.0, 0.0));
        assert!(s1.intersects_segment(&s3));
        assert!(!s1.crosses_segment(&s3));

        // parallel, disjoint
        let s4 = Segment::new(Point::new(0.0, 1.0), Point::new(10.0, 11.0));
        assert!(!s1.intersects_segment(&s4));
    }

    #[test]
    fn test_segment_contains_point() {
        let s = Segment::new(Point::new(0.0, 0.0), Point::new(10.0, 0.0));
        assert!(s.contains_point(Point::new(5.0, 0.0)));
        assert!(s.contains_point(Point::new(0.0, 0.0)));
        assert!(!s.contains_point(Point::new(5.0, 0.1)));
        assert!(!s.contains_point(Point::new(11.0, 0.0)));
    }
}

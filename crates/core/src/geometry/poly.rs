//! Polygons with holes, and line/polygon predicates.

use super::ring::{
    point_in_ring, ring_contains_ring, ring_intersects_ring, ring_rect, segment_crosses_ring,
    segment_intersects_ring,
};
use super::{Point, Rect, Segment};

/// A polygon: one exterior ring plus zero or more holes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Poly {
    pub exterior: Vec<Point>,
    pub holes: Vec<Vec<Point>>,
}

impl Poly {
    pub fn new(exterior: Vec<Point>) -> Self {
        Poly {
            exterior,
            holes: Vec::new(),
        }
    }

    pub fn with_holes(exterior: Vec<Point>, holes: Vec<Vec<Point>>) -> Self {
        Poly { exterior, holes }
    }

    pub fn from_rect(rect: &Rect) -> Self {
        Poly::new(rect.ring())
    }

    pub fn is_empty(&self) -> bool {
        self.exterior.len() < 3
    }

    pub fn rect(&self) -> Rect {
        ring_rect(&self.exterior)
    }

    /// Number of vertices across the exterior and all holes.
    pub fn num_points(&self) -> usize {
        self.exterior.len() + self.holes.iter().map(|h| h.len()).sum::<usize>()
    }

    /// Point-in-polygon. Hole boundaries count as inside the polygon.
    pub fn contains_point(&self, p: Point) -> bool {
        if !point_in_ring(p, &self.exterior) {
            return false;
        }
        for hole in &self.holes {
            if point_in_ring(p, hole) && !super::ring::point_on_ring(p, hole) {
                return false;
            }
        }
        true
    }

    pub fn intersects_segment(&self, seg: &Segment) -> bool {
        if segment_intersects_ring(seg, &self.exterior) {
            return true;
        }
        // fully inside: either endpoint landing in the polygon is enough
        self.contains_point(seg.a) || self.contains_point(seg.b)
    }

    /// Whether the whole segment stays inside the polygon.
    pub fn contains_segment(&self, seg: &Segment) -> bool {
        if !self.contains_point(seg.a) || !self.contains_point(seg.b) {
            return false;
        }
        if segment_crosses_ring(seg, &self.exterior) {
            return false;
        }
        for hole in &self.holes {
            if segment_crosses_ring(seg, hole) {
                return false;
            }
        }
        true
    }

    pub fn intersects_poly(&self, other: &Poly) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        if !self.rect().intersects_rect(&other.rect()) {
            return false;
        }
        if !ring_intersects_ring(&self.exterior, &other.exterior) {
            return false;
        }
        // Exterior rings overlap. Rule out the case where one polygon sits
        // entirely inside a hole of the other. Touching the hole boundary
        // still counts as intersecting, since that boundary belongs to the
        // polygon itself.
        let swallowed = |hole: &[Point], ext: &[Point]| {
            ring_contains_ring(hole, ext)
                && !ext.iter().any(|&p| super::ring::point_on_ring(p, hole))
        };
        if self.holes.iter().any(|h| swallowed(h, &other.exterior)) {
            return false;
        }
        if other.holes.iter().any(|h| swallowed(h, &self.exterior)) {
            return false;
        }
        true
    }

    /// Whether `other` is fully contained in `self`.
    pub fn contains_poly(&self, other: &Poly) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        if !ring_contains_ring(&self.exterior, &other.exterior) {
            return false;
        }
        // None of our holes may bite into the contained polygon, unless the
        // hole itself is covered by a hole of `other`.
        for hole in &self.holes {
            if ring_intersects_ring(hole, &other.exterior)
                && !other.holes.iter().any(|oh| ring_contains_ring(oh, hole))
            {
                return false;
            }
        }
        true
    }

    pub fn intersects_rect(&self, rect: &Rect) -> bool {
        self.intersects_poly(&Poly::from_rect(rect))
    }

    pub fn contains_rect(&self, rect: &Rect) -> bool {
        self.contains_poly(&Poly::from_rect(rect))
    }

    /// Whether a polyline intersects this polygon.
    pub fn intersects_line(&self, line: &[Point]) -> bool {
        match line.len() {
            0 => false,
            1 => self.contains_point(line[0]),
            _ => line
                .windows(2)
                .any(|w| self.intersects_segment(&Segment::new(w[0], w[1]))),
        }
    }

    /// Whether a polyline lies entirely inside this polygon.
    pub fn contains_line(&self, line: &[Point]) -> bool {
        match line.len() {
            0 => false,
            1 => self.contains_point(line[0]),
            _ => line
                .windows(2)
                .all(|w| self.contains_segment(&Segment::new(w[0], w[1]))),
        }
    }
}

/// Bounding rectangle of a polyline.
pub fn line_rect(line: &[Point]) -> Rect {
    ring_rect(line)
}

/// Inclusive polyline/polyline intersection.
pub fn line_intersects_line(a: &[Point], b: &[Point]) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a.len() == 1 {
        return point_on_line(a[0], b);
    }
    if b.len() == 1 {
        return point_on_line(b[0], a);
    }
    for wa in a.windows(2) {
        let sa = Segment::new(wa[0], wa[1]);
        for wb in b.windows(2) {
            if sa.intersects_segment(&Segment::new(wb[0], wb[1])) {
                return true;
            }
        }
    }
    false
}

/// Whether `p` lies on the polyline.
pub fn point_on_line(p: Point, line: &[Point]) -> bool {
    match line.len() {
        0 => false,
        1 => line[0] == p,
        _ => line
            .windows(2)
            .any(|w| Segment::new(w[0], w[1]).contains_point(p)),
    }
}

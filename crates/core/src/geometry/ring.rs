//! Ring predicates.
//!
//! A ring is a closed loop of vertices. The closing edge from the last vertex
//! back to the first is implicit; callers may pass rings with or without a
//! duplicated closing vertex.

use super::{Point, Rect, Segment};

/// Iterate the edges of a ring, including the implicit closing edge.
fn edges(ring: &[Point]) -> impl Iterator<Item = Segment> + '_ {
    let n = ring.len();
    (0..n).filter_map(move |i| {
        let a = ring[i];
        let b = ring[(i + 1) % n];
        if i == n - 1 && a == b {
            None // explicit closing vertex, skip the degenerate edge
        } else {
            Some(Segment::new(a, b))
        }
    })
}

/// Bounding rectangle of a ring (or any point list).
pub fn ring_rect(ring: &[Point]) -> Rect {
    let mut rect = match ring.first() {
        Some(&p) => Rect { min: p, max: p },
        None => return Rect::default(),
    };
    for &p in &ring[1..] {
        rect.expand_point(p);
    }
    rect
}

/// Whether `p` lies exactly on the ring boundary.
pub fn point_on_ring(p: Point, ring: &[Point]) -> bool {
    edges(ring).any(|e| e.contains_point(p))
}

/// Raycast point-in-ring test. Boundary points count as inside.
pub fn point_in_ring(p: Point, ring: &[Point]) -> bool {
    if ring.len() < 3 {
        return false;
    }
    if point_on_ring(p, ring) {
        return true;
    }
    let mut inside = false;
    for e in edges(ring) {
        let (a, b) = (e.a, e.b);
        if (a.y > p.y) != (b.y > p.y) {
            let x = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if x > p.x {
                inside = !inside;
            }
        }
    }
    inside
}

/// Whether any edge of the ring intersects `seg` (inclusive).
pub fn segment_intersects_ring(seg: &Segment, ring: &[Point]) -> bool {
    edges(ring).any(|e| e.intersects_segment(seg))
}

/// Whether any edge of the ring strictly crosses `seg`.
pub fn segment_crosses_ring(seg: &Segment, ring: &[Point]) -> bool {
    edges(ring).any(|e| e.crosses_segment(seg))
}

/// Inclusive ring/ring intersection: boundaries touch, edges cross, or one
/// ring is entirely inside the other.
pub fn ring_intersects_ring(a: &[Point], b: &[Point]) -> bool {
    if a.is_empty() || b.is_empty() || !ring_rect(a).intersects_rect(&ring_rect(b)) {
        return false;
    }
    for ea in edges(a) {
        if segment_intersects_ring(&ea, b) {
            return true;
        }
    }
    point_in_ring(a[0], b) || point_in_ring(b[0], a)
}

/// Whether `outer` fully contains `inner`. Touching the outer boundary is
/// allowed; crossing it is not.
pub fn ring_contains_ring(outer: &[Point], inner: &[Point]) -> bool {
    if inner.is_empty() || outer.len() < 3 {
        return false;
    }
    if !ring_rect(outer).contains_rect(&ring_rect(inner)) {
        return false;
    }
    if !inner.iter().all(|&p| point_in_ring(p, outer)) {
        return false;
    }
    !edges(inner).any(|e| segment_crosses_ring(&e, outer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(min: f64, max: f64) -> Vec<Point> {
        vec![
            Point::new(min, min),
            Point::new(max, min),
            Point::new(max, max),
            Point::new(min, max),
        ]
    }

    #[test]
    fn test_point_in_ring() {
        let sq = square(0.0, 10.0);
        assert!(point_in_ring(Point::new(5.0, 5.0), &sq));
        assert!(point_in_ring(Point::new(0.0, 5.0), &sq)); // boundary
        assert!(point_in_ring(Point::new(0.0, 0.0), &sq)); // corner
        assert!(!point_in_ring(Point::new(10.1, 5.0), &sq));
        assert!(!point_in_ring(Point::new(-0.1, -0.1), &sq));
    }

    #[test]
    fn test_point_in_ring_with_closing_vertex() {
        let mut sq = square(0.0, 10.0);
        sq.push(sq[0]);
        assert!(point_in_ring(Point::new(5.0, 5.0), &sq));
        assert!(!point_in_ring(Point::new(15.0, 5.0), &sq));
    }

    #[test]
    fn test_ring_intersects_ring() {
        let a = square(0.0, 10.0);
        let b = square(5.0, 15.0);
        let c = square(20.0, 30.0);
        let inner = square(2.0, 4.0);
        assert!(ring_intersects_ring(&a, &b));
        assert!(!ring_intersects_ring(&a, &c));
        assert!(ring_intersects_ring(&a, &inner)); // containment counts
        assert!(ring_intersects_ring(&inner, &a));
    }

    #[test]
    fn test_ring_contains_ring() {
        let outer = square(0.0, 10.0);
        let inner = square(2.0, 8.0);
        let straddling = square(5.0, 15.0);
        assert!(ring_contains_ring(&outer, &inner));
        assert!(!ring_contains_ring(&inner, &outer));
        assert!(!ring_contains_ring(&outer, &straddling));
        // touching the boundary from the inside is containment
        assert!(ring_contains_ring(&outer, &square(0.0, 5.0)));
    }
}

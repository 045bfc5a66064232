//! Clipping of objects to a rectangular window, used by the CLIP option of
//! INTERSECTS. Lines clip with Liang-Barsky (splitting into a multi-line
//! when they exit and re-enter); polygons clip ring-by-ring with
//! Sutherland-Hodgman.

use crate::geometry::{Point, Poly, Rect};
use crate::object::{Feature, Object};

/// Clip `obj` against the bounding rectangle of `window`. Objects fully
/// inside come back unchanged; objects fully outside come back as-is too
/// (the search already established intersection at the envelope level).
pub fn clip(obj: &Object, window: &Object) -> Object {
    let rect = window.rect();
    match obj {
        Object::Point(_) | Object::String(_) | Object::Circle(_) => obj.clone(),
        Object::Rect(r) => {
            if rect.contains_rect(r) {
                obj.clone()
            } else {
                Object::Rect(rect.intersection(r))
            }
        }
        Object::LineString(line) => {
            let parts = clip_line(line, &rect);
            match parts.len() {
                0 => Object::LineString(Vec::new()),
                1 => Object::LineString(parts.into_iter().next().unwrap()),
                _ => Object::MultiLineString(parts),
            }
        }
        Object::MultiLineString(lines) => {
            let parts: Vec<Vec<Point>> =
                lines.iter().flat_map(|l| clip_line(l, &rect)).collect();
            Object::MultiLineString(parts)
        }
        Object::Polygon(p) => Object::Polygon(clip_poly(p, &rect)),
        Object::MultiPolygon(ps) => Object::MultiPolygon(
            ps.iter()
                .map(|p| clip_poly(p, &rect))
                .filter(|p| !p.is_empty())
                .collect(),
        ),
        Object::Feature(f) => Object::Feature(Feature {
            geometry: Box::new(clip(&f.geometry, window)),
            members: f.members.clone(),
        }),
        Object::FeatureCollection(objs) => {
            Object::FeatureCollection(objs.iter().map(|o| clip(o, window)).collect())
        }
    }
}

/// Liang-Barsky segment clip. Returns the clipped polyline pieces.
fn clip_line(line: &[Point], rect: &Rect) -> Vec<Vec<Point>> {
    let mut parts: Vec<Vec<Point>> = Vec::new();
    let mut current: Vec<Point> = Vec::new();
    for w in line.windows(2) {
        if let Some((a, b)) = clip_segment(w[0], w[1], rect) {
            if current.is_empty() {
                current.push(a);
            } else if *current.last().unwrap() != a {
                // the line left the window and came back: start a new part
                parts.push(std::mem::take(&mut current));
                current.push(a);
            }
            current.push(b);
        } else if !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn clip_segment(a: Point, b: Point, rect: &Rect) -> Option<(Point, Point)> {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;
    let checks = [
        (-dx, a.x - rect.min.x),
        (dx, rect.max.x - a.x),
        (-dy, a.y - rect.min.y),
        (dy, rect.max.y - a.y),
    ];
    for (p, q) in checks {
        if p == 0.0 {
            if q < 0.0 {
                return None; // parallel and outside
            }
        } else {
            let r = q / p;
            if p < 0.0 {
                if r > t1 {
                    return None;
                }
                if r > t0 {
                    t0 = r;
                }
            } else {
                if r < t0 {
                    return None;
                }
                if r < t1 {
                    t1 = r;
                }
            }
        }
    }
    Some((
        Point::new(a.x + t0 * dx, a.y + t0 * dy),
        Point::new(a.x + t1 * dx, a.y + t1 * dy),
    ))
}

fn clip_poly(poly: &Poly, rect: &Rect) -> Poly {
    let exterior = clip_ring(&poly.exterior, rect);
    let holes: Vec<Vec<Point>> = poly
        .holes
        .iter()
        .map(|h| clip_ring(h, rect))
        .filter(|h| h.len() >= 3)
        .collect();
    Poly::with_holes(exterior, holes)
}

/// Sutherland-Hodgman against each rect edge.
fn clip_ring(ring: &[Point], rect: &Rect) -> Vec<Point> {
    let mut output: Vec<Point> = ring.to_vec();
    // drop the duplicated closing vertex while clipping
    if output.len() > 1 && output.first() == output.last() {
        output.pop();
    }
    for edge in 0..4 {
        if output.is_empty() {
            break;
        }
        let input = std::mem::take(&mut output);
        let n = input.len();
        for i in 0..n {
            let cur = input[i];
            let prev = input[(i + n - 1) % n];
            let cur_in = inside_edge(cur, rect, edge);
            let prev_in = inside_edge(prev, rect, edge);
            if cur_in {
                if !prev_in {
                    output.push(edge_intersect(prev, cur, rect, edge));
                }
                output.push(cur);
            } else if prev_in {
                output.push(edge_intersect(prev, cur, rect, edge));
            }
        }
    }
    output
}

fn inside_edge(p: Point, rect: &Rect, edge: usize) -> bool {
    match edge {
        0 => p.x >= rect.min.x,
        1 => p.x <= rect.max.x,
        2 => p.y >= rect.min.y,
        _ => p.y <= rect.max.y,
    }
}

fn edge_intersect(a: Point, b: Point, rect: &Rect, edge: usize) -> Point {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    match edge {
        0 => {
            let t = (rect.min.x - a.x) / dx;
            Point::new(rect.min.x, a.y + t * dy)
        }
        1 => {
            let t = (rect.max.x - a.x) / dx;
            Point::new(rect.max.x, a.y + t * dy)
        }
        2 => {
            let t = (rect.min.y - a.y) / dy;
            Point::new(a.x + t * dx, rect.min.y)
        }
        _ => {
            let t = (rect.max.y - a.y) / dy;
            Point::new(a.x + t * dx, rect.max.y)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_untouched() {
        let window = Object::Rect(Rect::new(0.0, 0.0, 10.0, 10.0));
        let p = Object::point(100.0, 100.0);
        assert_eq!(clip(&p, &window), p);
    }

    #[test]
    fn test_rect_clipped() {
        let window = Object::Rect(Rect::new(0.0, 0.0, 10.0, 10.0));
        let r = Object::Rect(Rect::new(5.0, 5.0, 15.0, 15.0));
        assert_eq!(
            clip(&r, &window),
            Object::Rect(Rect::new(5.0, 5.0, 10.0, 10.0))
        );
    }

    #[test]
    fn test_line_clipped_to_window() {
        let window = Object::Rect(Rect::new(0.0, 0.0, 10.0, 10.0));
        let line = Object::LineString(vec![Point::new(-5.0, 5.0), Point::new(15.0, 5.0)]);
        match clip(&line, &window) {
            Object::LineString(part) => {
                assert_eq!(part, vec![Point::new(0.0, 5.0), Point::new(10.0, 5.0)]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_line_reentering_becomes_multi() {
        let window = Object::Rect(Rect::new(0.0, 0.0, 10.0, 10.0));
        // enters, exits through the top, re-enters
        let line = Object::LineString(vec![
            Point::new(1.0, 5.0),
            Point::new(5.0, 20.0),
            Point::new(9.0, 5.0),
        ]);
        match clip(&line, &window) {
            Object::MultiLineString(parts) => assert_eq!(parts.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_polygon_clipped() {
        let window = Object::Rect(Rect::new(0.0, 0.0, 10.0, 10.0));
        let poly = Object::Polygon(Poly::from_rect(&Rect::new(5.0, 5.0, 20.0, 20.0)));
        match clip(&poly, &window) {
            Object::Polygon(p) => {
                assert_eq!(p.rect(), Rect::new(5.0, 5.0, 10.0, 10.0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

//! The tagged geospatial value stored in collections.
//!
//! `Object` replaces a deep type hierarchy with one variant plus free
//! predicate functions. Every object reports its rectangular bound, emptiness,
//! position count and weight, and supports Within / Intersects / Contains
//! against any other object. The `String` variant is the one non-spatial
//! member; it never enters the spatial index.

use crate::dist;
use crate::geometry::{line_intersects_line, line_rect, point_on_line, Poly, Point, Rect};

/// A point with an optional altitude. Altitude is retained on the object and
/// surfaced through the `z` pseudo-field, but never affects 2-D indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoPoint {
    pub pos: Point,
    pub z: Option<f64>,
}

/// A circle: center plus radius in meters, approximated by a ring with
/// `steps` vertices for polygon predicates. Point containment stays exact
/// (geodetic distance).
#[derive(Debug, Clone, PartialEq)]
pub struct Circle {
    center: Point,
    meters: f64,
    steps: usize,
    poly: Poly,
}

/// Default vertex count for circle rings.
pub const DEFAULT_CIRCLE_STEPS: usize = 64;

impl Circle {
    pub fn new(center: Point, meters: f64, steps: usize) -> Self {
        let steps = steps.max(3);
        let mut ring = Vec::with_capacity(steps);
        if meters > 0.0 {
            for i in 0..steps {
                let bearing = 360.0 * i as f64 / steps as f64;
                ring.push(dist::destination_point(center.y, center.x, meters, bearing));
            }
        } else {
            ring.push(center);
        }
        Circle {
            center,
            meters,
            steps,
            poly: Poly::new(ring),
        }
    }

    pub fn center(&self) -> Point {
        self.center
    }

    pub fn meters(&self) -> f64 {
        self.meters
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn poly(&self) -> &Poly {
        &self.poly
    }

    pub fn rect(&self) -> Rect {
        if self.meters <= 0.0 {
            return Rect {
                min: self.center,
                max: self.center,
            };
        }
        let (min_lat, min_lon, max_lat, max_lon) =
            dist::rect_from_center(self.center.y, self.center.x, self.meters);
        Rect::new(min_lon, min_lat, max_lon, max_lat)
    }

    pub fn contains_point(&self, p: Point) -> bool {
        dist::distance_meters(self.center, p) <= self.meters
    }
}

/// A GeoJSON Feature. Members other than `geometry` (`properties`, `id`, any
/// foreign members) are retained verbatim for JSON round-trip.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub geometry: Box<Object>,
    pub members: serde_json::Map<String, serde_json::Value>,
}

/// A geospatial value. See the module docs.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Point(GeoPoint),
    Rect(Rect),
    LineString(Vec<Point>),
    MultiLineString(Vec<Vec<Point>>),
    Polygon(Poly),
    MultiPolygon(Vec<Poly>),
    Circle(Circle),
    Feature(Feature),
    FeatureCollection(Vec<Object>),
    String(String),
}

impl Object {
    pub fn point(x: f64, y: f64) -> Self {
        Object::Point(GeoPoint {
            pos: Point::new(x, y),
            z: None,
        })
    }

    pub fn point_z(x: f64, y: f64, z: f64) -> Self {
        Object::Point(GeoPoint {
            pos: Point::new(x, y),
            z: Some(z),
        })
    }

    /// Whether the object participates in the spatial index.
    pub fn is_spatial(&self) -> bool {
        !matches!(self, Object::String(_))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Object::Point(_) | Object::Rect(_) | Object::Circle(_) => false,
            Object::LineString(l) => l.is_empty(),
            Object::MultiLineString(ls) => ls.iter().all(|l| l.is_empty()),
            Object::Polygon(p) => p.is_empty(),
            Object::MultiPolygon(ps) => ps.iter().all(|p| p.is_empty()),
            Object::Feature(f) => f.geometry.is_empty(),
            Object::FeatureCollection(objs) => objs.is_empty(),
            Object::String(_) => false,
        }
    }

    /// Bounding rectangle. Non-spatial strings report a degenerate rect at
    /// the origin; they are never indexed.
    pub fn rect(&self) -> Rect {
        match self {
            Object::Point(p) => Rect {
                min: p.pos,
                max: p.pos,
            },
            Object::Rect(r) => *r,
            Object::LineString(l) => line_rect(l),
            Object::MultiLineString(ls) => {
                let mut it = ls.iter().filter(|l| !l.is_empty());
                match it.next() {
                    Some(first) => {
                        let mut rect = line_rect(first);
                        for l in it {
                            rect = rect.union(&line_rect(l));
                        }
                        rect
                    }
                    None => Rect::default(),
                }
            }
            Object::Polygon(p) => p.rect(),
            Object::MultiPolygon(ps) => {
                let mut it = ps.iter().filter(|p| !p.is_empty());
                match it.next() {
                    Some(first) => {
                        let mut rect = first.rect();
                        for p in it {
                            rect = rect.union(&p.rect());
                        }
                        rect
                    }
                    None => Rect::default(),
                }
            }
            Object::Circle(c) => c.rect(),
            Object::Feature(f) => f.geometry.rect(),
            Object::FeatureCollection(objs) => {
                let mut it = objs.iter().filter(|o| !o.is_empty());
                match it.next() {
                    Some(first) => {
                        let mut rect = first.rect();
                        for o in it {
                            rect = rect.union(&o.rect());
                        }
                        rect
                    }
                    None => Rect::default(),
                }
            }
            Object::String(_) => Rect::default(),
        }
    }

    pub fn center(&self) -> Point {
        self.rect().center()
    }

    /// Altitude, for Point objects carrying one.
    pub fn z(&self) -> Option<f64> {
        match self {
            Object::Point(p) => p.z,
            Object::Feature(f) => f.geometry.z(),
            _ => None,
        }
    }

    /// Number of positions. Drives the collection's `points` tally and the
    /// in-memory weight estimate.
    pub fn num_points(&self) -> usize {
        match self {
            Object::Point(_) => 1,
            Object::Rect(_) => 2,
            Object::LineString(l) => l.len(),
            Object::MultiLineString(ls) => ls.iter().map(|l| l.len()).sum(),
            Object::Polygon(p) => p.num_points(),
            Object::MultiPolygon(ps) => ps.iter().map(|p| p.num_points()).sum(),
            Object::Circle(c) => c.poly.exterior.len(),
            Object::Feature(f) => f.geometry.num_points(),
            Object::FeatureCollection(objs) => objs.iter().map(|o| o.num_points()).sum(),
            Object::String(_) => 0,
        }
    }

    /// Estimated in-memory byte cost of the value alone.
    pub fn weight(&self) -> usize {
        match self {
            Object::String(s) => s.len(),
            _ => self.num_points() * 16,
        }
    }

    /// The value's string form: the raw string for `String`, GeoJSON for
    /// everything else. This is the representation the value index orders by
    /// and the snapshot stores.
    pub fn string_repr(&self) -> String {
        match self {
            Object::String(s) => s.clone(),
            _ => crate::geojson::to_json(self),
        }
    }

    // ------------------------------------------------------------------
    // Predicates
    // ------------------------------------------------------------------

    /// Whether `self` is fully contained in `other`.
    pub fn within(&self, other: &Object) -> bool {
        if !self.is_spatial() || !other.is_spatial() || self.is_empty() || other.is_empty() {
            return false;
        }
        if !other.rect().contains_rect(&self.rect()) {
            return false;
        }
        match (self, other) {
            (Object::FeatureCollection(objs), _) => objs.iter().all(|o| o.within(other)),
            (_, Object::FeatureCollection(objs)) => objs.iter().any(|o| self.within(o)),
            (Object::Feature(f), _) => f.geometry.within(other),
            (_, Object::Feature(f)) => self.within(&f.geometry),
            _ => {
                let mine = self.shapes();
                let theirs = other.shapes();
                !mine.is_empty()
                    && mine
                        .iter()
                        .all(|sa| theirs.iter().any(|sb| shape_within(sa, sb)))
            }
        }
    }

    /// Whether `self` and `other` share any point.
    pub fn intersects(&self, other: &Object) -> bool {
        if !self.is_spatial() || !other.is_spatial() || self.is_empty() || other.is_empty() {
            return false;
        }
        if !other.rect().intersects_rect(&self.rect()) {
            return false;
        }
        match (self, other) {
            (Object::FeatureCollection(objs), _) => objs.iter().any(|o| o.intersects(other)),
            (_, Object::FeatureCollection(objs)) => objs.iter().any(|o| self.intersects(o)),
            (Object::Feature(f), _) => f.geometry.intersects(other),
            (_, Object::Feature(f)) => self.intersects(&f.geometry),
            _ => {
                let mine = self.shapes();
                let theirs = other.shapes();
                mine.iter()
                    .any(|sa| theirs.iter().any(|sb| shape_intersects(sa, sb)))
            }
        }
    }

    /// Whether `self` fully contains `other`.
    pub fn contains(&self, other: &Object) -> bool {
        other.within(self)
    }

    fn shapes(&self) -> Vec<Shape<'_>> {
        match self {
            Object::Point(p) => vec![Shape::Pt(p.pos)],
            Object::Rect(r) => vec![Shape::Rect(*r)],
            Object::LineString(l) => vec![Shape::Line(l)],
            Object::MultiLineString(ls) => ls.iter().map(|l| Shape::Line(l.as_slice())).collect(),
            Object::Polygon(p) => vec![Shape::Poly(p)],
            Object::MultiPolygon(ps) => ps.iter().map(Shape::Poly).collect(),
            Object::Circle(c) => vec![Shape::Circle(c)],
            // Feature/FeatureCollection/String handled before shape dispatch
            Object::Feature(f) => f.geometry.shapes(),
            Object::FeatureCollection(objs) => objs.iter().flat_map(|o| o.shapes()).collect(),
            Object::String(_) => Vec::new(),
        }
    }
}

enum Shape<'a> {
    Pt(Point),
    Rect(Rect),
    Line(&'a [Point]),
    Poly(&'a Poly),
    Circle(&'a Circle),
}

fn shape_within(a: &Shape, b: &Shape) -> bool {
    use Shape::*;
    match (a, b) {
        (Pt(p), Pt(q)) => p == q,
        (Pt(p), Rect(r)) => r.contains_point(*p),
        (Pt(p), Line(l)) => point_on_line(*p, l),
        (Pt(p), Poly(poly)) => poly.contains_point(*p),
        (Pt(p), Circle(c)) => c.contains_point(*p),

        (Rect(a), Rect(b)) => b.contains_rect(a),
        (Rect(a), Poly(p)) => p.contains_rect(a),
        (Rect(a), Circle(c)) => c.poly.contains_rect(a),
        (Rect(_), Pt(_)) | (Rect(_), Line(_)) => false,

        (Line(l), Rect(r)) => !l.is_empty() && r.contains_rect(&line_rect(l)),
        (Line(l), Poly(p)) => p.contains_line(l),
        (Line(l), Circle(c)) => c.poly.contains_line(l),
        (Line(l), Line(m)) => !l.is_empty() && l.iter().all(|&p| point_on_line(p, m)),
        (Line(_), Pt(_)) => false,

        (Poly(p), Rect(r)) => r.contains_rect(&p.rect()),
        (Poly(a), Poly(b)) => b.contains_poly(a),
        (Poly(p), Circle(c)) => c.poly.contains_poly(p),
        (Poly(_), Pt(_)) | (Poly(_), Line(_)) => false,

        (Circle(c), other) => shape_within(&Poly(&c.poly), other),
    }
}

fn shape_intersects(a: &Shape, b: &Shape) -> bool {
    use Shape::*;
    match (a, b) {
        (Pt(p), Pt(q)) => p == q,
        (Pt(p), Rect(r)) | (Rect(r), Pt(p)) => r.contains_point(*p),
        (Pt(p), Line(l)) | (Line(l), Pt(p)) => point_on_line(*p, l),
        (Pt(p), Poly(poly)) | (Poly(poly), Pt(p)) => poly.contains_point(*p),
        (Pt(p), Circle(c)) | (Circle(c), Pt(p)) => c.contains_point(*p),

        (Rect(a), Rect(b)) => a.intersects_rect(b),
        (Rect(r), Line(l)) | (Line(l), Rect(r)) => line_intersects_rect(l, r),
        (Rect(r), Poly(p)) | (Poly(p), Rect(r)) => p.intersects_rect(r),
        (Rect(r), Circle(c)) | (Circle(c), Rect(r)) => c.poly.intersects_rect(r),

        (Line(l), Line(m)) => line_intersects_line(l, m),
        (Line(l), Poly(p)) | (Poly(p), Line(l)) => p.intersects_line(l),
        (Line(l), Circle(c)) | (Circle(c), Line(l)) => c.poly.intersects_line(l),

        (Poly(a), Poly(b)) => a.intersects_poly(b),
        (Poly(p), Circle(c)) | (Circle(c), Poly(p)) => c.poly.intersects_poly(p),

        (Circle(a), Circle(b)) => a.poly.intersects_poly(&b.poly),
    }
}

fn line_intersects_rect(line: &[Point], rect: &Rect) -> bool {
    if line.is_empty() || !line_rect(line).intersects_rect(rect) {
        return false;
    }
    if line.iter().any(|&p| rect.contains_point(p)) {
        return true;
    }
    let rect_poly = Poly::from_rect(rect);
    rect_poly.intersects_line(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(min: f64, max: f64) -> Object {
        Object::Polygon(Poly::from_rect(&Rect::new(min, min, max, max)))
    }

    #[test]
    fn test_point_within_polygon() {
        let poly = square(0.0, 10.0);
        assert!(Object::point(5.0, 5.0).within(&poly));
        assert!(!Object::point(15.0, 5.0).within(&poly));
        assert!(poly.contains(&Object::point(5.0, 5.0)));
    }

    #[test]
    fn test_polygon_within_polygon() {
        let outer = square(0.0, 10.0);
        let inner = square(2.0, 8.0);
        assert!(inner.within(&outer));
        assert!(!outer.within(&inner));
        assert!(inner.intersects(&outer));
        assert!(outer.intersects(&inner));
    }

    #[test]
    fn test_rect_predicates() {
        let r = Object::Rect(Rect::new(0.0, 0.0, 10.0, 10.0));
        assert!(Object::point(3.0, 3.0).within(&r));
        assert!(Object::Rect(Rect::new(1.0, 1.0, 2.0, 2.0)).within(&r));
        assert!(r.intersects(&square(5.0, 15.0)));
        assert!(!r.intersects(&square(11.0, 15.0)));
    }

    #[test]
    fn test_circle_point_containment_is_geodetic() {
        let circle = Object::Circle(Circle::new(Point::new(-115.0, 33.0), 5_000.0, 64));
        // ~2.2 km east of center
        assert!(Object::point(-114.976, 33.0).within(&circle));
        // ~9 km east of center
        assert!(!Object::point(-114.9, 33.0).within(&circle));
    }

    #[test]
    fn test_linestring_predicates() {
        let poly = square(0.0, 10.0);
        let inside = Object::LineString(vec![Point::new(1.0, 1.0), Point::new(9.0, 9.0)]);
        let crossing = Object::LineString(vec![Point::new(-5.0, 5.0), Point::new(15.0, 5.0)]);
        assert!(inside.within(&poly));
        assert!(!crossing.within(&poly));
        assert!(crossing.intersects(&poly));
        assert!(poly.intersects(&crossing));
    }

    #[test]
    fn test_string_objects_are_not_spatial() {
        let s = Object::String("hello".into());
        assert!(!s.is_spatial());
        assert!(!s.within(&square(0.0, 10.0)));
        assert!(!square(0.0, 10.0).intersects(&s));
        assert_eq!(s.weight(), 5);
        assert_eq!(s.num_points(), 0);
    }

    #[test]
    fn test_feature_delegates_to_geometry() {
        let f = Object::Feature(Feature {
            geometry: Box::new(Object::point(5.0, 5.0)),
            members: serde_json::Map::new(),
        });
        assert!(f.within(&square(0.0, 10.0)));
        assert_eq!(f.num_points(), 1);
    }

    #[test]
    fn test_feature_collection_semantics() {
        let fc = Object::FeatureCollection(vec![
            Object::point(1.0, 1.0),
            Object::point(9.0, 9.0),
        ]);
        assert!(fc.within(&square(0.0, 10.0)));
        assert!(!fc.within(&square(0.0, 5.0))); // one member escapes
        assert!(fc.intersects(&square(0.0, 5.0))); // but one member is inside
    }

    #[test]
    fn test_multipolygon_rect() {
        let mp = Object::MultiPolygon(vec![
            Poly::from_rect(&Rect::new(0.0, 0.0, 1.0, 1.0)),
            Poly::from_rect(&Rect::new(5.0, 5.0, 6.0, 6.0)),
        ]);
        assert_eq!(mp.rect(), Rect::new(0.0, 0.0, 6.0, 6.0));
        assert_eq!(mp.num_points(), 8);
    }

    #[test]
    fn test_weight_and_points() {
        let p = Object::point(1.0, 2.0);
        assert_eq!(p.num_points(), 1);
        assert_eq!(p.weight(), 16);
    }
}

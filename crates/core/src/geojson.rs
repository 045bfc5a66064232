//! GeoJSON parsing and serialization for [`Object`].
//!
//! Supported types: Point, LineString, MultiLineString, Polygon,
//! MultiPolygon, Feature, FeatureCollection, plus the circle feature form
//! this database emits (`properties.type == "Circle"`). Feature members other
//! than `geometry` are retained verbatim so id-ful features round-trip.

use crate::error::{Error, Result};
use crate::geometry::{Point, Poly};
use crate::object::{Circle, Feature, GeoPoint, Object, DEFAULT_CIRCLE_STEPS};
use serde_json::{json, Map, Value};

/// Parse a GeoJSON document into an [`Object`].
pub fn parse(input: &str) -> Result<Object> {
    let value: Value = serde_json::from_str(input)
        .map_err(|_| Error::invalid_argument(truncate(input)))?;
    parse_value(&value)
}

fn truncate(s: &str) -> String {
    if s.len() > 64 {
        format!("{}...", &s[..64])
    } else {
        s.to_string()
    }
}

fn parse_value(value: &Value) -> Result<Object> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::invalid_argument("geojson must be an object"))?;
    let typ = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_argument("missing geojson type"))?;
    match typ {
        "Point" => {
            let pos = coords(obj)?;
            parse_position(pos)
        }
        "LineString" => Ok(Object::LineString(parse_line(coords(obj)?)?)),
        "MultiLineString" => {
            let lines = as_array(coords(obj)?)?
                .iter()
                .map(parse_line)
                .collect::<Result<Vec<_>>>()?;
            Ok(Object::MultiLineString(lines))
        }
        "Polygon" => Ok(Object::Polygon(parse_polygon(coords(obj)?)?)),
        "MultiPolygon" => {
            let polys = as_array(coords(obj)?)?
                .iter()
                .map(parse_polygon)
                .collect::<Result<Vec<_>>>()?;
            Ok(Object::MultiPolygon(polys))
        }
        "Feature" => parse_feature(obj),
        "FeatureCollection" => {
            let features = obj
                .get("features")
                .and_then(Value::as_array)
                .ok_or_else(|| Error::invalid_argument("missing features"))?;
            let objs = features
                .iter()
                .map(parse_value)
                .collect::<Result<Vec<_>>>()?;
            Ok(Object::FeatureCollection(objs))
        }
        other => Err(Error::invalid_argument(other)),
    }
}

fn coords<'a>(obj: &'a Map<String, Value>) -> Result<&'a Value> {
    obj.get("coordinates")
        .ok_or_else(|| Error::invalid_argument("missing coordinates"))
}

fn as_array(v: &Value) -> Result<&Vec<Value>> {
    v.as_array()
        .ok_or_else(|| Error::invalid_argument("expected array"))
}

fn parse_position(v: &Value) -> Result<Object> {
    let nums = as_array(v)?;
    if nums.len() < 2 {
        return Err(Error::invalid_argument("position needs two coordinates"));
    }
    let x = nums[0]
        .as_f64()
        .ok_or_else(|| Error::invalid_argument("coordinate must be a number"))?;
    let y = nums[1]
        .as_f64()
        .ok_or_else(|| Error::invalid_argument("coordinate must be a number"))?;
    let z = nums.get(2).and_then(Value::as_f64);
    Ok(Object::Point(GeoPoint {
        pos: Point::new(x, y),
        z,
    }))
}

fn parse_point(v: &Value) -> Result<Point> {
    match parse_position(v)? {
        Object::Point(p) => Ok(p.pos),
        _ => unreachable!(),
    }
}

fn parse_line(v: &Value) -> Result<Vec<Point>> {
    as_array(v)?.iter().map(parse_point).collect()
}

fn parse_polygon(v: &Value) -> Result<Poly> {
    let rings = as_array(v)?
        .iter()
        .map(parse_line)
        .collect::<Result<Vec<_>>>()?;
    let mut it = rings.into_iter();
    let exterior = it.next().unwrap_or_default();
    Ok(Poly::with_holes(exterior, it.collect()))
}

fn parse_feature(obj: &Map<String, Value>) -> Result<Object> {
    let geom_value = obj
        .get("geometry")
        .ok_or_else(|| Error::invalid_argument("missing geometry"))?;
    let geometry = parse_value(geom_value)?;

    let mut members = Map::new();
    for (k, v) in obj {
        if k != "type" && k != "geometry" {
            members.insert(k.clone(), v.clone());
        }
    }

    // circle feature form written by `to_json`
    if let (Object::Point(ref p), Some(props)) =
        (&geometry, members.get("properties").and_then(Value::as_object))
    {
        if props.get("type").and_then(Value::as_str) == Some("Circle") {
            if let Some(radius) = props.get("radius").and_then(Value::as_f64) {
                let steps = props
                    .get("steps")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(DEFAULT_CIRCLE_STEPS);
                return Ok(Object::Circle(Circle::new(p.pos, radius, steps)));
            }
        }
    }

    Ok(Object::Feature(Feature {
        geometry: Box::new(geometry),
        members,
    }))
}

/// Serialize an [`Object`] to its GeoJSON string.
pub fn to_json(obj: &Object) -> String {
    to_value(obj).to_string()
}

/// Serialize an [`Object`] to a `serde_json` value tree.
pub fn to_value(obj: &Object) -> Value {
    match obj {
        Object::Point(p) => {
            let coords = match p.z {
                Some(z) => json!([p.pos.x, p.pos.y, z]),
                None => json!([p.pos.x, p.pos.y]),
            };
            json!({"type": "Point", "coordinates": coords})
        }
        Object::Rect(r) => json!({
            "type": "Polygon",
            "coordinates": [closed_ring_coords(&r.ring())],
        }),
        Object::LineString(l) => json!({
            "type": "LineString",
            "coordinates": line_coords(l),
        }),
        Object::MultiLineString(ls) => json!({
            "type": "MultiLineString",
            "coordinates": ls.iter().map(|l| line_coords(l)).collect::<Vec<_>>(),
        }),
        Object::Polygon(p) => json!({
            "type": "Polygon",
            "coordinates": polygon_coords(p),
        }),
        Object::MultiPolygon(ps) => json!({
            "type": "MultiPolygon",
            "coordinates": ps.iter().map(polygon_coords).collect::<Vec<_>>(),
        }),
        Object::Circle(c) => json!({
            "type": "Feature",
            "geometry": {
                "type": "Point",
                "coordinates": [c.center().x, c.center().y],
            },
            "properties": {
                "type": "Circle",
                "radius": c.meters(),
                "steps": c.steps(),
            },
        }),
        Object::Feature(f) => {
            let mut map = Map::new();
            map.insert("type".into(), json!("Feature"));
            map.insert("geometry".into(), to_value(&f.geometry));
            for (k, v) in &f.members {
                map.insert(k.clone(), v.clone());
            }
            if !map.contains_key("properties") {
                map.insert("properties".into(), json!({}));
            }
            Value::Object(map)
        }
        Object::FeatureCollection(objs) => json!({
            "type": "FeatureCollection",
            "features": objs.iter().map(to_value).collect::<Vec<_>>(),
        }),
        Object::String(s) => json!(s),
    }
}

fn line_coords(line: &[Point]) -> Vec<Value> {
    line.iter().map(|p| json!([p.x, p.y])).collect()
}

fn closed_ring_coords(ring: &[Point]) -> Vec<Value> {
    let mut coords = line_coords(ring);
    if ring.len() >= 2 && ring.first() != ring.last() {
        coords.push(json!([ring[0].x, ring[0].y]));
    }
    coords
}

fn polygon_coords(p: &Poly) -> Vec<Vec<Value>> {
    let mut rings = vec![closed_ring_coords(&p.exterior)];
    for hole in &p.holes {
        rings.push(closed_ring_coords(hole));
    }
    rings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;

    #[test]
    fn test_parse_point() {
        let obj = parse(r#"{"type":"Point","coordinates":[-115,33]}"#).unwrap();
        assert_eq!(obj, Object::point(-115.0, 33.0));
        let obj = parse(r#"{"type":"Point","coordinates":[-115,33,400]}"#).unwrap();
        assert_eq!(obj.z(), Some(400.0));
    }

    #[test]
    fn test_parse_polygon_with_hole() {
        let src = r#"{"type":"Polygon","coordinates":[
            [[0,0],[10,0],[10,10],[0,10],[0,0]],
            [[4,4],[6,4],[6,6],[4,6],[4,4]]
        ]}"#;
        let obj = parse(src).unwrap();
        match &obj {
            Object::Polygon(p) => {
                assert_eq!(p.holes.len(), 1);
                assert!(p.contains_point(Point::new(1.0, 1.0)));
                assert!(!p.contains_point(Point::new(5.0, 5.0)));
            }
            other => panic!("expected polygon, got {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_line() {
        let src = r#"{"type":"LineString","coordinates":[[0.0,0.0],[5.0,5.0]]}"#;
        let obj = parse(src).unwrap();
        let again = parse(&to_json(&obj)).unwrap();
        assert_eq!(obj, again);
    }

    #[test]
    fn test_feature_members_round_trip() {
        let src = r#"{"type":"Feature","id":"truck1","geometry":{"type":"Point","coordinates":[1,2]},"properties":{"speed":55}}"#;
        let obj = parse(src).unwrap();
        let json = to_json(&obj);
        assert!(json.contains(r#""id":"truck1""#));
        assert!(json.contains(r#""speed":55"#));
        let again = parse(&json).unwrap();
        assert_eq!(obj, again);
    }

    #[test]
    fn test_circle_round_trip() {
        let circle = Object::Circle(Circle::new(Point::new(-115.0, 33.0), 5000.0, 64));
        let json = to_json(&circle);
        let again = parse(&json).unwrap();
        assert_eq!(circle, again);
    }

    #[test]
    fn test_rect_serializes_as_polygon() {
        let rect = Object::Rect(Rect::new(0.0, 0.0, 1.0, 1.0));
        let json = to_json(&rect);
        let again = parse(&json).unwrap();
        assert!(matches!(again, Object::Polygon(_)));
        assert!(again.within(&rect) && rect.within(&again));
    }

    #[test]
    fn test_feature_collection() {
        let src = r#"{"type":"FeatureCollection","features":[
            {"type":"Feature","geometry":{"type":"Point","coordinates":[1,1]},"properties":{}},
            {"type":"Feature","geometry":{"type":"Point","coordinates":[2,2]},"properties":{}}
        ]}"#;
        let obj = parse(src).unwrap();
        assert_eq!(obj.num_points(), 2);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("not json").is_err());
        assert!(parse(r#"{"type":"Nonsense"}"#).is_err());
        assert!(parse(r#"{"type":"Point"}"#).is_err());
    }
}

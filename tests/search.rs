//! Search behavior: WITHIN / INTERSECTS with expressions, NEARBY ordering,
//! SCAN cursors, SEARCH over string values, filters, and TEST.

mod common;

use common::{cmd, ids_of, must, render};
use meridian::{Error, Server, Value};

const POLY: &str = r#"{"type":"Polygon","coordinates":[[[-122.44126439094543,37.732906137107],[-122.43980526924135,37.732906137107],[-122.43980526924135,37.73421283683962],[-122.44126439094543,37.73421283683962],[-122.44126439094543,37.732906137107]]]}"#;
const POLY8: &str = r#"{"type":"Polygon","coordinates":[[[-122.4408378,37.7341129],[-122.4408378,37.733],[-122.44,37.733],[-122.44,37.7341129],[-122.4408378,37.7341129]],[[-122.44060993194579,37.73345766902749],[-122.44044363498686,37.73345766902749],[-122.44044363498686,37.73355524732416],[-122.44060993194579,37.73355524732416],[-122.44060993194579,37.73345766902749]],[[-122.44060724973677,37.7336888869566],[-122.4402102828026,37.7336888869566],[-122.4402102828026,37.7339752567853],[-122.44060724973677,37.7339752567853],[-122.44060724973677,37.7336888869566]]]}"#;
const POLY9: &str = r#"{"type":"Polygon","coordinates":[[[-122.44037926197052,37.73313523548048],[-122.44017541408539,37.73313523548048],[-122.44017541408539,37.73336857568778],[-122.44037926197052,37.73336857568778],[-122.44037926197052,37.73313523548048]]]}"#;
const LINE2: &str = r#"{"type":"Feature","properties":{},"geometry":{"type":"LineString","coordinates":[[-122.44110345840454,37.733383424585185],[-122.44110614061356,37.734043136878604]]}}"#;
const LINE3: &str = r#"{"type":"LineString","coordinates":[[-122.4408378,37.7341129],[-122.4408378,37.733]]}"#;

fn fixture_server() -> (tempfile::TempDir, std::sync::Arc<Server>) {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(dir.path()).unwrap();
    must(&server, &["SET", "mykey", "line2", "OBJECT", LINE2]);
    must(&server, &["SET", "mykey", "line3", "OBJECT", LINE3]);
    must(&server, &["SET", "mykey", "poly8", "OBJECT", POLY8]);
    must(&server, &["SET", "mykey", "poly9", "OBJECT", POLY9]);
    (dir, server)
}

#[test]
fn test_within_expressions() {
    let (_dir, server) = fixture_server();

    let reply = must(&server, &["WITHIN", "mykey", "IDS", "OBJECT", POLY8, "OR", "OBJECT", POLY]);
    assert_eq!(ids_of(&reply), vec!["line2", "line3", "poly8", "poly9"]);

    let reply = must(&server, &["WITHIN", "mykey", "IDS", "OBJECT", POLY8, "AND", "OBJECT", POLY]);
    assert_eq!(ids_of(&reply), vec!["line3", "poly8", "poly9"]);

    let reply = must(&server, &["WITHIN", "mykey", "IDS", "GET", "mykey", "line3"]);
    assert_eq!(ids_of(&reply), vec!["line3"]);

    let reply = must(&server, &[
        "WITHIN", "mykey", "IDS", "GET", "mykey", "poly8", "AND",
        "(", "OBJECT", POLY, "AND", "GET", "mykey", "line3", ")",
    ]);
    assert_eq!(ids_of(&reply), vec!["line3"]);

    let reply = must(&server, &[
        "WITHIN", "mykey", "IDS", "GET", "mykey", "poly8", "AND",
        "(", "OBJECT", POLY, "AND", "NOT", "GET", "mykey", "line3", ")",
    ]);
    assert_eq!(ids_of(&reply), vec!["line2", "poly8", "poly9"]);

    let reply = must(&server, &["WITHIN", "mykey", "IDS", "NOT", "GET", "mykey", "line3"]);
    assert_eq!(ids_of(&reply), vec!["line2", "poly8", "poly9"]);

    // error surface
    assert!(matches!(
        cmd(&server, &["WITHIN", "mykey", "IDS", "NOT", "GET", "mykey1", "line1"]),
        Err(Error::KeyNotFound)
    ));
    assert!(matches!(
        cmd(&server, &["WITHIN", "mykey", "IDS", "NOT", "GET", "mykey", "line1"]),
        Err(Error::IdNotFound)
    ));
}

#[test]
fn test_intersects_expressions() {
    let (_dir, server) = fixture_server();

    let reply = must(&server, &["INTERSECTS", "mykey", "IDS", "NOT", "OBJECT", POLY]);
    assert_eq!(ids_of(&reply), Vec::<String>::new());

    let reply = must(&server, &["INTERSECTS", "mykey", "IDS", "NOT", "NOT", "OBJECT", POLY]);
    assert_eq!(ids_of(&reply), vec!["line2", "line3", "poly8", "poly9"]);

    let reply = must(&server, &["INTERSECTS", "mykey", "IDS", "GET", "mykey", "line3"]);
    assert_eq!(ids_of(&reply), vec!["line3", "poly8"]);

    // mixed precedence keeps the flat OR grammar
    let reply = must(&server, &[
        "INTERSECTS", "mykey", "IDS", "GET", "mykey", "line3",
        "OR", "OBJECT", POLY8, "AND", "OBJECT", POLY,
    ]);
    assert_eq!(ids_of(&reply), vec!["line2", "line3", "poly8", "poly9"]);

    let reply = must(&server, &[
        "INTERSECTS", "mykey", "IDS", "OBJECT", POLY8, "AND", "OBJECT", POLY,
        "OR", "GET", "mykey", "line3",
    ]);
    assert_eq!(ids_of(&reply), vec!["line3", "poly8", "poly9"]);

    let reply = must(&server, &["TEST", "OBJECT", POLY9, "INTERSECTS", "NOT", "GET", "mykey", "line3"]);
    assert_eq!(render(&reply), "1");
}

#[test]
fn test_within_circle() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(dir.path()).unwrap();
    must(&server, &["SET", "mykey", "1", "POINT", "37.7335", "-122.4412"]);
    must(&server, &["SET", "mykey", "2", "POINT", "37.7335", "-122.44121"]);
    must(&server, &["SET", "mykey", "3", "OBJECT", LINE3]);
    must(&server, &["SET", "mykey", "6", "POINT", "-5", "5"]);

    let reply = must(&server, &["WITHIN", "mykey", "IDS", "CIRCLE", "37.7335", "-122.4412", "1000"]);
    assert_eq!(ids_of(&reply), vec!["1", "2", "3"]);
    let reply = must(&server, &["WITHIN", "mykey", "IDS", "CIRCLE", "37.7335", "-122.4412", "10"]);
    assert_eq!(ids_of(&reply), vec!["1", "2"]);
}

#[test]
fn test_nearby_ordering_and_radius() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(dir.path()).unwrap();
    // a line of points marching east, ~1km apart at this latitude
    for i in 0..10 {
        let lon = format!("{}", -115.0 + i as f64 * 0.011);
        let id = format!("p{}", i);
        must(&server, &["SET", "fleet", &id, "POINT", "33", &lon]);
    }

    // kNN order is strictly distance-ascending
    let reply = must(&server, &["NEARBY", "fleet", "IDS", "POINT", "33", "-115"]);
    let ids: Vec<String> = match &reply {
        Value::Array(parts) => parts[1].as_array().iter().map(render).collect(),
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(ids, (0..10).map(|i| format!("p{}", i)).collect::<Vec<_>>());

    // the radius cuts the set off
    let reply = must(&server, &["NEARBY", "fleet", "IDS", "POINT", "33", "-115", "2500"]);
    assert_eq!(ids_of(&reply), vec!["p0", "p1", "p2"]);

    // distances come back non-decreasing and in meters
    let reply = must(&server, &[
        "NEARBY", "fleet", "DISTANCE", "POINTS", "POINT", "33", "-115", "5000",
    ]);
    let mut last = 0.0f64;
    if let Value::Array(parts) = &reply {
        let items = parts[1].as_array();
        assert!(!items.is_empty());
        for item in items {
            let fields = item.as_array();
            // the nearest point sits at distance zero and carries no
            // distance element; every other item ends with one
            let dist: f64 = match fields.last() {
                Some(Value::Bulk(_)) => render(fields.last().unwrap()).parse().unwrap(),
                _ => 0.0,
            };
            assert!(dist >= last);
            last = dist;
        }
    }
    assert!(last > 3000.0 && last < 5000.0, "furthest {}", last);

    // LIMIT bounds the candidates
    let reply = must(&server, &["NEARBY", "fleet", "LIMIT", "4", "IDS", "POINT", "33", "-115"]);
    assert_eq!(ids_of(&reply).len(), 4);
}

#[test]
fn test_scan_cursor_resumability() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(dir.path()).unwrap();
    for i in 0..20 {
        let id = format!("id{:02}", i);
        must(&server, &["SET", "mykey", &id, "POINT", "1", "1"]);
    }

    let first = must(&server, &["SCAN", "mykey", "LIMIT", "7", "IDS"]);
    let (cursor, mut seen) = match &first {
        Value::Array(parts) => (
            parts[0].as_integer(),
            parts[1].as_array().iter().map(render).collect::<Vec<_>>(),
        ),
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(seen.len(), 7);
    assert!(cursor > 0, "expected a resumable cursor");

    let rest = must(&server, &[
        "SCAN", "mykey", "CURSOR", &cursor.to_string(), "LIMIT", "100", "IDS",
    ]);
    if let Value::Array(parts) = &rest {
        assert_eq!(parts[0].as_integer(), 0, "second page exhausts");
        seen.extend(parts[1].as_array().iter().map(render));
    }
    assert_eq!(seen.len(), 20);
    let expect: Vec<String> = (0..20).map(|i| format!("id{:02}", i)).collect();
    assert_eq!(seen, expect);
}

#[test]
fn test_scan_match_desc_and_count() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(dir.path()).unwrap();
    for id in ["truck1", "truck2", "car1", "car2"] {
        must(&server, &["SET", "mykey", id, "POINT", "1", "1"]);
    }

    let reply = must(&server, &["SCAN", "mykey", "MATCH", "truck*", "IDS"]);
    assert_eq!(ids_of(&reply), vec!["truck1", "truck2"]);

    let reply = must(&server, &["SCAN", "mykey", "DESC", "IDS"]);
    if let Value::Array(parts) = &reply {
        let ids: Vec<String> = parts[1].as_array().iter().map(render).collect();
        assert_eq!(ids, vec!["truck2", "truck1", "car2", "car1"]);
    }

    assert_eq!(render(&must(&server, &["SCAN", "mykey", "COUNT"])), "4");
    assert_eq!(render(&must(&server, &["SCAN", "nothere", "COUNT"])), "0");
}

#[test]
fn test_search_string_values() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(dir.path()).unwrap();
    must(&server, &["SET", "mykey", "b", "STRING", "banana"]);
    must(&server, &["SET", "mykey", "a", "STRING", "apple"]);
    must(&server, &["SET", "mykey", "c", "STRING", "cherry"]);
    must(&server, &["SET", "mykey", "p", "POINT", "1", "1"]);

    // ordered by value, points excluded
    let reply = must(&server, &["SEARCH", "mykey", "IDS"]);
    if let Value::Array(parts) = &reply {
        let ids: Vec<String> = parts[1].as_array().iter().map(render).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    // the pattern matches values, not ids
    let reply = must(&server, &["SEARCH", "mykey", "MATCH", "ban*", "IDS"]);
    assert_eq!(ids_of(&reply), vec!["b"]);
    let reply = must(&server, &["SEARCH", "mykey", "MATCH", "b", "IDS"]);
    assert_eq!(ids_of(&reply), Vec::<String>::new());
}

#[test]
fn test_where_filters() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(dir.path()).unwrap();
    for (id, f1) in [("1", "10"), ("2", "20"), ("3", "30"), ("4", "40")] {
        must(&server, &["SET", "mykey", id, "FIELD", "field1", f1, "POINT", "33", "-115"]);
    }
    must(&server, &["SET", "mykey", "5", "POINT", "33", "-115"]); // no fields

    let reply = must(&server, &["SCAN", "mykey", "WHERE", "field1", "15", "35", "IDS"]);
    assert_eq!(ids_of(&reply), vec!["2", "3"]);

    let reply = must(&server, &["SCAN", "mykey", "WHERE", "field1", "-inf", "15", "IDS"]);
    assert_eq!(ids_of(&reply), vec!["1", "5"]); // missing fields read as zero

    let reply = must(&server, &["SCAN", "mykey", "WHEREIN", "field1", "2", "10", "30", "IDS"]);
    assert_eq!(ids_of(&reply), vec!["1", "3"]);

    // pseudo-field z
    must(&server, &["SET", "mykey", "high", "POINT", "33", "-115", "400"]);
    let reply = must(&server, &["SCAN", "mykey", "WHERE", "z", "100", "inf", "IDS"]);
    assert_eq!(ids_of(&reply), vec!["high"]);
}

#[test]
fn test_sparse_sampling() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(dir.path()).unwrap();
    for i in 0..100 {
        let id = format!("p{}", i);
        let lon = format!("{}", (i % 10) as f64 / 10.0);
        let lat = format!("{}", (i / 10) as f64 / 10.0);
        must(&server, &["SET", "mykey", &id, "POINT", &lat, &lon]);
    }
    let reply = must(&server, &[
        "WITHIN", "mykey", "SPARSE", "2", "IDS", "BOUNDS", "-0.05", "-0.05", "0.95", "0.95",
    ]);
    let ids = ids_of(&reply);
    assert!(!ids.is_empty());
    assert!(ids.len() <= 16, "sparse 2 yields at most 16 samples, got {}", ids.len());
}

#[test]
fn test_clip_option() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(dir.path()).unwrap();
    must(&server, &[
        "SET", "mykey", "line", "OBJECT",
        r#"{"type":"LineString","coordinates":[[-10,5],[20,5]]}"#,
    ]);
    let reply = must(&server, &[
        "INTERSECTS", "mykey", "CLIP", "BOUNDS", "0", "0", "10", "10",
    ]);
    if let Value::Array(parts) = &reply {
        let items = parts[1].as_array();
        assert_eq!(items.len(), 1);
        let obj = render(&items[0].as_array()[1]);
        // the emitted object is clipped to the window
        assert!(obj.contains("[0.0,5.0]") || obj.contains("[0,5]"), "{}", obj);
        assert!(!obj.contains("-10"), "{}", obj);
    }
}

//! Token-driven parsing of area primitives and area expressions.
//!
//! The token vector comes straight off the command line: each primitive
//! consumes its fixed token count and parsing returns the remaining tokens.
//! Expression parsing handles parenthesis grouping and the NOT/AND/OR
//! keywords, building an [`AreaExpression`] with the same shape the flat
//! grammar has always produced (an AND keyword after an OR group splices an
//! AND node around the last child and later members keep joining the OR).

use crate::area::{AreaExpression, BinaryOp};
use meridian_core::error::{Error, Result};
use meridian_core::geometry::{Point, Rect};
use meridian_core::object::{Circle, Object, DEFAULT_CIRCLE_STEPS};
use meridian_core::{geohash, geojson, tiles};
use std::sync::Arc;

/// Collection lookup used by the `GET key id` primitive.
pub type ColLookup<'a> = dyn Fn(&str, &str) -> Result<Arc<Object>> + 'a;

fn next_token(args: &[String]) -> Result<(&[String], &str)> {
    match args.split_first() {
        Some((tok, rest)) if !tok.is_empty() => Ok((rest, tok)),
        _ => Err(Error::InvalidNumberOfArguments),
    }
}

fn parse_float(tok: &str) -> Result<f64> {
    tok.parse::<f64>()
        .map_err(|_| Error::invalid_argument(tok))
}

/// Parse one area primitive, starting at its type keyword.
pub fn parse_area<'a>(
    args: &'a [String],
    do_clip: bool,
    lookup: &ColLookup,
) -> Result<(&'a [String], Arc<Object>)> {
    let (rest, typ) = next_token(args)?;
    parse_area_typed(&typ.to_lowercase(), rest, do_clip, lookup)
}

fn parse_area_typed<'a>(
    typ: &str,
    args: &'a [String],
    do_clip: bool,
    lookup: &ColLookup,
) -> Result<(&'a [String], Arc<Object>)> {
    match typ {
        "point" => {
            let (args, slat) = next_token(args)?;
            let (args, slon) = next_token(args)?;
            let lat = parse_float(slat)?;
            let lon = parse_float(slon)?;
            Ok((args, Arc::new(Object::point(lon, lat))))
        }
        "circle" => {
            if do_clip {
                return Err(Error::invalid_argument("circle"));
            }
            let (args, slat) = next_token(args)?;
            let (args, slon) = next_token(args)?;
            let (args, smeters) = next_token(args)?;
            let lat = parse_float(slat)?;
            let lon = parse_float(slon)?;
            let meters = parse_float(smeters)?;
            if meters < 0.0 {
                return Err(Error::invalid_argument(smeters));
            }
            Ok((
                args,
                Arc::new(Object::Circle(Circle::new(
                    Point::new(lon, lat),
                    meters,
                    DEFAULT_CIRCLE_STEPS,
                ))),
            ))
        }
        "object" => {
            if do_clip {
                return Err(Error::invalid_argument("object"));
            }
            let (args, json) = next_token(args)?;
            Ok((args, Arc::new(geojson::parse(json)?)))
        }
        "bounds" => {
            let (args, sminlat) = next_token(args)?;
            let (args, sminlon) = next_token(args)?;
            let (args, smaxlat) = next_token(args)?;
            let (args, smaxlon) = next_token(args)?;
            let rect = Rect::new(
                parse_float(sminlon)?,
                parse_float(sminlat)?,
                parse_float(smaxlon)?,
                parse_float(smaxlat)?,
            );
            Ok((args, Arc::new(Object::Rect(rect))))
        }
        "hash" => {
            let (args, hash) = next_token(args)?;
            let (min_lat, min_lon, max_lat, max_lon) = geohash::bounding_box(hash);
            Ok((
                args,
                Arc::new(Object::Rect(Rect::new(min_lon, min_lat, max_lon, max_lat))),
            ))
        }
        "quadkey" => {
            let (args, key) = next_token(args)?;
            let (min_lat, min_lon, max_lat, max_lon) =
                tiles::quadkey_to_bounds(key).map_err(|_| Error::invalid_argument(key))?;
            Ok((
                args,
                Arc::new(Object::Rect(Rect::new(min_lon, min_lat, max_lon, max_lat))),
            ))
        }
        "tile" => {
            let (args, sx) = next_token(args)?;
            let (args, sy) = next_token(args)?;
            let (args, sz) = next_token(args)?;
            let x = sx
                .parse::<i64>()
                .map_err(|_| Error::invalid_argument(sx))?;
            let y = sy
                .parse::<i64>()
                .map_err(|_| Error::invalid_argument(sy))?;
            let z = sz
                .parse::<u64>()
                .map_err(|_| Error::invalid_argument(sz))?;
            let (min_lat, min_lon, max_lat, max_lon) = tiles::tile_to_bounds(x, y, z);
            Ok((
                args,
                Arc::new(Object::Rect(Rect::new(min_lon, min_lat, max_lon, max_lat))),
            ))
        }
        "get" => {
            if do_clip {
                return Err(Error::invalid_argument("get"));
            }
            let (args, key) = next_token(args)?;
            let (args, id) = next_token(args)?;
            Ok((args, lookup(key, id)?))
        }
        other => Err(Error::invalid_argument(other)),
    }
}

const AREA_TYPES: [&str; 8] = [
    "point", "circle", "object", "bounds", "hash", "quadkey", "tile", "get",
];

/// Parse a full area expression. Returns the remaining tokens, the
/// expression, and whether a missing BOUNDS keyword was retrofitted (the
/// caller then restores its default output mode).
///
/// The grammar is flat and mutation-driven, matching the behavior clients
/// depend on: a `)` leaves the just-closed group as the current expression,
/// an AND after an OR splices an AND node around the last member, and later
/// members keep joining the surrounding node.
pub fn parse_area_expression<'a>(
    args: &'a [String],
    do_clip: bool,
    lookup: &ColLookup,
    fix_missing_bounds: bool,
) -> Result<(&'a [String], AreaExpression, bool)> {
    // nodes live in an arena so group membership and the "current node"
    // pointer can alias the way the grammar requires
    struct Node {
        negate: bool,
        obj: Option<Arc<Object>>,
        op: BinaryOp,
        children: Vec<usize>,
    }
    fn push_node(arena: &mut Vec<Node>, node: Node) -> usize {
        arena.push(node);
        arena.len() - 1
    }
    fn attach_leaf(arena: &mut Vec<Node>, ae: &mut Option<usize>, negate: &mut bool, obj: Arc<Object>) {
        let leaf = push_node(
            arena,
            Node {
                negate: *negate,
                obj: Some(obj),
                op: BinaryOp::Noop,
                children: Vec::new(),
            },
        );
        *negate = false;
        match *ae {
            None => *ae = Some(leaf),
            Some(cur) => arena[cur].children.push(leaf),
        }
    }

    let mut arena: Vec<Node> = Vec::new();
    let mut ae: Option<usize> = None;
    let mut stack: Vec<usize> = Vec::new();
    let mut rest = args;
    let mut negate = false;
    let mut need_obj = false;
    let mut fixed_bounds = false;

    loop {
        let Some(tok) = rest.first() else { break };
        let ltok = tok.to_lowercase();
        match ltok.as_str() {
            "(" => {
                let group = push_node(
                    &mut arena,
                    Node {
                        negate,
                        obj: None,
                        op: BinaryOp::Noop,
                        children: Vec::new(),
                    },
                );
                negate = false;
                need_obj = false;
                if let Some(cur) = ae {
                    arena[cur].children.push(group);
                }
                ae = Some(group);
                stack.push(group);
                rest = &rest[1..];
            }
            ")" => {
                if need_obj {
                    return Err(Error::invalid_argument(")"));
                }
                let group = stack.pop().ok_or_else(|| Error::invalid_argument(")"))?;
                ae = Some(group);
                rest = &rest[1..];
            }
            "not" => {
                negate = !negate;
                need_obj = true;
                rest = &rest[1..];
            }
            "and" => {
                if need_obj {
                    return Err(Error::invalid_argument("and"));
                }
                need_obj = true;
                let Some(cur) = ae else {
                    return Err(Error::invalid_argument("and"));
                };
                if arena[cur].obj.is_none() {
                    match arena[cur].op {
                        BinaryOp::Or => {
                            // wrap the last OR member so the upcoming object
                            // joins it under an AND
                            if arena[cur].children.len() < 2 {
                                return Err(Error::InvalidNumberOfArguments);
                            }
                            let last = arena[cur].children.pop().expect("checked length");
                            let wrapper = push_node(
                                &mut arena,
                                Node {
                                    negate: false,
                                    obj: None,
                                    op: BinaryOp::And,
                                    children: vec![last],
                                },
                            );
                            arena[cur].children.push(wrapper);
                        }
                        BinaryOp::Noop => arena[cur].op = BinaryOp::And,
                        BinaryOp::And => {}
                    }
                } else {
                    let wrapper = push_node(
                        &mut arena,
                        Node {
                            negate: false,
                            obj: None,
                            op: BinaryOp::And,
                            children: vec![cur],
                        },
                    );
                    ae = Some(wrapper);
                }
                rest = &rest[1..];
            }
            "or" => {
                if need_obj {
                    return Err(Error::invalid_argument("or"));
                }
                need_obj = true;
                let Some(cur) = ae else {
                    return Err(Error::invalid_argument("or"));
                };
                if arena[cur].obj.is_none() {
                    match arena[cur].op {
                        BinaryOp::And => {
                            if arena[cur].children.len() < 2 {
                                return Err(Error::InvalidNumberOfArguments);
                            }
                            let wrapper = push_node(
                                &mut arena,
                                Node {
                                    negate: false,
                                    obj: None,
                                    op: BinaryOp::Or,
                                    children: vec![cur],
                                },
                            );
                            ae = Some(wrapper);
                        }
                        BinaryOp::Noop => arena[cur].op = BinaryOp::Or,
                        BinaryOp::Or => {}
                    }
                } else {
                    let wrapper = push_node(
                        &mut arena,
                        Node {
                            negate: false,
                            obj: None,
                            op: BinaryOp::Or,
                            children: vec![cur],
                        },
                    );
                    ae = Some(wrapper);
                }
                rest = &rest[1..];
            }
            typ if AREA_TYPES.contains(&typ) => {
                let (next_rest, obj) = parse_area_typed(typ, &rest[1..], do_clip, lookup)?;
                attach_leaf(&mut arena, &mut ae, &mut negate, obj);
                need_obj = false;
                rest = next_rest;
            }
            other => {
                if fix_missing_bounds && other.parse::<f64>().is_ok() {
                    // the output mode was probably omitted and these are the
                    // search bounds; retrofit the BOUNDS keyword
                    let (next_rest, obj) = parse_area_typed("bounds", rest, do_clip, lookup)?;
                    attach_leaf(&mut arena, &mut ae, &mut negate, obj);
                    need_obj = false;
                    fixed_bounds = true;
                    rest = next_rest;
                    continue;
                }
                break;
            }
        }
    }

    let Some(root) = ae else {
        return Err(Error::InvalidNumberOfArguments);
    };
    if !stack.is_empty()
        || need_obj
        || (arena[root].obj.is_none() && arena[root].children.is_empty())
    {
        return Err(Error::InvalidNumberOfArguments);
    }

    fn materialize(arena: &[Node], idx: usize) -> AreaExpression {
        let node = &arena[idx];
        match &node.obj {
            Some(obj) => {
                let mut leaf = AreaExpression::from_object_arc(obj.clone());
                leaf.negate = node.negate;
                leaf
            }
            None => {
                let children = node
                    .children
                    .iter()
                    .map(|&child| materialize(arena, child))
                    .collect();
                AreaExpression::node(node.negate, node.op, children)
            }
        }
    }
    Ok((rest, materialize(&arena, root), fixed_bounds))
}

/// Parse the NEARBY target: `POINT lat lon [meters]`. The radius is optional
/// for NEARBY; absent means unbounded.
pub fn parse_nearby_area(args: &[String]) -> Result<(&[String], AreaExpression)> {
    let (rest, typ) = next_token(args)?;
    if typ.to_lowercase() != "point" {
        return Err(Error::invalid_argument(typ));
    }
    let (rest, slat) = next_token(rest)?;
    let (mut rest, slon) = next_token(rest)?;
    let lat = parse_float(slat)?;
    let lon = parse_float(slon)?;
    let mut meters = -1.0;
    if let Some(tok) = rest.first() {
        if let Ok(m) = tok.parse::<f64>() {
            if m < 0.0 {
                return Err(Error::invalid_argument(tok));
            }
            meters = m;
            rest = &rest[1..];
        }
    }
    let circle = Circle::new(Point::new(lon, lat), meters, DEFAULT_CIRCLE_STEPS);
    Ok((rest, AreaExpression::from_object(Object::Circle(circle))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    fn no_lookup(_: &str, _: &str) -> Result<Arc<Object>> {
        Err(Error::KeyNotFound)
    }

    #[test]
    fn test_parse_point() {
        let args = toks("POINT 33 -115 trailing");
        let (rest, obj) = parse_area(&args, false, &no_lookup).unwrap();
        assert_eq!(*obj, Object::point(-115.0, 33.0));
        assert_eq!(rest, &["trailing".to_string()][..]);
    }

    #[test]
    fn test_parse_bounds_and_tile() {
        let args = toks("BOUNDS 10 20 30 40");
        let (_, obj) = parse_area(&args, false, &no_lookup).unwrap();
        assert_eq!(*obj, Object::Rect(Rect::new(20.0, 10.0, 40.0, 30.0)));

        let args = toks("TILE 0 0 1");
        let (_, obj) = parse_area(&args, false, &no_lookup).unwrap();
        let rect = obj.rect();
        assert_eq!(rect.min.x, -180.0);
        assert_eq!(rect.max.x, 0.0);
    }

    #[test]
    fn test_parse_hash() {
        let args = toks("HASH 9my5xp7");
        let (_, obj) = parse_area(&args, false, &no_lookup).unwrap();
        assert!(obj.rect().contains_point(Point::new(-115.0, 33.0)));
    }

    #[test]
    fn test_parse_get_uses_lookup() {
        let stored = Arc::new(Object::point(1.0, 2.0));
        let stored2 = stored.clone();
        let lookup = move |key: &str, id: &str| -> Result<Arc<Object>> {
            if key == "fleet" && id == "truck1" {
                Ok(stored2.clone())
            } else if key == "fleet" {
                Err(Error::IdNotFound)
            } else {
                Err(Error::KeyNotFound)
            }
        };
        let args = toks("GET fleet truck1");
        let (_, obj) = parse_area(&args, false, &lookup).unwrap();
        assert_eq!(obj, stored);
        let args = toks("GET nope x");
        assert!(matches!(
            parse_area(&args, false, &lookup),
            Err(Error::KeyNotFound)
        ));
        let args = toks("GET fleet x");
        assert!(matches!(
            parse_area(&args, false, &lookup),
            Err(Error::IdNotFound)
        ));
    }

    #[test]
    fn test_missing_tokens() {
        let args = toks("POINT 33");
        assert!(matches!(
            parse_area(&args, false, &no_lookup),
            Err(Error::InvalidNumberOfArguments)
        ));
        let args = toks("CIRCLE 33 -115 -5");
        assert!(parse_area(&args, false, &no_lookup).is_err());
    }

    #[test]
    fn test_expression_simple_or() {
        let args = toks("POINT 0 0 OR POINT 10 10");
        let (rest, expr, fixed) =
            parse_area_expression(&args, false, &no_lookup, false).unwrap();
        assert!(rest.is_empty());
        assert!(!fixed);
        assert!(expr.is_compound());
        assert!(expr.intersects(&Object::point(0.0, 0.0)));
        assert!(expr.intersects(&Object::point(10.0, 10.0)));
        assert!(!expr.intersects(&Object::point(5.0, 5.0)));
    }

    #[test]
    fn test_expression_not() {
        let args = toks("NOT BOUNDS 0 0 10 10");
        let (_, expr, _) = parse_area_expression(&args, false, &no_lookup, false).unwrap();
        assert!(!expr.contains(&Object::point(5.0, 5.0)));
        assert!(expr.contains(&Object::point(50.0, 50.0)));
    }

    #[test]
    fn test_expression_and_after_or_splices() {
        // "A or B and C": the AND wraps the last OR member, later members
        // keep joining the OR node
        let args = toks("BOUNDS 0 0 10 10 OR BOUNDS 20 20 30 30 AND BOUNDS 0 0 90 90");
        let (_, expr, _) = parse_area_expression(&args, false, &no_lookup, false).unwrap();
        // any point in the last (big) bounds matches through the OR
        assert!(expr.contains(&Object::point(50.0, 50.0)));
        // a point in A matches
        assert!(expr.contains(&Object::point(5.0, 5.0)));
    }

    #[test]
    fn test_expression_parens() {
        let args = toks("BOUNDS 0 0 10 10 AND ( BOUNDS 0 0 5 5 OR BOUNDS 6 6 9 9 )");
        let (_, expr, _) = parse_area_expression(&args, false, &no_lookup, false).unwrap();
        assert!(expr.contains(&Object::point(2.0, 2.0)));
        assert!(expr.contains(&Object::point(7.0, 7.0)));
        assert!(!expr.contains(&Object::point(5.5, 5.5)));
    }

    #[test]
    fn test_expression_errors() {
        for bad in [
            "AND POINT 0 0",
            "POINT 0 0 AND",
            "NOT",
            "( POINT 0 0",
            "POINT 0 0 )",
            "",
        ] {
            let args = toks(bad);
            assert!(
                parse_area_expression(&args, false, &no_lookup, false).is_err(),
                "should fail: {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_fix_missing_bounds() {
        let args = toks("30 -120 40 -100");
        let (rest, expr, fixed) =
            parse_area_expression(&args, false, &no_lookup, true).unwrap();
        assert!(fixed);
        assert!(rest.is_empty());
        assert!(expr.contains(&Object::point(-110.0, 35.0)));
        // without the fix flag the numeric token ends the expression
        assert!(parse_area_expression(&args, false, &no_lookup, false).is_err());
    }

    #[test]
    fn test_parse_nearby() {
        let args = toks("POINT 33 -115 1000");
        let (rest, expr) = parse_nearby_area(&args).unwrap();
        assert!(rest.is_empty());
        match expr.obj().map(|o| o.as_ref()) {
            Some(Object::Circle(c)) => {
                assert_eq!(c.meters(), 1000.0);
                assert_eq!(c.center(), Point::new(-115.0, 33.0));
            }
            other => panic!("expected circle, got {:?}", other),
        }
        // radius is optional
        let args = toks("POINT 33 -115");
        let (_, expr) = parse_nearby_area(&args).unwrap();
        match expr.obj().map(|o| o.as_ref()) {
            Some(Object::Circle(c)) => assert_eq!(c.meters(), -1.0),
            other => panic!("expected circle, got {:?}", other),
        }
    }
}

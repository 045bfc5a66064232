//! WITHIN, INTERSECTS, NEARBY, and the TEST command.

use crate::msg::{tokenval, Message, OutputFormat};
use crate::scanner::{IterCursor, OutputKind, ScanOpts, ScanParams, Scanner};
use crate::server::{txn_to_err, Db, Server};
use meridian_collection::{parse_area_expression, parse_nearby_area, Collection};
use meridian_core::error::{Error, Result};
use meridian_core::object::Circle;
use meridian_core::{clip, dist, geojson, Object};
use meridian_txn::Status;
use meridian_wire::Value;
use std::sync::Arc;
use std::time::Instant;

impl Server {
    pub(crate) fn cmd_within_or_intersects(
        &self,
        db: &Db,
        msg: &Message,
        status: &Status,
        start: Instant,
        within: bool,
    ) -> Result<Value> {
        let (rest, mut t) = self.parse_base_tokens(&msg.args[1..])?;
        let fix_missing_bounds = t.output == OutputKind::Bounds;
        let lookup = |key: &str, id: &str| self.lookup_obj(db, key, id);
        let (rest, expr, fixed_bounds) =
            parse_area_expression(rest, t.clip, &lookup, fix_missing_bounds)?;
        if fixed_bounds {
            // the numeric tokens were the bounds, not an output selector
            t.output = OutputKind::Objects;
        }
        if !rest.is_empty() {
            return Err(Error::InvalidNumberOfArguments);
        }

        let col = self.get_col(db, &t.key);
        let cursor = IterCursor::new(t.cursor);
        let mut sc = Scanner::new(
            col,
            ScanOpts {
                output: t.output,
                precision: t.precision,
                glob_pattern: t.glob.clone(),
                match_values: false,
                limits: t.limits,
                wheres: t.wheres,
                whereins: t.whereins,
                whereevals: t.whereevals,
                nofields: t.nofields,
            },
            &cursor,
            msg.output,
        );
        sc.write_head();
        if let Some(col) = col {
            let clip_window: Option<&Arc<Object>> = if t.clip { expr.obj() } else { None };
            let result = if within {
                col.within_expr(&expr, t.sparse, Some(&cursor), status, &mut |id, obj, fields| {
                    if self.has_expired(db, &t.key, id) {
                        return true;
                    }
                    sc.write_object(ScanParams::new(id, obj, fields))
                })
            } else {
                col.intersects_expr(&expr, t.sparse, Some(&cursor), status, &mut |id,
                                                                                  obj,
                                                                                  fields| {
                    if self.has_expired(db, &t.key, id) {
                        return true;
                    }
                    let mut params = ScanParams::new(id, obj, fields);
                    params.clip_obj = clip_window.map(|w| w.as_ref());
                    sc.write_object(params)
                })
            };
            result.map_err(txn_to_err)?;
        }
        if let Some(err) = sc.err.take() {
            return Err(err);
        }
        sc.write_foot();
        Ok(sc.into_value(msg.output, start))
    }

    pub(crate) fn cmd_nearby(
        &self,
        db: &Db,
        msg: &Message,
        status: &Status,
        start: Instant,
    ) -> Result<Value> {
        let (rest, t) = self.parse_base_tokens(&msg.args[1..])?;
        let (rest, expr) = parse_nearby_area(rest)?;
        if !rest.is_empty() {
            return Err(Error::InvalidNumberOfArguments);
        }
        let target = expr.obj().expect("nearby area is always a leaf").clone();
        let Object::Circle(circle) = target.as_ref() else {
            return Err(Error::invalid_argument("nearby requires a point target"));
        };

        let col = self.get_col(db, &t.key);
        let cursor = IterCursor::new(t.cursor);
        let mut sc = Scanner::new(
            col,
            ScanOpts {
                output: t.output,
                precision: t.precision,
                glob_pattern: t.glob.clone(),
                match_values: false,
                limits: t.limits,
                wheres: t.wheres,
                whereins: t.whereins,
                whereevals: t.whereevals,
                nofields: t.nofields,
            },
            &cursor,
            msg.output,
        );
        sc.write_head();
        if let Some(col) = col {
            self.nearest_neighbors(
                db, col, &t.key, t.distance, &target, circle, &cursor, status, &mut sc,
            )?;
        }
        if let Some(err) = sc.err.take() {
            return Err(err);
        }
        sc.write_foot();
        Ok(sc.into_value(msg.output, start))
    }

    /// Collect a bounded candidate set from the kNN traversal, then sort so
    /// the final order is strictly distance-ascending.
    #[allow(clippy::too_many_arguments)]
    fn nearest_neighbors(
        &self,
        db: &Db,
        col: &Collection,
        key: &str,
        with_distance: bool,
        target: &Arc<Object>,
        circle: &Circle,
        cursor: &IterCursor,
        status: &Status,
        sc: &mut Scanner,
    ) -> Result<()> {
        let max_dist = if circle.meters() > 0.0 {
            circle.meters()
        } else {
            0.0
        };
        let limit = sc.matched_limit();
        let mut items: Vec<(String, Arc<Object>, Vec<f64>, f64)> = Vec::new();
        col.nearby(target, Some(cursor), status, &mut |id, obj, fields, _| {
            if self.has_expired(db, key, id) {
                return true;
            }
            let (ok, keep_going) = sc.test_object(id, obj, fields);
            if sc.err.is_some() {
                return false;
            }
            if !ok {
                return true;
            }
            let meters = dist::distance_meters(circle.center(), obj.center());
            if max_dist > 0.0 && meters > max_dist {
                return false;
            }
            items.push((id.to_string(), obj.clone(), fields.to_vec(), meters));
            if !keep_going {
                return false;
            }
            (items.len() as u64) < limit
        })
        .map_err(txn_to_err)?;

        items.sort_by(|a, b| a.3.total_cmp(&b.3));
        for (id, obj, fields, meters) in &items {
            let mut params = ScanParams::new(id, obj, fields);
            params.skip_testing = true;
            if with_distance {
                params.distance = *meters;
            }
            if !sc.write_object(params) {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn cmd_test(&self, db: &Db, msg: &Message, start: Instant) -> Result<Value> {
        let args = &msg.args[1..];
        let lookup = |key: &str, id: &str| self.lookup_obj(db, key, id);
        let (rest, area1, _) = parse_area_expression(args, false, &lookup, false)?;
        let (rest, test) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
        let test = test.to_lowercase();
        if test != "within" && test != "intersects" {
            return Err(Error::invalid_argument(test));
        }
        let mut rest = rest;
        let mut do_clip = false;
        if let Some((r, tok)) = tokenval(rest) {
            if tok.eq_ignore_ascii_case("clip") {
                if test != "intersects" {
                    return Err(Error::invalid_argument(tok));
                }
                do_clip = true;
                rest = r;
            }
        }
        let (rest, area2, _) = parse_area_expression(rest, do_clip, &lookup, false)?;
        if do_clip && (area1.is_compound() || area2.is_compound()) {
            return Err(Error::invalid_argument("clip"));
        }
        if !rest.is_empty() {
            return Err(Error::InvalidNumberOfArguments);
        }

        let mut clipped: Option<Object> = None;
        let result = if test == "within" {
            area1.within_expr(&area2)
        } else {
            let hit = area1.intersects_expr(&area2);
            if hit && do_clip {
                let obj1 = area1.obj().expect("checked not compound");
                let obj2 = area2.obj().expect("checked not compound");
                clipped = Some(clip::clip(obj1, obj2));
            }
            hit
        };

        Ok(match msg.output {
            OutputFormat::Json => {
                let mut extra = format!("\"result\":{}", result);
                if let Some(obj) = &clipped {
                    extra.push_str(&format!(",\"object\":{}", geojson::to_json(obj)));
                }
                crate::msg::json_ok_with(&extra, start)
            }
            OutputFormat::Resp => {
                let result = Value::Integer(result as i64);
                match clipped {
                    Some(obj) => Value::Array(vec![
                        result,
                        Value::from_str(geojson::to_json(&obj)),
                    ]),
                    None => result,
                }
            }
        })
    }
}

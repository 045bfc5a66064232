//! Single-item write and read commands: SET, FSET, DEL, PDEL, DROP,
//! RENAME/RENAMENX, EXPIRE, PERSIST, TTL, GET, KEYS, STATS, BOUNDS, TYPE,
//! FLUSHDB.

use crate::msg::{ok_message, tokenval, Message, OutputFormat};
use crate::scanner::fmt_float;
use crate::server::{Db, Server};
use meridian_collection::Collection;
use meridian_core::error::{Error, Result};
use meridian_core::geometry::{Point, Rect};
use meridian_core::object::GeoPoint;
use meridian_core::{geohash, geojson, glob, Object};
use meridian_txn::Status;
use meridian_wire::{json_string, Value};
use std::time::{Duration, Instant, SystemTime};

/// Field names with this prefix are reserved for internal use.
fn is_reserved_field_name(name: &str) -> bool {
    name.starts_with('_')
}

struct SetArgs {
    key: String,
    id: String,
    fields: Vec<String>,
    values: Vec<f64>,
    xx: bool,
    nx: bool,
    ex: Option<f64>,
    obj: Object,
}

fn parse_set_args(args: &[String]) -> Result<SetArgs> {
    let (mut rest, key) = tokenval(args).ok_or(Error::InvalidNumberOfArguments)?;
    let (r, id) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
    rest = r;
    if key.is_empty() || id.is_empty() {
        return Err(Error::InvalidNumberOfArguments);
    }
    let key = key.to_string();
    let id = id.to_string();

    let mut fields = Vec::new();
    let mut values = Vec::new();
    let mut xx = false;
    let mut nx = false;
    let mut ex: Option<f64> = None;

    let obj = loop {
        let (r, tok) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
        rest = r;
        match tok.to_lowercase().as_str() {
            "field" => {
                let (r, name) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
                let (r, sval) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                rest = r;
                if is_reserved_field_name(name) {
                    return Err(Error::invalid_argument(name));
                }
                let value = sval
                    .parse::<f64>()
                    .map_err(|_| Error::invalid_argument(sval))?;
                fields.push(name.to_string());
                values.push(value);
            }
            "ex" => {
                if ex.is_some() {
                    return Err(Error::invalid_argument(tok));
                }
                let (r, sval) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
                rest = r;
                let secs = sval
                    .parse::<f64>()
                    .map_err(|_| Error::invalid_argument(sval))?;
                ex = Some(secs);
            }
            "xx" => {
                if nx {
                    return Err(Error::invalid_argument(tok));
                }
                xx = true;
            }
            "nx" => {
                if xx {
                    return Err(Error::invalid_argument(tok));
                }
                nx = true;
            }
            "point" => {
                let (r, slat) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
                let (r, slon) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                rest = r;
                let lat = slat
                    .parse::<f64>()
                    .map_err(|_| Error::invalid_argument(slat))?;
                let lon = slon
                    .parse::<f64>()
                    .map_err(|_| Error::invalid_argument(slon))?;
                let mut z = None;
                if let Some((r, sz)) = tokenval(rest) {
                    z = Some(
                        sz.parse::<f64>()
                            .map_err(|_| Error::invalid_argument(sz))?,
                    );
                    rest = r;
                }
                break Object::Point(GeoPoint {
                    pos: Point::new(lon, lat),
                    z,
                });
            }
            "object" => {
                let (r, json) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
                rest = r;
                break geojson::parse(json)?;
            }
            "bounds" => {
                let mut nums = [0f64; 4];
                for slot in nums.iter_mut() {
                    let (r, sval) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
                    rest = r;
                    *slot = sval
                        .parse::<f64>()
                        .map_err(|_| Error::invalid_argument(sval))?;
                }
                break Object::Rect(Rect::new(nums[1], nums[0], nums[3], nums[2]));
            }
            "hash" => {
                let (r, shash) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
                rest = r;
                let (min_lat, min_lon, max_lat, max_lon) = geohash::bounding_box(shash);
                break Object::point((min_lon + max_lon) / 2.0, (min_lat + max_lat) / 2.0);
            }
            "string" => {
                let (r, sval) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
                rest = r;
                break Object::String(sval.to_string());
            }
            other => return Err(Error::invalid_argument(other)),
        }
    };
    if !rest.is_empty() {
        return Err(Error::InvalidNumberOfArguments);
    }
    Ok(SetArgs {
        key,
        id,
        fields,
        values,
        xx,
        nx,
        ex,
        obj,
    })
}

/// Order an item's nonzero fields by name, as `[name, value, ...]` pairs.
pub(crate) fn ordered_fields(col: &Collection, fields: &[f64]) -> Vec<(String, f64)> {
    let mut out = Vec::new();
    for name in col.field_arr() {
        let idx = col.field_map()[name];
        let value = fields.get(idx).copied().unwrap_or(0.0);
        if value != 0.0 {
            out.push((name.clone(), value));
        }
    }
    out
}

fn fields_resp_array(pairs: &[(String, f64)]) -> Value {
    let mut vals = Vec::with_capacity(pairs.len() * 2);
    for (name, value) in pairs {
        vals.push(Value::from_str(name.clone()));
        vals.push(Value::from_str(fmt_float(*value)));
    }
    Value::Array(vals)
}

impl Server {
    pub(crate) fn cmd_set(&self, db: &mut Db, msg: &Message) -> Result<(Value, bool)> {
        let start = Instant::now();
        let args = parse_set_args(&msg.args[1..])?;

        if !db.cols.contains_key(&args.key) {
            if args.xx {
                return set_cond_failed(msg, false);
            }
            db.cols.insert(args.key.clone(), Collection::new());
        }
        if args.xx || args.nx {
            let exists = db.cols[&args.key].get(&args.id).is_some()
                && !self.has_expired(db, &args.key, &args.id);
            if (args.nx && exists) || (args.xx && !exists) {
                self.drop_col_if_empty(db, &args.key);
                return set_cond_failed(msg, args.nx);
            }
        }
        db.expires.clear(&args.key, &args.id);
        let col = db.cols.get_mut(&args.key).expect("created above");
        col.set(&args.id, args.obj, &args.fields, &args.values);
        if let Some(secs) = args.ex {
            db.expires.set(
                &args.key,
                &args.id,
                SystemTime::now() + Duration::from_secs_f64(secs.max(0.0)),
            );
        }
        Ok((ok_message(msg, start), true))
    }

    pub(crate) fn cmd_fset(&self, db: &mut Db, msg: &Message) -> Result<(Value, bool)> {
        let start = Instant::now();
        let args = &msg.args[1..];
        let (rest, key) = tokenval(args).ok_or(Error::InvalidNumberOfArguments)?;
        let (mut rest, id) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
        let mut xx = false;
        if let Some((r, tok)) = tokenval(rest) {
            if tok.eq_ignore_ascii_case("xx") {
                xx = true;
                rest = r;
            }
        }
        let mut fields = Vec::new();
        let mut values = Vec::new();
        while !rest.is_empty() {
            let (r, name) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
            let (r, sval) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
            rest = r;
            if is_reserved_field_name(name) {
                return Err(Error::invalid_argument(name));
            }
            fields.push(name.to_string());
            values.push(
                sval.parse::<f64>()
                    .map_err(|_| Error::invalid_argument(sval))?,
            );
        }
        if fields.is_empty() {
            return Err(Error::InvalidNumberOfArguments);
        }

        let expired = self.has_expired(db, key, id);
        let updated = match db.cols.get_mut(key) {
            Some(col) if !expired => match col.set_fields(id, &fields, &values) {
                Some((_, _, updated)) => Some(updated),
                None => None,
            },
            _ => None,
        };
        match updated {
            Some(count) => {
                let value = match msg.output {
                    OutputFormat::Json => crate::msg::json_ok_with("", start),
                    OutputFormat::Resp => Value::Integer(count as i64),
                };
                Ok((value, count > 0))
            }
            None if xx => Ok((Value::Integer(0), false)),
            None => Err(Error::IdNotFound),
        }
    }

    pub(crate) fn cmd_del(&self, db: &mut Db, msg: &Message) -> Result<(Value, bool)> {
        let start = Instant::now();
        if msg.args.len() != 3 {
            return Err(Error::InvalidNumberOfArguments);
        }
        let (key, id) = (&msg.args[1], &msg.args[2]);
        let expired = self.has_expired(db, key, id);
        let deleted = match db.cols.get_mut(key.as_str()) {
            Some(col) => col.delete(id).is_some() && !expired,
            None => false,
        };
        db.expires.clear(key, id);
        self.drop_col_if_empty(db, key);
        let value = match msg.output {
            OutputFormat::Json => ok_message(msg, start),
            OutputFormat::Resp => Value::Integer(deleted as i64),
        };
        Ok((value, deleted))
    }

    pub(crate) fn cmd_pdel(&self, db: &mut Db, msg: &Message) -> Result<(Value, bool)> {
        let start = Instant::now();
        if msg.args.len() != 3 {
            return Err(Error::InvalidNumberOfArguments);
        }
        let (key, pattern) = (&msg.args[1], &msg.args[2]);
        let mut doomed = Vec::new();
        if let Some(col) = db.cols.get(key.as_str()) {
            let status = Status::background();
            col.scan(false, None, &status, &mut |id, _, _| {
                if glob::matches(pattern, id) {
                    doomed.push((id.to_string(), self.has_expired(db, key, id)));
                }
                true
            })
            .expect("background status never aborts");
        }
        let mut count = 0i64;
        if let Some(col) = db.cols.get_mut(key.as_str()) {
            for (id, expired) in &doomed {
                if col.delete(id).is_some() && !expired {
                    count += 1;
                }
                db.expires.clear(key, id);
            }
        }
        self.drop_col_if_empty(db, key);
        let value = match msg.output {
            OutputFormat::Json => ok_message(msg, start),
            OutputFormat::Resp => Value::Integer(count),
        };
        Ok((value, count > 0))
    }

    pub(crate) fn cmd_drop(&self, db: &mut Db, msg: &Message) -> Result<(Value, bool)> {
        let start = Instant::now();
        if msg.args.len() != 2 {
            return Err(Error::InvalidNumberOfArguments);
        }
        let key = &msg.args[1];
        let existed = db.cols.remove(key.as_str()).is_some();
        db.expires.clear_key(key);
        let value = match msg.output {
            OutputFormat::Json => ok_message(msg, start),
            OutputFormat::Resp => Value::Integer(existed as i64),
        };
        Ok((value, existed))
    }

    pub(crate) fn cmd_rename(&self, db: &mut Db, msg: &Message, nx: bool) -> Result<(Value, bool)> {
        let start = Instant::now();
        if msg.args.len() != 3 {
            return Err(Error::InvalidNumberOfArguments);
        }
        let (key, newkey) = (&msg.args[1], &msg.args[2]);
        if !db.cols.contains_key(key.as_str()) {
            return Err(Error::KeyNotFound);
        }
        if nx && db.cols.contains_key(newkey.as_str()) {
            let value = match msg.output {
                OutputFormat::Json => ok_message(msg, start),
                OutputFormat::Resp => Value::Integer(0),
            };
            return Ok((value, false));
        }
        let col = db.cols.remove(key.as_str()).expect("checked above");
        db.cols.insert(newkey.to_string(), col);
        // expiries do not transfer: renamed items become persistent
        db.expires.clear_key(key);
        db.expires.clear_key(newkey);
        let value = match msg.output {
            OutputFormat::Json => ok_message(msg, start),
            OutputFormat::Resp => {
                if nx {
                    Value::Integer(1)
                } else {
                    Value::Simple("OK".into())
                }
            }
        };
        Ok((value, true))
    }

    pub(crate) fn cmd_expire(&self, db: &mut Db, msg: &Message) -> Result<(Value, bool)> {
        let start = Instant::now();
        if msg.args.len() != 4 {
            return Err(Error::InvalidNumberOfArguments);
        }
        let (key, id, ssecs) = (&msg.args[1], &msg.args[2], &msg.args[3]);
        let secs = ssecs
            .parse::<f64>()
            .map_err(|_| Error::invalid_argument(ssecs))?;
        let alive = db
            .cols
            .get(key.as_str())
            .map_or(false, |col| col.get(id).is_some())
            && !self.has_expired(db, key, id);
        if alive {
            db.expires.set(
                key,
                id,
                SystemTime::now() + Duration::from_secs_f64(secs.max(0.0)),
            );
        }
        let value = match msg.output {
            OutputFormat::Json => ok_message(msg, start),
            OutputFormat::Resp => Value::Integer(alive as i64),
        };
        Ok((value, alive))
    }

    pub(crate) fn cmd_persist(&self, db: &mut Db, msg: &Message) -> Result<(Value, bool)> {
        let start = Instant::now();
        if msg.args.len() != 3 {
            return Err(Error::InvalidNumberOfArguments);
        }
        let (key, id) = (&msg.args[1], &msg.args[2]);
        let cleared = !self.has_expired(db, key, id) && db.expires.clear(key, id);
        let value = match msg.output {
            OutputFormat::Json => ok_message(msg, start),
            OutputFormat::Resp => Value::Integer(cleared as i64),
        };
        Ok((value, cleared))
    }

    pub(crate) fn cmd_ttl(&self, db: &Db, msg: &Message, start: Instant) -> Result<Value> {
        if msg.args.len() != 3 {
            return Err(Error::InvalidNumberOfArguments);
        }
        let (key, id) = (&msg.args[1], &msg.args[2]);
        let now = SystemTime::now();
        let exists = db
            .cols
            .get(key.as_str())
            .map_or(false, |col| col.get(id).is_some())
            && !db.expires.has_expired(key, id, now);
        let ttl: i64 = if !exists {
            -2
        } else {
            match db.expires.ttl(key, id, now) {
                Some(remaining) => remaining.as_secs() as i64,
                None => -1,
            }
        };
        Ok(match msg.output {
            OutputFormat::Json => crate::msg::json_ok_with(&format!("\"ttl\":{}", ttl), start),
            OutputFormat::Resp => Value::Integer(ttl),
        })
    }

    pub(crate) fn cmd_get(&self, db: &Db, msg: &Message, start: Instant) -> Result<Value> {
        let args = &msg.args[1..];
        let (rest, key) = tokenval(args).ok_or(Error::InvalidNumberOfArguments)?;
        let (mut rest, id) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;

        let mut withfields = false;
        if let Some((r, tok)) = tokenval(rest) {
            if tok.eq_ignore_ascii_case("withfields") {
                withfields = true;
                rest = r;
            }
        }

        let found = db.cols.get(key).and_then(|col| {
            if self.has_expired(db, key, id) {
                None
            } else {
                col.get(id).map(|(obj, fields)| {
                    (obj, ordered_fields(col, fields))
                })
            }
        });
        let Some((obj, fields)) = found else {
            return match msg.output {
                OutputFormat::Resp => Ok(Value::Null),
                OutputFormat::Json => Err(if db.cols.contains_key(key) {
                    Error::IdNotFound
                } else {
                    Error::KeyNotFound
                }),
            };
        };

        let kind = match tokenval(rest) {
            Some((r, tok)) => {
                rest = r;
                tok.to_lowercase()
            }
            None => "object".to_string(),
        };
        let (value_resp, json_member) = match kind.as_str() {
            "object" => (
                Value::from_str(obj.string_repr()),
                format!("\"object\":{}", object_json_member(&obj)),
            ),
            "point" => {
                let center = obj.center();
                let mut point = vec![
                    Value::from_str(fmt_float(center.y)),
                    Value::from_str(fmt_float(center.x)),
                ];
                let mut json = format!(
                    "\"point\":{{\"lat\":{},\"lon\":{}",
                    fmt_float(center.y),
                    fmt_float(center.x)
                );
                if let Some(z) = obj.z() {
                    if z != 0.0 {
                        point.push(Value::from_str(fmt_float(z)));
                        json.push_str(&format!(",\"z\":{}", fmt_float(z)));
                    }
                }
                json.push('}');
                (Value::Array(point), json)
            }
            "hash" => {
                let (r, sprecision) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
                rest = r;
                let precision = sprecision
                    .parse::<usize>()
                    .map_err(|_| Error::invalid_argument(sprecision))?;
                let center = obj.center();
                let hash = geohash::encode(center.y, center.x, precision);
                (
                    Value::from_str(hash.clone()),
                    format!("\"hash\":{}", json_string(&hash)),
                )
            }
            "bounds" => {
                let rect = obj.rect();
                (
                    Value::Array(vec![
                        Value::Array(vec![
                            Value::from_str(fmt_float(rect.min.x)),
                            Value::from_str(fmt_float(rect.min.y)),
                        ]),
                        Value::Array(vec![
                            Value::from_str(fmt_float(rect.max.x)),
                            Value::from_str(fmt_float(rect.max.y)),
                        ]),
                    ]),
                    format!(
                        "\"bounds\":{{\"sw\":{{\"lat\":{},\"lon\":{}}},\"ne\":{{\"lat\":{},\"lon\":{}}}}}",
                        fmt_float(rect.min.y),
                        fmt_float(rect.min.x),
                        fmt_float(rect.max.y),
                        fmt_float(rect.max.x)
                    ),
                )
            }
            other => return Err(Error::invalid_argument(other)),
        };
        if !rest.is_empty() {
            return Err(Error::InvalidNumberOfArguments);
        }

        Ok(match msg.output {
            OutputFormat::Resp => {
                if withfields {
                    let mut parts = vec![value_resp];
                    if !fields.is_empty() {
                        parts.push(fields_resp_array(&fields));
                    }
                    Value::Array(parts)
                } else {
                    value_resp
                }
            }
            OutputFormat::Json => {
                let mut extra = json_member;
                if withfields && !fields.is_empty() {
                    extra.push_str(",\"fields\":{");
                    for (i, (name, value)) in fields.iter().enumerate() {
                        if i > 0 {
                            extra.push(',');
                        }
                        extra.push_str(&format!("{}:{}", json_string(name), fmt_float(*value)));
                    }
                    extra.push('}');
                }
                crate::msg::json_ok_with(&extra, start)
            }
        })
    }

    pub(crate) fn cmd_bounds(&self, db: &Db, msg: &Message, start: Instant) -> Result<Value> {
        if msg.args.len() != 2 {
            return Err(Error::InvalidNumberOfArguments);
        }
        let key = &msg.args[1];
        let Some(col) = db.cols.get(key.as_str()) else {
            return match msg.output {
                OutputFormat::Resp => Ok(Value::Null),
                OutputFormat::Json => Err(Error::KeyNotFound),
            };
        };
        let rect = col.bounds().unwrap_or_default();
        Ok(match msg.output {
            OutputFormat::Resp => Value::Array(vec![
                Value::Array(vec![
                    Value::from_str(fmt_float(rect.min.x)),
                    Value::from_str(fmt_float(rect.min.y)),
                ]),
                Value::Array(vec![
                    Value::from_str(fmt_float(rect.max.x)),
                    Value::from_str(fmt_float(rect.max.y)),
                ]),
            ]),
            OutputFormat::Json => {
                let poly = geojson::to_json(&Object::Rect(rect));
                crate::msg::json_ok_with(&format!("\"bounds\":{}", poly), start)
            }
        })
    }

    pub(crate) fn cmd_type(&self, db: &Db, msg: &Message, _start: Instant) -> Result<Value> {
        if msg.args.len() != 2 {
            return Err(Error::InvalidNumberOfArguments);
        }
        let kind = if db.cols.contains_key(msg.args[1].as_str()) {
            "hash"
        } else {
            "none"
        };
        Ok(Value::Simple(kind.into()))
    }

    pub(crate) fn cmd_keys(
        &self,
        db: &Db,
        msg: &Message,
        _status: &Status,
        start: Instant,
    ) -> Result<Value> {
        if msg.args.len() != 2 {
            return Err(Error::InvalidNumberOfArguments);
        }
        let pattern = &msg.args[1];
        let mut keys = Vec::new();
        for key in db.cols.keys() {
            if pattern == "*" || glob::matches(pattern, key) {
                keys.push(key.clone());
            }
        }
        Ok(match msg.output {
            OutputFormat::Resp => {
                Value::Array(keys.into_iter().map(Value::from_str).collect())
            }
            OutputFormat::Json => {
                let list = keys
                    .iter()
                    .map(|k| json_string(k))
                    .collect::<Vec<_>>()
                    .join(",");
                crate::msg::json_ok_with(&format!("\"keys\":[{}]", list), start)
            }
        })
    }

    pub(crate) fn cmd_stats(&self, db: &Db, msg: &Message, start: Instant) -> Result<Value> {
        if msg.args.len() < 2 {
            return Err(Error::InvalidNumberOfArguments);
        }
        let mut entries = Vec::new();
        for key in &msg.args[1..] {
            match db.cols.get(key.as_str()) {
                Some(col) => {
                    entries.push(Some((
                        col.total_weight(),
                        col.count(),
                        col.point_count(),
                        col.string_count(),
                    )));
                }
                None => entries.push(None),
            }
        }
        Ok(match msg.output {
            OutputFormat::Resp => Value::Array(
                entries
                    .into_iter()
                    .map(|entry| match entry {
                        Some((weight, objects, points, strings)) => Value::Array(vec![
                            Value::from_str("in_memory_size"),
                            Value::Integer(weight as i64),
                            Value::from_str("num_objects"),
                            Value::Integer(objects as i64),
                            Value::from_str("num_points"),
                            Value::Integer(points as i64),
                            Value::from_str("num_strings"),
                            Value::Integer(strings as i64),
                        ]),
                        None => Value::Null,
                    })
                    .collect(),
            ),
            OutputFormat::Json => {
                let list = entries
                    .iter()
                    .map(|entry| match entry {
                        Some((weight, objects, points, strings)) => format!(
                            "{{\"in_memory_size\":{},\"num_objects\":{},\"num_points\":{},\"num_strings\":{}}}",
                            weight, objects, points, strings
                        ),
                        None => "null".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                crate::msg::json_ok_with(&format!("\"stats\":[{}]", list), start)
            }
        })
    }

    pub(crate) fn cmd_flushdb(&self, db: &mut Db, msg: &Message) -> Result<(Value, bool)> {
        let start = Instant::now();
        if msg.args.len() != 1 {
            return Err(Error::InvalidNumberOfArguments);
        }
        db.cols.clear();
        db.expires.clear_all();
        Ok((ok_message(msg, start), true))
    }
}

/// Reply for an NX/XX condition miss: RESP null, JSON error.
fn set_cond_failed(msg: &Message, nx: bool) -> Result<(Value, bool)> {
    match msg.output {
        OutputFormat::Resp => Ok((Value::Null, false)),
        OutputFormat::Json => Err(if nx {
            Error::IdAlreadyExists
        } else {
            Error::IdNotFound
        }),
    }
}

/// The `"object"` JSON member: raw GeoJSON for spatial objects, a JSON
/// string for string values.
fn object_json_member(obj: &Object) -> String {
    match obj {
        Object::String(s) => json_string(s),
        other => geojson::to_json(other),
    }
}


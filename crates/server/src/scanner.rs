//! The scanner: cursor-driven iteration with filters, output shapes, and
//! collectors.
//!
//! A scanner sits above a collection iteration and decides, per item,
//! whether it matches (glob, WHERE, WHEREIN, WHEREEVAL), what to emit (ids,
//! objects, counts, points, geohashes, bounds), and when to stop (matched
//! and scanned limits). Iteration state lives in a shared [`IterCursor`]
//! the collection steps while the scanner reads, so the offset survives
//! pagination.

use crate::msg::OutputFormat;
use meridian_collection::{Collection, Cursor};
use meridian_core::error::{Error, Result};
use meridian_core::{clip, geohash, Object};
use meridian_wire::{format_elapsed, json_string, Value};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Default matched-item limit when the command supplies none.
pub const LIMIT_ITEMS: u64 = 100;

/// What the scanner emits per matched item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Ids,
    Objects,
    Count,
    Points,
    Hashes,
    Bounds,
}

/// Numeric range filter over one named field. The reserved pseudo-field `z`
/// tests the altitude of Point objects.
#[derive(Debug, Clone)]
pub struct Where {
    pub field: String,
    pub index: usize,
    pub min: f64,
    pub max: f64,
}

impl Where {
    fn matches(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Set-membership filter over one named field.
#[derive(Debug, Clone)]
pub struct Wherein {
    pub field: String,
    pub index: usize,
    pub values: Vec<f64>,
}

impl Wherein {
    fn matches(&self, value: f64) -> bool {
        self.values.iter().any(|&v| v == value)
    }
}

/// Predicate evaluated by the external script host. Receives the item id and
/// its named field values; failures propagate out of the scan.
pub type WhereEvalFn<'a> = Box<dyn Fn(&str, &HashMap<String, f64>) -> Result<bool> + 'a>;

/// Matched/scanned limits with independent meanings: `matched` bounds
/// emitted items, `scanned` bounds examined items.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    pub matched: u64,
    pub scanned: u64,
}

/// Shared iteration cursor: the collection steps it while the scanner
/// reads it, so stepping goes through a `Cell`.
#[derive(Debug, Default)]
pub struct IterCursor {
    offset: u64,
    iters: Cell<u64>,
}

impl IterCursor {
    pub fn new(offset: u64) -> Self {
        IterCursor {
            offset,
            iters: Cell::new(0),
        }
    }

    pub fn iters(&self) -> u64 {
        self.iters.get()
    }
}

impl Cursor for IterCursor {
    fn offset(&self) -> u64 {
        self.offset
    }

    fn step(&self, count: u64) {
        self.iters.set(self.iters.get() + count);
    }
}

/// Scanner construction options.
pub struct ScanOpts<'a> {
    pub output: OutputKind,
    pub precision: u64,
    pub glob_pattern: String,
    pub match_values: bool,
    pub limits: Limits,
    pub wheres: Vec<Where>,
    pub whereins: Vec<Wherein>,
    pub whereevals: Vec<WhereEvalFn<'a>>,
    pub nofields: bool,
}

impl Default for ScanOpts<'_> {
    fn default() -> Self {
        ScanOpts {
            output: OutputKind::Objects,
            precision: 0,
            glob_pattern: String::new(),
            match_values: false,
            limits: Limits::default(),
            wheres: Vec::new(),
            whereins: Vec::new(),
            whereevals: Vec::new(),
            nofields: false,
        }
    }
}

/// One item handed to [`Scanner::write_object`].
pub struct ScanParams<'o> {
    pub id: &'o str,
    pub obj: &'o Arc<Object>,
    pub fields: &'o [f64],
    pub distance: f64,
    pub clip_obj: Option<&'o Object>,
    /// The caller already ran the filters (NEARBY pre-tests candidates).
    pub skip_testing: bool,
}

impl<'o> ScanParams<'o> {
    pub fn new(id: &'o str, obj: &'o Arc<Object>, fields: &'o [f64]) -> Self {
        ScanParams {
            id,
            obj,
            fields,
            distance: 0.0,
            clip_obj: None,
            skip_testing: false,
        }
    }
}

enum Collector {
    Json { buffer: Vec<u8>, once: bool },
    Resp { items: Vec<Value> },
}

/// The query executor's per-command state.
pub struct Scanner<'a> {
    pub output: OutputKind,
    fmap: HashMap<String, usize>,
    farr: Vec<String>,
    wheres: Vec<Where>,
    whereins: Vec<Wherein>,
    whereevals: Vec<WhereEvalFn<'a>>,
    precision: u64,
    glob_pattern: String,
    pub glob_everything: bool,
    pub glob_single: bool,
    match_values: bool,
    nofields: bool,
    pub full_fields: bool,

    cur: &'a IterCursor,
    limits: Limits,
    number_items: u64,
    pub count: u64,
    early_stop: bool,
    final_cursor: u64,

    /// First filter error observed mid-iteration (WHEREEVAL failures).
    pub err: Option<Error>,

    collector: Collector,
}

impl<'a> Scanner<'a> {
    pub fn new(
        col: Option<&Collection>,
        opts: ScanOpts<'a>,
        cursor: &'a IterCursor,
        format: OutputFormat,
    ) -> Scanner<'a> {
        let mut matched = opts.limits.matched;
        if matched == 0 {
            matched = if opts.output == OutputKind::Count {
                u64::MAX
            } else {
                LIMIT_ITEMS
            };
        }
        let mut scanned = opts.limits.scanned;
        if scanned == 0 {
            scanned = u64::MAX;
        }

        let glob_everything = opts.glob_pattern.is_empty() || opts.glob_pattern == "*";
        let glob_single =
            !glob_everything && !meridian_core::glob::is_glob(&opts.glob_pattern);

        let (fmap, farr) = match col {
            Some(col) => (col.field_map().clone(), col.field_arr().to_vec()),
            None => (HashMap::new(), Vec::new()),
        };

        // resolve field names to column indexes once, not per tested object
        let mut wheres = opts.wheres;
        for w in &mut wheres {
            w.index = *fmap.get(&w.field).unwrap_or(&usize::MAX);
        }
        let mut whereins = opts.whereins;
        for w in &mut whereins {
            w.index = *fmap.get(&w.field).unwrap_or(&usize::MAX);
        }

        Scanner {
            output: opts.output,
            fmap,
            farr,
            wheres,
            whereins,
            whereevals: opts.whereevals,
            precision: opts.precision,
            glob_pattern: opts.glob_pattern,
            glob_everything,
            glob_single,
            match_values: opts.match_values,
            nofields: opts.nofields,
            full_fields: false,
            cur: cursor,
            limits: Limits { matched, scanned },
            number_items: 0,
            count: 0,
            early_stop: false,
            final_cursor: 0,
            err: None,
            collector: match format {
                OutputFormat::Json => Collector::Json {
                    buffer: Vec::new(),
                    once: false,
                },
                OutputFormat::Resp => Collector::Resp { items: Vec::new() },
            },
        }
    }

    pub fn glob_limits(&self, desc: bool) -> [String; 2] {
        meridian_core::glob::parse(&self.glob_pattern, desc).limits
    }

    /// SEARCH matches against values, never ids, so the single-id shortcut
    /// must be off.
    pub fn disable_glob_single(&mut self) {
        self.glob_single = false;
    }

    /// Number of active field filters; the COUNT fast path requires zero.
    pub fn filter_count(&self) -> usize {
        self.wheres.len() + self.whereins.len() + self.whereevals.len()
    }

    /// The effective matched-item limit.
    pub fn matched_limit(&self) -> u64 {
        self.limits.matched
    }

    fn has_fields_output(&self) -> bool {
        !self.nofields
            && matches!(
                self.output,
                OutputKind::Objects | OutputKind::Points | OutputKind::Hashes | OutputKind::Bounds
            )
    }

    pub fn write_head(&mut self) {
        if let Collector::Json { buffer, .. } = &mut self.collector {
            if !self.farr.is_empty()
                && !self.nofields
                && matches!(
                    self.output,
                    OutputKind::Objects
                        | OutputKind::Points
                        | OutputKind::Hashes
                        | OutputKind::Bounds
                )
            {
                buffer.extend_from_slice(b",\"fields\":[");
                for (i, field) in self.farr.iter().enumerate() {
                    if i > 0 {
                        buffer.push(b',');
                    }
                    buffer.extend_from_slice(json_string(field).as_bytes());
                }
                buffer.push(b']');
            }
            let open = match self.output {
                OutputKind::Ids => &b",\"ids\":["[..],
                OutputKind::Objects => &b",\"objects\":["[..],
                OutputKind::Points => &b",\"points\":["[..],
                OutputKind::Bounds => &b",\"bounds\":["[..],
                OutputKind::Hashes => &b",\"hashes\":["[..],
                OutputKind::Count => &b""[..],
            };
            buffer.extend_from_slice(open);
        }
    }

    pub fn write_foot(&mut self) {
        self.final_cursor = if self.early_stop { self.cur.iters() } else { 0 };
        if let Collector::Json { buffer, .. } = &mut self.collector {
            if self.output != OutputKind::Count {
                buffer.push(b']');
            }
            buffer.extend_from_slice(format!(",\"count\":{}", self.count).as_bytes());
            buffer.extend_from_slice(format!(",\"cursor\":{}", self.final_cursor).as_bytes());
        }
    }

    /// The cursor value to hand back to the client: total iterations when
    /// the scan stopped early (resumable), zero when exhausted.
    pub fn final_cursor(&self) -> u64 {
        self.final_cursor
    }

    /// Assemble the command reply.
    pub fn into_value(self, format: OutputFormat, start: Instant) -> Value {
        match self.collector {
            Collector::Json { buffer, .. } => {
                let mut out = Vec::with_capacity(buffer.len() + 48);
                out.extend_from_slice(b"{\"ok\":true");
                out.extend_from_slice(&buffer);
                out.extend_from_slice(
                    format!(",\"elapsed\":\"{}\"}}", format_elapsed(start.elapsed())).as_bytes(),
                );
                debug_assert_eq!(format, OutputFormat::Json);
                Value::Bulk(out)
            }
            Collector::Resp { items } => {
                if self.output == OutputKind::Count {
                    Value::Integer(self.count as i64)
                } else {
                    Value::Array(vec![
                        Value::Integer(self.final_cursor as i64),
                        Value::Array(items),
                    ])
                }
            }
        }
    }

    fn glob_match(&self, id: &str, obj: &Object) -> (bool, bool) {
        if self.glob_everything {
            return (true, true);
        }
        if self.glob_single {
            if self.glob_pattern != id {
                return (false, true);
            }
            return (true, false);
        }
        let matched = if self.match_values {
            meridian_core::glob::matches(&self.glob_pattern, &obj.string_repr())
        } else {
            meridian_core::glob::matches(&self.glob_pattern, id)
        };
        (matched, true)
    }

    fn field_value(&self, fields: &[f64], index: usize) -> f64 {
        fields.get(index).copied().unwrap_or(0.0)
    }

    fn field_match(&mut self, id: &str, fields: &[f64], obj: &Object) -> bool {
        let mut z = None;
        for w in &self.wheres {
            let value = if w.field == "z" {
                *z.get_or_insert_with(|| obj.z().unwrap_or(0.0))
            } else {
                self.field_value(fields, w.index)
            };
            if !w.matches(value) {
                return false;
            }
        }
        for w in &self.whereins {
            if !w.matches(self.field_value(fields, w.index)) {
                return false;
            }
        }
        if !self.whereevals.is_empty() {
            let mut named = HashMap::with_capacity(self.fmap.len());
            for (field, &idx) in &self.fmap {
                named.insert(field.clone(), self.field_value(fields, idx));
            }
            for eval in &self.whereevals {
                match eval(id, &named) {
                    Ok(true) => {}
                    Ok(false) => return false,
                    Err(err) => {
                        self.err = Some(err);
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Whether the object passes the filters, and whether iteration could
    /// still find more matches.
    pub fn test_object(&mut self, id: &str, obj: &Object, fields: &[f64]) -> (bool, bool) {
        let (matched, keep_going) = self.glob_match(id, obj);
        if !matched {
            return (false, keep_going);
        }
        (self.field_match(id, fields, obj), true)
    }

    /// Feed one item through the filters and into the collector. Returns
    /// whether iteration should continue.
    pub fn write_object(&mut self, params: ScanParams) -> bool {
        let at_scan_limit = self.cur.iters().saturating_sub(self.cur.offset()) == self.limits.scanned;
        if at_scan_limit {
            self.early_stop = true;
        }
        let (ok, keep_going) = if params.skip_testing {
            (true, true)
        } else {
            self.test_object(params.id, params.obj, params.fields)
        };
        if self.err.is_some() {
            self.early_stop = true;
            return false;
        }
        if !ok {
            return keep_going && !at_scan_limit;
        }
        self.count += 1;
        if self.output == OutputKind::Count {
            return self.count < self.limits.matched && !at_scan_limit;
        }

        let clipped;
        let obj: &Object = match params.clip_obj {
            Some(window) => {
                clipped = clip::clip(params.obj, window);
                &clipped
            }
            None => params.obj,
        };
        self.process_item(params.id, obj, params.fields, params.distance);
        self.number_items += 1;
        if self.number_items == self.limits.matched {
            self.early_stop = true;
            return false;
        }
        keep_going && !at_scan_limit
    }

    fn ordered_fields(&self, fields: &[f64]) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        for name in &self.farr {
            let idx = self.fmap[name];
            let value = self.field_value(fields, idx);
            if value != 0.0 {
                out.push((name.clone(), value));
            }
        }
        out
    }

    fn process_item(&mut self, id: &str, obj: &Object, fields: &[f64], distance: f64) {
        let has_fields = self.has_fields_output();
        let full_fields = self.full_fields;
        let precision = self.precision;
        let output = self.output;
        let field_values: Vec<f64> = if has_fields && !full_fields {
            self.farr
                .iter()
                .map(|name| self.field_value(fields, self.fmap[name]))
                .collect()
        } else {
            Vec::new()
        };
        let nonzero_fields = if has_fields { self.ordered_fields(fields) } else { Vec::new() };

        match &mut self.collector {
            Collector::Json { buffer, once } => {
                if *once {
                    buffer.push(b',');
                } else {
                    *once = true;
                }
                if output == OutputKind::Ids {
                    buffer.extend_from_slice(json_string(id).as_bytes());
                    return;
                }
                buffer.extend_from_slice(format!("{{\"id\":{}", json_string(id)).as_bytes());
                match output {
                    OutputKind::Objects => {
                        buffer.extend_from_slice(b",\"object\":");
                        buffer.extend_from_slice(meridian_core::geojson::to_json(obj).as_bytes());
                    }
                    OutputKind::Points => {
                        buffer.extend_from_slice(b",\"point\":");
                        buffer.extend_from_slice(json_simple_point(obj).as_bytes());
                    }
                    OutputKind::Hashes => {
                        let center = obj.center();
                        let hash = geohash::encode(center.y, center.x, precision as usize);
                        buffer
                            .extend_from_slice(format!(",\"hash\":\"{}\"", hash).as_bytes());
                    }
                    OutputKind::Bounds => {
                        buffer.extend_from_slice(b",\"bounds\":");
                        buffer.extend_from_slice(json_simple_bounds(obj).as_bytes());
                    }
                    OutputKind::Ids | OutputKind::Count => unreachable!("handled above"),
                }
                if has_fields {
                    if full_fields {
                        if !nonzero_fields.is_empty() {
                            buffer.extend_from_slice(b",\"fields\":{");
                            for (i, (name, value)) in nonzero_fields.iter().enumerate() {
                                if i > 0 {
                                    buffer.push(b',');
                                }
                                buffer.extend_from_slice(
                                    format!("{}:{}", json_string(name), fmt_float(*value))
                                        .as_bytes(),
                                );
                            }
                            buffer.push(b'}');
                        }
                    } else if !field_values.is_empty() {
                        buffer.extend_from_slice(b",\"fields\":[");
                        for (i, value) in field_values.iter().enumerate() {
                            if i > 0 {
                                buffer.push(b',');
                            }
                            buffer.extend_from_slice(fmt_float(*value).as_bytes());
                        }
                        buffer.push(b']');
                    }
                }
                if distance > 0.0 {
                    buffer.extend_from_slice(
                        format!(",\"distance\":{}", fmt_float(distance)).as_bytes(),
                    );
                }
                buffer.push(b'}');
            }
            Collector::Resp { items } => {
                if output == OutputKind::Ids {
                    items.push(Value::from_str(id));
                    return;
                }
                let mut vals = vec![Value::from_str(id)];
                match output {
                    OutputKind::Objects => vals.push(Value::from_str(obj.string_repr())),
                    OutputKind::Points => {
                        let center = obj.center();
                        let mut point = vec![
                            Value::from_str(fmt_float(center.y)),
                            Value::from_str(fmt_float(center.x)),
                        ];
                        if let Some(z) = obj.z() {
                            if z != 0.0 {
                                point.push(Value::from_str(fmt_float(z)));
                            }
                        }
                        vals.push(Value::Array(point));
                    }
                    OutputKind::Hashes => {
                        let center = obj.center();
                        vals.push(Value::from_str(geohash::encode(
                            center.y,
                            center.x,
                            precision as usize,
                        )));
                    }
                    OutputKind::Bounds => {
                        let rect = obj.rect();
                        vals.push(Value::Array(vec![
                            Value::Array(vec![
                                Value::from_str(fmt_float(rect.min.y)),
                                Value::from_str(fmt_float(rect.min.x)),
                            ]),
                            Value::Array(vec![
                                Value::from_str(fmt_float(rect.max.y)),
                                Value::from_str(fmt_float(rect.max.x)),
                            ]),
                        ]));
                    }
                    OutputKind::Ids | OutputKind::Count => unreachable!("handled above"),
                }
                if has_fields && !nonzero_fields.is_empty() {
                    let mut fvals = Vec::with_capacity(nonzero_fields.len() * 2);
                    for (name, value) in &nonzero_fields {
                        fvals.push(Value::from_str(name.clone()));
                        fvals.push(Value::from_str(fmt_float(*value)));
                    }
                    vals.push(Value::Array(fvals));
                }
                if distance > 0.0 {
                    vals.push(Value::from_str(fmt_float(distance)));
                }
                items.push(Value::Array(vals));
            }
        }
    }
}

/// Minimal float formatting: no trailing `.0`, no exponent for the ranges
/// coordinates live in.
pub fn fmt_float(v: f64) -> String {
    format!("{}", v)
}

fn json_simple_point(obj: &Object) -> String {
    let center = obj.center();
    match obj.z() {
        Some(z) if z != 0.0 => format!(
            "{{\"lat\":{},\"lon\":{},\"z\":{}}}",
            fmt_float(center.y),
            fmt_float(center.x),
            fmt_float(z)
        ),
        _ => format!(
            "{{\"lat\":{},\"lon\":{}}}",
            fmt_float(center.y),
            fmt_float(center.x)
        ),
    }
}

fn json_simple_bounds(obj: &Object) -> String {
    let rect = obj.rect();
    format!(
        "{{\"sw\":{{\"lat\":{},\"lon\":{}}},\"ne\":{{\"lat\":{},\"lon\":{}}}}}",
        fmt_float(rect.min.y),
        fmt_float(rect.min.x),
        fmt_float(rect.max.y),
        fmt_float(rect.max.x)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(sc: &mut Scanner, cursor: &IterCursor, items: &[(&str, Object, Vec<f64>)]) {
        sc.write_head();
        for (id, obj, fields) in items {
            // the collection steps the cursor before yielding each item
            cursor.step(1);
            let obj = Arc::new(obj.clone());
            let params = ScanParams::new(id, &obj, fields);
            if !sc.write_object(params) {
                break;
            }
        }
        sc.write_foot();
    }

    fn items() -> Vec<(&'static str, Object, Vec<f64>)> {
        vec![
            ("truck1", Object::point(-115.0, 33.0), vec![55.0]),
            ("truck2", Object::point(-114.0, 34.0), vec![0.0]),
            ("car1", Object::point(-113.0, 35.0), vec![80.0]),
        ]
    }

    #[test]
    fn test_count_output() {
        let cursor = IterCursor::new(0);
        let mut sc = Scanner::new(
            None,
            ScanOpts {
                output: OutputKind::Count,
                ..Default::default()
            },
            &cursor,
            OutputFormat::Resp,
        );
        scan_all(&mut sc, &cursor, &items());
        assert_eq!(sc.count, 3);
        let reply = sc.into_value(OutputFormat::Resp, Instant::now());
        assert_eq!(reply, Value::Integer(3));
    }

    #[test]
    fn test_glob_filters_ids() {
        let cursor = IterCursor::new(0);
        let mut sc = Scanner::new(
            None,
            ScanOpts {
                output: OutputKind::Ids,
                glob_pattern: "truck*".into(),
                ..Default::default()
            },
            &cursor,
            OutputFormat::Resp,
        );
        scan_all(&mut sc, &cursor, &items());
        let reply = sc.into_value(OutputFormat::Resp, Instant::now());
        match reply {
            Value::Array(parts) => {
                assert_eq!(parts[0], Value::Integer(0)); // exhausted: cursor 0
                assert_eq!(
                    parts[1],
                    Value::Array(vec![Value::from_str("truck1"), Value::from_str("truck2")])
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_matched_limit_sets_resumable_cursor() {
        let cursor = IterCursor::new(0);
        let mut sc = Scanner::new(
            None,
            ScanOpts {
                output: OutputKind::Ids,
                limits: Limits {
                    matched: 2,
                    scanned: 0,
                },
                ..Default::default()
            },
            &cursor,
            OutputFormat::Resp,
        );
        scan_all(&mut sc, &cursor, &items());
        assert_eq!(sc.count, 2);
        assert_eq!(sc.final_cursor(), 2);
    }

    #[test]
    fn test_where_filter() {
        let cursor = IterCursor::new(0);
        let mut sc = Scanner::new(
            None,
            ScanOpts {
                output: OutputKind::Ids,
                wheres: vec![Where {
                    field: "speed".into(),
                    index: 0, // resolved against an absent collection: keep raw
                    min: 50.0,
                    max: 70.0,
                }],
                ..Default::default()
            },
            &cursor,
            OutputFormat::Resp,
        );
        // no collection: field indexes resolve to MAX and read as zero
        scan_all(&mut sc, &cursor, &items());
        assert_eq!(sc.count, 0);
    }

    #[test]
    fn test_whereeval_failure_propagates() {
        let eval: WhereEvalFn =
            Box::new(|_, _| Err(Error::ScriptError("no runtime".into())));
        let cursor = IterCursor::new(0);
        let mut sc = Scanner::new(
            None,
            ScanOpts {
                output: OutputKind::Ids,
                whereevals: vec![eval],
                ..Default::default()
            },
            &cursor,
            OutputFormat::Resp,
        );
        scan_all(&mut sc, &cursor, &items());
        assert!(matches!(sc.err, Some(Error::ScriptError(_))));
    }

    #[test]
    fn test_json_envelope() {
        let cursor = IterCursor::new(0);
        let mut sc = Scanner::new(
            None,
            ScanOpts {
                output: OutputKind::Ids,
                ..Default::default()
            },
            &cursor,
            OutputFormat::Json,
        );
        scan_all(&mut sc, &cursor, &items());
        match sc.into_value(OutputFormat::Json, Instant::now()) {
            Value::Bulk(b) => {
                let s = String::from_utf8(b).unwrap();
                assert!(s.starts_with(r#"{"ok":true,"ids":["truck1","truck2","car1"]"#));
                assert!(s.contains(r#""count":3"#));
                assert!(s.contains(r#""cursor":0"#));
                assert!(s.ends_with("\"}"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fmt_float() {
        assert_eq!(fmt_float(33.0), "33");
        assert_eq!(fmt_float(-115.5), "-115.5");
        assert_eq!(fmt_float(0.0), "0");
    }
}

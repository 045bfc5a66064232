//! SCAN and SEARCH, plus the base token grammar shared by every search
//! command (CURSOR, LIMIT, SPARSE, MATCH, ASC/DESC, WHERE, WHEREIN,
//! WHEREEVAL, NOFIELDS, CLIP, DISTANCE, and the output selectors).

use crate::msg::{tokenval, Message};
use crate::scanner::{
    IterCursor, Limits, OutputKind, ScanOpts, ScanParams, Scanner, Where, WhereEvalFn, Wherein,
};
use crate::server::{txn_to_err, Db, Server};
use meridian_core::error::{Error, Result};
use meridian_core::glob;
use meridian_txn::Status;
use meridian_wire::Value;
use std::time::Instant;

/// Parsed flags common to SCAN, SEARCH, WITHIN, INTERSECTS, NEARBY.
pub(crate) struct BaseTokens<'a> {
    pub key: String,
    pub cursor: u64,
    pub limits: Limits,
    pub sparse: u8,
    pub desc: bool,
    pub glob: String,
    pub output: OutputKind,
    pub output_explicit: bool,
    pub precision: u64,
    pub wheres: Vec<Where>,
    pub whereins: Vec<Wherein>,
    pub whereevals: Vec<WhereEvalFn<'a>>,
    pub nofields: bool,
    pub clip: bool,
    pub distance: bool,
}

fn parse_range_value(token: &str) -> Result<f64> {
    match token.to_lowercase().as_str() {
        "-inf" => Ok(f64::NEG_INFINITY),
        "inf" | "+inf" => Ok(f64::INFINITY),
        _ => token
            .parse::<f64>()
            .map_err(|_| Error::invalid_argument(token)),
    }
}

impl Server {
    /// Parse the shared flag grammar, stopping at the first unrecognized
    /// token (the area expression for the geo commands).
    pub(crate) fn parse_base_tokens<'s, 'b>(
        &'s self,
        args: &'b [String],
    ) -> Result<(&'b [String], BaseTokens<'s>)> {
        let (mut rest, key) = tokenval(args).ok_or(Error::InvalidNumberOfArguments)?;
        if key.is_empty() {
            return Err(Error::InvalidNumberOfArguments);
        }
        let mut t = BaseTokens {
            key: key.to_string(),
            cursor: 0,
            limits: Limits::default(),
            sparse: 0,
            desc: false,
            glob: String::new(),
            output: OutputKind::Objects,
            output_explicit: false,
            precision: 0,
            wheres: Vec::new(),
            whereins: Vec::new(),
            whereevals: Vec::new(),
            nofields: false,
            clip: false,
            distance: false,
        };

        loop {
            let Some((r, tok)) = tokenval(rest) else { break };
            match tok.to_lowercase().as_str() {
                "cursor" => {
                    let (r, sval) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                    t.cursor = sval
                        .parse::<u64>()
                        .map_err(|_| Error::invalid_argument(sval))?;
                    rest = r;
                }
                "limit" => {
                    let (mut r, sval) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                    t.limits.matched = sval
                        .parse::<u64>()
                        .map_err(|_| Error::invalid_argument(sval))?;
                    // an optional second number bounds scanned items
                    if let Some((r2, s2)) = tokenval(r) {
                        if let Ok(scanned) = s2.parse::<u64>() {
                            t.limits.scanned = scanned;
                            r = r2;
                        }
                    }
                    rest = r;
                }
                "sparse" => {
                    let (r, sval) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                    t.sparse = sval
                        .parse::<u8>()
                        .map_err(|_| Error::invalid_argument(sval))?;
                    if t.sparse > 8 {
                        return Err(Error::invalid_argument(sval));
                    }
                    rest = r;
                }
                "match" => {
                    let (r, pattern) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                    t.glob = pattern.to_string();
                    rest = r;
                }
                "asc" => {
                    t.desc = false;
                    rest = r;
                }
                "desc" => {
                    t.desc = true;
                    rest = r;
                }
                "where" => {
                    let (r, field) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                    let (r, smin) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                    let (r, smax) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                    t.wheres.push(Where {
                        field: field.to_string(),
                        index: usize::MAX,
                        min: parse_range_value(smin)?,
                        max: parse_range_value(smax)?,
                    });
                    rest = r;
                }
                "wherein" => {
                    let (r, field) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                    let (mut r, scount) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                    let count = scount
                        .parse::<usize>()
                        .map_err(|_| Error::invalid_argument(scount))?;
                    let mut values = Vec::with_capacity(count);
                    for _ in 0..count {
                        let (r2, sval) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                        values.push(
                            sval.parse::<f64>()
                                .map_err(|_| Error::invalid_argument(sval))?,
                        );
                        r = r2;
                    }
                    t.whereins.push(Wherein {
                        field: field.to_string(),
                        index: usize::MAX,
                        values,
                    });
                    rest = r;
                }
                "whereeval" | "whereevalsha" => {
                    let sha = tok.eq_ignore_ascii_case("whereevalsha");
                    let (r, script) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                    let (mut r, scount) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                    let count = scount
                        .parse::<usize>()
                        .map_err(|_| Error::invalid_argument(scount))?;
                    let mut argv = Vec::with_capacity(count);
                    for _ in 0..count {
                        let (r2, sval) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                        argv.push(sval.to_string());
                        r = r2;
                    }
                    let source = if sha {
                        self.script_source(script)?
                    } else {
                        script.to_string()
                    };
                    t.whereevals.push(self.whereeval_fn(source, argv));
                    rest = r;
                }
                "nofields" => {
                    t.nofields = true;
                    rest = r;
                }
                "clip" => {
                    t.clip = true;
                    rest = r;
                }
                "distance" => {
                    t.distance = true;
                    rest = r;
                }
                "count" => {
                    t.output = OutputKind::Count;
                    t.output_explicit = true;
                    rest = r;
                }
                "ids" => {
                    t.output = OutputKind::Ids;
                    t.output_explicit = true;
                    rest = r;
                }
                "objects" => {
                    t.output = OutputKind::Objects;
                    t.output_explicit = true;
                    rest = r;
                }
                "points" => {
                    t.output = OutputKind::Points;
                    t.output_explicit = true;
                    rest = r;
                }
                "bounds" => {
                    t.output = OutputKind::Bounds;
                    t.output_explicit = true;
                    rest = r;
                }
                "hashes" => {
                    let (r, sprec) = tokenval(r).ok_or(Error::InvalidNumberOfArguments)?;
                    t.precision = sprec
                        .parse::<u64>()
                        .map_err(|_| Error::invalid_argument(sprec))?;
                    if t.precision == 0 || t.precision > 22 {
                        return Err(Error::invalid_argument(sprec));
                    }
                    t.output = OutputKind::Hashes;
                    t.output_explicit = true;
                    rest = r;
                }
                _ => break,
            }
        }
        Ok((rest, t))
    }

    pub(crate) fn cmd_scan(
        &self,
        db: &Db,
        msg: &Message,
        status: &Status,
        start: Instant,
    ) -> Result<Value> {
        let (rest, t) = self.parse_base_tokens(&msg.args[1..])?;
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
            if sc.output == OutputKind::Count
                && sc.glob_everything
                && sc_has_no_filters(&sc)
            {
                // fast path: count without iterating
                sc.count = (col.count() as u64).saturating_sub(t.cursor);
            } else {
                let g = glob::parse(&t.glob, t.desc);
                let result = if g.limits[0].is_empty() && g.limits[1].is_empty() {
                    col.scan(t.desc, Some(&cursor), status, &mut |id, obj, fields| {
                        if self.has_expired(db, &t.key, id) {
                            return true;
                        }
                        sc.write_object(ScanParams::new(id, obj, fields))
                    })
                } else {
                    col.scan_range(
                        &g.limits[0],
                        &g.limits[1],
                        t.desc,
                        Some(&cursor),
                        status,
                        &mut |id, obj, fields| {
                            if self.has_expired(db, &t.key, id) {
                                return true;
                            }
                            sc.write_object(ScanParams::new(id, obj, fields))
                        },
                    )
                };
                result.map_err(txn_to_err)?;
            }
        }
        if let Some(err) = sc.err.take() {
            return Err(err);
        }
        sc.write_foot();
        Ok(sc.into_value(msg.output, start))
    }

    pub(crate) fn cmd_search(
        &self,
        db: &Db,
        msg: &Message,
        status: &Status,
        start: Instant,
    ) -> Result<Value> {
        let (rest, t) = self.parse_base_tokens(&msg.args[1..])?;
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
                match_values: true,
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
            if sc.output == OutputKind::Count
                && sc.glob_everything
                && sc_has_no_filters(&sc)
            {
                sc.count = (col.string_count() as u64).saturating_sub(t.cursor);
            } else {
                let g = glob::parse(&t.glob, t.desc);
                let result = if g.limits[0].is_empty() && g.limits[1].is_empty() {
                    col.search_values(t.desc, Some(&cursor), status, &mut |id, obj, fields| {
                        if self.has_expired(db, &t.key, id) {
                            return true;
                        }
                        sc.write_object(ScanParams::new(id, obj, fields))
                    })
                } else {
                    // the pattern matches values, not ids: the single-id
                    // shortcut must stay off
                    sc.disable_glob_single();
                    col.search_values_range(
                        &g.limits[0],
                        &g.limits[1],
                        t.desc,
                        Some(&cursor),
                        status,
                        &mut |id, obj, fields| {
                            if self.has_expired(db, &t.key, id) {
                                return true;
                            }
                            sc.write_object(ScanParams::new(id, obj, fields))
                        },
                    )
                };
                result.map_err(txn_to_err)?;
            }
        }
        if let Some(err) = sc.err.take() {
            return Err(err);
        }
        sc.write_foot();
        Ok(sc.into_value(msg.output, start))
    }
}

fn sc_has_no_filters(sc: &Scanner) -> bool {
    sc.filter_count() == 0
}

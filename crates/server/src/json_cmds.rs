//! JSET / JGET / JDEL: dot-path edits on stored objects.
//!
//! Editing a spatial object rewrites its GeoJSON and re-parses it; an edit
//! that leaves invalid GeoJSON is rejected. Plain JSON documents live as
//! string objects.

use crate::msg::{ok_message, tokenval, Message, OutputFormat};
use crate::server::{Db, Server};
use meridian_collection::Collection;
use meridian_core::error::{Error, Result};
use meridian_core::{geojson, json, Object};
use meridian_wire::Value;
use std::time::Instant;

/// Parse a JSET value token: numbers stay numbers when they are valid JSON
/// numbers (so `0123` stays a string), everything else is a string.
fn parse_jset_value(token: &str) -> serde_json::Value {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(token) {
        if value.is_number() {
            return value;
        }
    }
    serde_json::Value::String(token.to_string())
}

/// The stored object's JSON document form.
fn object_doc(obj: &Object) -> Result<serde_json::Value> {
    match obj {
        Object::String(s) => serde_json::from_str(s)
            .map_err(|_| Error::invalid_argument("value is not valid json")),
        other => Ok(geojson::to_value(other)),
    }
}

impl Server {
    pub(crate) fn cmd_jset(&self, db: &mut Db, msg: &Message) -> Result<(Value, bool)> {
        let start = Instant::now();
        let args = &msg.args[1..];
        let (rest, key) = tokenval(args).ok_or(Error::InvalidNumberOfArguments)?;
        let (rest, id) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
        let (rest, path) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
        let (rest, raw) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
        if !rest.is_empty() {
            return Err(Error::InvalidNumberOfArguments);
        }

        let existing = db
            .cols
            .get(key)
            .filter(|_| !self.has_expired(db, key, id))
            .and_then(|col| col.get(id).map(|(obj, _)| obj));
        let was_spatial = existing.as_deref().map(Object::is_spatial);
        let mut doc = match &existing {
            Some(obj) => object_doc(obj)?,
            None => serde_json::Value::Object(serde_json::Map::new()),
        };
        json::set(&mut doc, path, parse_jset_value(raw));
        let new_obj = rebuild_object(&doc, was_spatial)?;

        db.cols
            .entry(key.to_string())
            .or_insert_with(Collection::new)
            .set(id, new_obj, &[], &[]);
        Ok((ok_message(msg, start), true))
    }

    pub(crate) fn cmd_jget(&self, db: &Db, msg: &Message, start: Instant) -> Result<Value> {
        let args = &msg.args[1..];
        let (rest, key) = tokenval(args).ok_or(Error::InvalidNumberOfArguments)?;
        let (rest, id) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
        let path = match tokenval(rest) {
            Some((r, path)) => {
                if !r.is_empty() {
                    return Err(Error::InvalidNumberOfArguments);
                }
                Some(path)
            }
            None => None,
        };

        let found = db
            .cols
            .get(key)
            .filter(|_| !self.has_expired(db, key, id))
            .and_then(|col| col.get(id).map(|(obj, _)| obj));
        let Some(obj) = found else {
            return match msg.output {
                OutputFormat::Resp => Ok(Value::Null),
                OutputFormat::Json => Err(Error::IdNotFound),
            };
        };
        let doc = object_doc(&obj)?;
        let text = match path {
            None => Some(doc.to_string()),
            Some(path) => json::get(&doc, path).map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        };
        Ok(match (text, msg.output) {
            (Some(text), OutputFormat::Resp) => Value::from_str(text),
            (None, OutputFormat::Resp) => Value::Null,
            (Some(text), OutputFormat::Json) => crate::msg::json_ok_with(
                &format!("\"value\":{}", meridian_wire::json_string(&text)),
                start,
            ),
            (None, OutputFormat::Json) => Err(Error::IdNotFound)?,
        })
    }

    pub(crate) fn cmd_jdel(&self, db: &mut Db, msg: &Message) -> Result<(Value, bool)> {
        let start = Instant::now();
        let args = &msg.args[1..];
        let (rest, key) = tokenval(args).ok_or(Error::InvalidNumberOfArguments)?;
        let (rest, id) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
        let (rest, path) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
        if !rest.is_empty() {
            return Err(Error::InvalidNumberOfArguments);
        }

        let existing = db
            .cols
            .get(key)
            .filter(|_| !self.has_expired(db, key, id))
            .and_then(|col| col.get(id).map(|(obj, _)| obj));
        let Some(obj) = existing else {
            let value = match msg.output {
                OutputFormat::Json => ok_message(msg, start),
                OutputFormat::Resp => Value::Integer(0),
            };
            return Ok((value, false));
        };
        let was_spatial = obj.is_spatial();
        let mut doc = object_doc(&obj)?;
        if !json::delete(&mut doc, path) {
            let value = match msg.output {
                OutputFormat::Json => ok_message(msg, start),
                OutputFormat::Resp => Value::Integer(0),
            };
            return Ok((value, false));
        }
        let new_obj = rebuild_object(&doc, Some(was_spatial))?;
        db.cols
            .get_mut(key)
            .expect("checked above")
            .set(id, new_obj, &[], &[]);
        let value = match msg.output {
            OutputFormat::Json => ok_message(msg, start),
            OutputFormat::Resp => Value::Integer(1),
        };
        Ok((value, true))
    }
}

/// Turn an edited document back into an object. Objects that were spatial
/// must still parse as GeoJSON; new or string-backed documents fall back to
/// a string object holding the JSON text.
fn rebuild_object(doc: &serde_json::Value, was_spatial: Option<bool>) -> Result<Object> {
    let text = doc.to_string();
    match geojson::parse(&text) {
        Ok(obj) => Ok(obj),
        Err(err) => match was_spatial {
            Some(true) => Err(err),
            _ => Ok(Object::String(text)),
        },
    }
}

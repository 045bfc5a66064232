//! Shared helpers for the integration tests.

#![allow(dead_code)]

use meridian::{Message, Server, Value};
use std::sync::Arc;

/// Run one command from token slices against the server.
pub fn cmd(server: &Arc<Server>, args: &[&str]) -> meridian::Result<Value> {
    let mut msg = Message::new(args.iter().map(|s| s.to_string()).collect());
    server.command(&mut msg)
}

/// Run a command and panic on error.
pub fn must(server: &Arc<Server>, args: &[&str]) -> Value {
    match cmd(server, args) {
        Ok(value) => value,
        Err(err) => panic!("command {:?} failed: {}", args, err),
    }
}

/// Run a command in JSON output mode.
pub fn cmd_json(server: &Arc<Server>, args: &[&str]) -> meridian::Result<String> {
    let mut msg = Message::new(args.iter().map(|s| s.to_string()).collect()).json();
    let value = server.command(&mut msg)?;
    match value {
        Value::Bulk(bytes) => Ok(String::from_utf8(bytes).expect("json reply is utf-8")),
        other => panic!("expected json bulk, got {:?}", other),
    }
}

/// Render a reply the way the original server tests spell expectations:
/// arrays bracketed and space-joined, null as `nil`.
pub fn render(value: &Value) -> String {
    match value {
        Value::Simple(s) => s.clone(),
        Value::Error(s) => format!("ERR {}", s),
        Value::Integer(n) => n.to_string(),
        Value::Bulk(b) => String::from_utf8_lossy(b).into_owned(),
        Value::Null => "nil".to_string(),
        Value::Array(vals) => {
            let inner: Vec<String> = vals.iter().map(render).collect();
            format!("[{}]", inner.join(" "))
        }
    }
}

/// The ids of a `... IDS` search reply, sorted.
pub fn ids_of(value: &Value) -> Vec<String> {
    match value {
        Value::Array(parts) => {
            let mut ids: Vec<String> = parts
                .get(1)
                .map(|v| v.as_array().iter().map(render).collect())
                .unwrap_or_default();
            ids.sort();
            ids
        }
        other => panic!("expected search reply, got {:?}", other),
    }
}

/// Every `id -> object-string` pair in a collection, via an exhaustive SCAN.
pub fn dump(server: &Arc<Server>, key: &str) -> Vec<(String, String)> {
    let reply = must(server, &["SCAN", key, "LIMIT", "1000000"]);
    let mut out = Vec::new();
    if let Value::Array(parts) = reply {
        if let Some(Value::Array(items)) = parts.get(1) {
            for item in items {
                let fields = item.as_array();
                out.push((render(&fields[0]), render(&fields[1])));
            }
        }
    }
    out.sort();
    out
}

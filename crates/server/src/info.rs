//! SERVER / INFO reporting plus the small admin knobs: OUTPUT, CLIENT,
//! CONFIG, READONLY.

use crate::msg::{ok_message, tokenval, Message, OutputFormat};
use crate::server::{Db, Server};
use meridian_core::error::{Error, Result};
use meridian_wire::{json_string, Value};
use std::sync::atomic::Ordering;
use std::time::Instant;

impl Server {
    fn server_pairs(&self, db: &Db) -> Vec<(String, String)> {
        let following = if db.config.is_following() {
            format!("{}:{}", db.config.follow_host, db.config.follow_port)
        } else {
            String::new()
        };
        let num_points: usize = db.cols.values().map(|c| c.point_count()).sum();
        let num_objects: usize = db.cols.values().map(|c| c.count()).sum();
        let mem: usize = db.cols.values().map(|c| c.total_weight()).sum();
        vec![
            ("id".into(), db.config.server_id.clone()),
            ("following".into(), following),
            ("aof_size".into(), self.logical_aof_size(db).to_string()),
            ("num_collections".into(), db.cols.len().to_string()),
            ("num_objects".into(), num_objects.to_string()),
            ("num_points".into(), num_points.to_string()),
            ("in_memory_size".into(), mem.to_string()),
            (
                "read_only".into(),
                if db.config.read_only { "yes" } else { "no" }.into(),
            ),
            (
                "caught_up".into(),
                self.fcup.load(Ordering::SeqCst).to_string(),
            ),
            (
                "caught_up_once".into(),
                self.fcuponce.load(Ordering::SeqCst).to_string(),
            ),
        ]
    }

    /// SERVER: flat key/value pairs; the replication protocol parses this.
    pub(crate) fn cmd_server_info(&self, db: &Db, msg: &Message, start: Instant) -> Result<Value> {
        let pairs = self.server_pairs(db);
        Ok(match msg.output {
            OutputFormat::Resp => {
                let mut vals = Vec::with_capacity(pairs.len() * 2);
                for (k, v) in pairs {
                    vals.push(Value::from_str(k));
                    vals.push(Value::from_str(v));
                }
                Value::Array(vals)
            }
            OutputFormat::Json => {
                let body = pairs
                    .iter()
                    .map(|(k, v)| format!("{}:{}", json_string(k), json_string(v)))
                    .collect::<Vec<_>>()
                    .join(",");
                crate::msg::json_ok_with(&format!("\"stats\":{{{}}}", body), start)
            }
        })
    }

    /// INFO: the same facts in a sectioned text form.
    pub(crate) fn cmd_info(&self, db: &Db, msg: &Message, start: Instant) -> Result<Value> {
        let pairs = self.server_pairs(db);
        match msg.output {
            OutputFormat::Resp => {
                let mut text = String::from("# Server\r\n");
                for (k, v) in pairs {
                    text.push_str(&format!("{}:{}\r\n", k, v));
                }
                Ok(Value::from_str(text))
            }
            OutputFormat::Json => self.cmd_server_info(db, msg, start),
        }
    }

    /// OUTPUT [json|resp]: report or switch the reply encoding for this
    /// connection.
    pub(crate) fn cmd_output(&self, msg: &mut Message, start: Instant) -> Result<Value> {
        match msg.args.get(1).map(|s| s.to_lowercase()) {
            None => Ok(match msg.output {
                OutputFormat::Json => crate::msg::json_ok_with("\"output\":\"json\"", start),
                OutputFormat::Resp => Value::from_str("resp"),
            }),
            Some(kind) => {
                match kind.as_str() {
                    "json" => msg.output = OutputFormat::Json,
                    "resp" => msg.output = OutputFormat::Resp,
                    other => return Err(Error::invalid_argument(other)),
                }
                Ok(ok_message(msg, start))
            }
        }
    }

    /// CLIENT: connection introspection lives in the wire server, which is
    /// outside this core; only the subcommand surface exists here.
    pub(crate) fn cmd_client(&self, msg: &Message, _start: Instant) -> Result<Value> {
        match msg.args.get(1).map(|s| s.to_lowercase()).as_deref() {
            Some("list") => Ok(Value::Bulk(Vec::new())),
            Some("id") => Ok(Value::Integer(0)),
            Some(other) => Err(Error::invalid_argument(other)),
            None => Err(Error::InvalidNumberOfArguments),
        }
    }

    /// CONFIG GET/SET/REWRITE over the mutable knobs.
    pub(crate) fn cmd_config(&self, msg: &Message, start: Instant) -> Result<Value> {
        let args = &msg.args[1..];
        let (rest, sub) = tokenval(args).ok_or(Error::InvalidNumberOfArguments)?;
        match sub.to_lowercase().as_str() {
            "get" => {
                let (rest, name) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
                if !rest.is_empty() {
                    return Err(Error::InvalidNumberOfArguments);
                }
                let db = self.db.read();
                let value = match name.to_lowercase().as_str() {
                    "maxmemory" => db.config.max_memory.to_string(),
                    "readonly" => if db.config.read_only { "yes" } else { "no" }.to_string(),
                    other => return Err(Error::invalid_argument(other)),
                };
                Ok(match msg.output {
                    OutputFormat::Resp => Value::Array(vec![
                        Value::from_str(name),
                        Value::from_str(value),
                    ]),
                    OutputFormat::Json => crate::msg::json_ok_with(
                        &format!(
                            "\"properties\":{{{}:{}}}",
                            json_string(&name.to_lowercase()),
                            json_string(&value)
                        ),
                        start,
                    ),
                })
            }
            "set" => {
                let (rest, name) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
                let (rest, value) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
                if !rest.is_empty() {
                    return Err(Error::InvalidNumberOfArguments);
                }
                let _w = self.sched.write();
                let mut db = self.db.write();
                match name.to_lowercase().as_str() {
                    "maxmemory" => {
                        db.config.max_memory = value
                            .parse::<u64>()
                            .map_err(|_| Error::invalid_argument(value))?;
                        db.config.save(&self.dir)?;
                        self.update_oom(&db);
                    }
                    "readonly" => {
                        db.config.read_only = match value.to_lowercase().as_str() {
                            "yes" | "true" | "1" => true,
                            "no" | "false" | "0" => false,
                            other => return Err(Error::invalid_argument(other)),
                        };
                        db.config.save(&self.dir)?;
                    }
                    other => return Err(Error::invalid_argument(other)),
                }
                Ok(ok_message(msg, start))
            }
            "rewrite" => {
                let db = self.db.read();
                db.config.save(&self.dir)?;
                Ok(ok_message(msg, start))
            }
            other => Err(Error::invalid_argument(other)),
        }
    }

    /// READONLY yes|no.
    pub(crate) fn cmd_readonly(&self, msg: &Message, start: Instant) -> Result<Value> {
        let arg = msg
            .args
            .get(1)
            .map(|s| s.to_lowercase())
            .ok_or(Error::InvalidNumberOfArguments)?;
        let _w = self.sched.write();
        let mut db = self.db.write();
        db.config.read_only = match arg.as_str() {
            "yes" => true,
            "no" => false,
            other => return Err(Error::invalid_argument(other)),
        };
        db.config.save(&self.dir)?;
        Ok(ok_message(msg, start))
    }
}

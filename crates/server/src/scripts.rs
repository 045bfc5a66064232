//! The script host.
//!
//! Three execution contexts with distinct semantics:
//!
//! | Mode       | Lock                | Writes |
//! |------------|---------------------|--------|
//! | EVAL       | holds the writer    | yes, AOF records appended at end |
//! | EVALRO     | holds a reader      | no ("read only") |
//! | EVALNA     | acquires per call   | yes |
//!
//! The language runtime itself is external: embedders supply a
//! [`ScriptRuntime`] and every `call` a script makes funnels back into the
//! command dispatch, minus a closed list of commands that are not supported
//! in scripts. Sources are cached by hex-of-SHA1 in a component-owned map.

use crate::msg::{ConnType, Message, OutputFormat};
use crate::scanner::WhereEvalFn;
use crate::server::{is_read_command, is_write_command, Db, Server};
use meridian_core::error::{Error, Result};
use meridian_txn::Status;
use meridian_wire::{json_string, Value};
use sha1::{Digest, Sha1};
use std::sync::atomic::Ordering;
use std::time::Instant;

/// An embedded script engine. `keys`/`argv` follow EVAL conventions; every
/// command the script issues goes through `host`.
pub trait ScriptRuntime: Send + Sync {
    fn eval(
        &self,
        source: &str,
        keys: &[String],
        argv: &[String],
        host: &mut dyn ScriptCall,
    ) -> Result<Value>;
}

/// Dispatch surface handed to a running script.
pub trait ScriptCall {
    fn call(&mut self, args: Vec<String>) -> Result<Value>;
}

/// Commands scripts may never issue.
const NOT_IN_SCRIPTS: &[&str] = &[
    "follow", "aof", "aofmd5", "aofsync", "aofshrink", "readonly", "config", "output", "client",
    "script", "eval", "evalsha", "evalro", "evalrosha", "evalna", "evalnasha", "savesnapshot",
    "loadsnapshot", "replconf", "shutdown",
];

pub(crate) fn sha1_hex(source: &str) -> String {
    let digest = Sha1::digest(source.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Truthiness of a script result, used by WHEREEVAL.
pub(crate) fn value_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Integer(n) => *n != 0,
        Value::Simple(s) | Value::Error(s) => !matches!(s.as_str(), "" | "0" | "false"),
        Value::Bulk(b) => !matches!(&b[..], b"" | b"0" | b"false"),
        Value::Array(vals) => !vals.is_empty(),
    }
}

fn check_deadline(deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(Error::Deadline),
        _ => Ok(()),
    }
}

fn check_banned(name: &str) -> Result<()> {
    if NOT_IN_SCRIPTS.contains(&name) {
        Err(Error::UnsupportedInScripts(name.to_string()))
    } else {
        Ok(())
    }
}

/// Script host for EVAL: the writer role is already held, write commands
/// apply immediately and their AOF records are collected for the end of the
/// script.
struct AtomicHost<'a, 'b> {
    server: &'a Server,
    db: &'b mut Db,
    deadline: Option<Instant>,
    pending: Vec<Vec<String>>,
}

impl ScriptCall for AtomicHost<'_, '_> {
    fn call(&mut self, args: Vec<String>) -> Result<Value> {
        check_deadline(self.deadline)?;
        let name = args.first().map(|s| s.to_lowercase()).unwrap_or_default();
        check_banned(&name)?;
        if is_write_command(&name) {
            if self.server.following.load(Ordering::SeqCst) {
                return Err(Error::NotLeader);
            }
            if self.db.config.read_only {
                return Err(Error::ReadOnly);
            }
            let msg = Message::new(args.clone()).with_conn(ConnType::Script);
            let (value, mutated) = self.server.apply_write(self.db, &msg, &name)?;
            if mutated {
                self.pending.push(args);
            }
            Ok(value)
        } else if is_read_command(&name) {
            if self.server.following.load(Ordering::SeqCst)
                && !self.server.fcuponce.load(Ordering::SeqCst)
            {
                return Err(Error::CatchingUp);
            }
            let msg = Message::new(args).with_conn(ConnType::Script);
            let status = match self.deadline {
                Some(deadline) => Status::background().with_deadline(deadline),
                None => Status::background(),
            };
            self.server
                .dispatch_read(self.db, &msg, &name, &status, Instant::now())
        } else {
            Err(Error::UnsupportedInScripts(name))
        }
    }
}

/// Script host for EVALRO: reader role, writes rejected.
struct ReadOnlyHost<'a, 'b> {
    server: &'a Server,
    db: &'b Db,
    deadline: Option<Instant>,
}

impl ScriptCall for ReadOnlyHost<'_, '_> {
    fn call(&mut self, args: Vec<String>) -> Result<Value> {
        check_deadline(self.deadline)?;
        let name = args.first().map(|s| s.to_lowercase()).unwrap_or_default();
        check_banned(&name)?;
        if is_write_command(&name) {
            return Err(Error::ReadOnly);
        }
        if !is_read_command(&name) {
            return Err(Error::UnsupportedInScripts(name));
        }
        if self.server.following.load(Ordering::SeqCst)
            && !self.server.fcuponce.load(Ordering::SeqCst)
        {
            return Err(Error::CatchingUp);
        }
        let msg = Message::new(args).with_conn(ConnType::Script);
        let status = match self.deadline {
            Some(deadline) => Status::background().with_deadline(deadline),
            None => Status::background(),
        };
        self.server
            .dispatch_read(self.db, &msg, &name, &status, Instant::now())
    }
}

/// Script host for EVALNA: every call acquires on its own, so one script may
/// see many scheduler transitions.
struct NonAtomicHost<'a> {
    server: &'a Server,
    deadline: Option<Instant>,
}

impl ScriptCall for NonAtomicHost<'_> {
    fn call(&mut self, args: Vec<String>) -> Result<Value> {
        check_deadline(self.deadline)?;
        let name = args.first().map(|s| s.to_lowercase()).unwrap_or_default();
        check_banned(&name)?;
        let mut msg = Message::new(args).with_conn(ConnType::Script);
        if let Some(deadline) = self.deadline {
            msg = msg.with_deadline(deadline);
        }
        self.server.command(&mut msg)
    }
}

impl Server {
    /// SCRIPT LOAD / EXISTS / FLUSH.
    pub(crate) fn cmd_script(&self, msg: &Message, start: Instant) -> Result<Value> {
        let sub = msg
            .args
            .get(1)
            .map(|s| s.to_lowercase())
            .ok_or(Error::InvalidNumberOfArguments)?;
        match sub.as_str() {
            "load" => {
                let source = msg
                    .args
                    .get(2)
                    .ok_or(Error::InvalidNumberOfArguments)?
                    .clone();
                let sha = sha1_hex(&source);
                self.scripts.lock().insert(sha.clone(), source);
                Ok(match msg.output {
                    OutputFormat::Json => crate::msg::json_ok_with(
                        &format!("\"result\":{}", json_string(&sha)),
                        start,
                    ),
                    OutputFormat::Resp => Value::from_str(sha),
                })
            }
            "exists" => {
                let cache = self.scripts.lock();
                let flags: Vec<Value> = msg.args[2..]
                    .iter()
                    .map(|sha| Value::Integer(cache.contains_key(sha.as_str()) as i64))
                    .collect();
                Ok(Value::Array(flags))
            }
            "flush" => {
                self.scripts.lock().clear();
                Ok(crate::msg::ok_message(msg, start))
            }
            other => Err(Error::invalid_argument(other)),
        }
    }

    /// Resolve a cached script by its SHA1 hex digest.
    pub(crate) fn script_source(&self, sha: &str) -> Result<String> {
        self.scripts
            .lock()
            .get(&sha.to_lowercase())
            .cloned()
            .ok_or_else(|| Error::ScriptError("script not found".into()))
    }

    /// The EVAL family.
    pub(crate) fn cmd_eval(&self, msg: &Message, name: &str, start: Instant) -> Result<Value> {
        let by_sha = name.ends_with("sha");
        let args = &msg.args[1..];
        let script = args.first().ok_or(Error::InvalidNumberOfArguments)?;
        let numkeys: usize = args
            .get(1)
            .ok_or(Error::InvalidNumberOfArguments)?
            .parse()
            .map_err(|_| Error::invalid_argument(msg.args[2].as_str()))?;
        if args.len() < 2 + numkeys {
            return Err(Error::InvalidNumberOfArguments);
        }
        let keys: Vec<String> = args[2..2 + numkeys].to_vec();
        let argv: Vec<String> = args[2 + numkeys..].to_vec();

        let source = if by_sha {
            self.script_source(script)?
        } else {
            let sha = sha1_hex(script);
            self.scripts.lock().insert(sha, script.clone());
            script.clone()
        };
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| Error::ScriptError("scripting not configured".into()))?
            .clone();

        let result = if name.starts_with("evalro") {
            let (_guard, _status) = self.sched.scan();
            let db = self.db.read();
            let mut host = ReadOnlyHost {
                server: self,
                db: &*db,
                deadline: msg.deadline,
            };
            runtime.eval(&source, &keys, &argv, &mut host)
        } else if name.starts_with("evalna") {
            let mut host = NonAtomicHost {
                server: self,
                deadline: msg.deadline,
            };
            runtime.eval(&source, &keys, &argv, &mut host)
        } else {
            if self.aof_broken.load(Ordering::SeqCst) {
                return Err(Error::AofFailure("append-only file is broken".into()));
            }
            let _w = self.sched.write();
            let mut db = self.db.write();
            self.sweep_expired(&mut db);
            let (result, pending) = {
                let mut host = AtomicHost {
                    server: self,
                    db: &mut *db,
                    deadline: msg.deadline,
                    pending: Vec::new(),
                };
                let result = runtime.eval(&source, &keys, &argv, &mut host);
                (result, host.pending)
            };
            // mutations already applied stay applied, even when the script
            // failed afterwards; their records must reach the log
            for record in &pending {
                self.write_aof(&mut db, record)?;
            }
            self.flush_aof(&mut db)?;
            self.update_oom(&db);
            result
        };

        let value = result.map_err(|err| match err {
            Error::Deadline => Error::ScriptError("script timeout".into()),
            other => other,
        })?;
        Ok(match msg.output {
            OutputFormat::Resp => value,
            OutputFormat::Json => crate::msg::json_ok_with(
                &format!("\"result\":{}", value_to_json(&value)),
                start,
            ),
        })
    }

    /// Build a WHEREEVAL predicate. The runtime receives the command's own
    /// args as `keys` and `[id, field, value, ...]` as `argv`; the result's
    /// truthiness decides the match. Scripts used as filters cannot dispatch
    /// commands.
    pub(crate) fn whereeval_fn<'s>(
        &'s self,
        source: String,
        user_args: Vec<String>,
    ) -> WhereEvalFn<'s> {
        Box::new(move |id, fields| {
            let runtime = self
                .runtime
                .as_ref()
                .ok_or_else(|| Error::ScriptError("scripting not configured".into()))?;
            let mut argv = Vec::with_capacity(1 + fields.len() * 2);
            argv.push(id.to_string());
            let mut pairs: Vec<(&String, &f64)> = fields.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            for (name, value) in pairs {
                argv.push(name.clone());
                argv.push(crate::scanner::fmt_float(*value));
            }
            let mut host = DeniedCall;
            let value = runtime.eval(&source, &user_args, &argv, &mut host)?;
            Ok(value_truthy(&value))
        })
    }
}

/// Filter predicates run inside a read; they get no dispatch surface.
struct DeniedCall;

impl ScriptCall for DeniedCall {
    fn call(&mut self, _args: Vec<String>) -> Result<Value> {
        Err(Error::UnsupportedInScripts("call from filter".into()))
    }
}

fn value_to_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Integer(n) => n.to_string(),
        Value::Simple(s) => json_string(s),
        Value::Error(s) => format!("{{\"err\":{}}}", json_string(s)),
        Value::Bulk(b) => json_string(&String::from_utf8_lossy(b)),
        Value::Array(vals) => {
            let inner: Vec<String> = vals.iter().map(value_to_json).collect();
            format!("[{}]", inner.join(","))
        }
    }
}

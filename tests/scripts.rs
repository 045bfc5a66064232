//! Script host behavior with a miniature line-oriented runtime: each script
//! line is a command dispatched through the host; the last reply is the
//! script's result. A line of the form `if-field <name> <min>` turns the
//! runtime into a WHEREEVAL predicate over the supplied field pairs.

mod common;

use common::{cmd, must, render};
use meridian::{Error, ScriptCall, ScriptRuntime, Server, Value};
use std::sync::Arc;

struct LineRuntime;

impl ScriptRuntime for LineRuntime {
    fn eval(
        &self,
        source: &str,
        keys: &[String],
        argv: &[String],
        host: &mut dyn ScriptCall,
    ) -> meridian::Result<Value> {
        // predicate form used by the WHEREEVAL tests: argv is
        // [id, field, value, ...]; keys carry the user's arguments
        if let Some(rest) = source.strip_prefix("if-field ") {
            let mut parts = rest.split_whitespace();
            let field = parts.next().unwrap_or_default();
            let min: f64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            // argv[0] is the id; the rest are name/value pairs
            let value = argv[1..]
                .chunks(2)
                .find(|pair| pair.first().map(String::as_str) == Some(field))
                .and_then(|pair| pair.get(1))
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
            return Ok(Value::Integer((value >= min) as i64));
        }
        if source == "boom" {
            return Err(Error::ScriptError("boom".into()));
        }
        let mut last = Value::Null;
        for line in source.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut args: Vec<String> = line.split_whitespace().map(String::from).collect();
            // $1..$n substitute the EVAL keys
            for arg in &mut args {
                if let Some(n) = arg.strip_prefix('$').and_then(|s| s.parse::<usize>().ok()) {
                    if let Some(key) = keys.get(n - 1) {
                        *arg = key.clone();
                    }
                }
            }
            last = host.call(args)?;
        }
        Ok(last)
    }
}

fn script_server(dir: &tempfile::TempDir) -> Arc<Server> {
    Server::open_with_runtime(dir.path(), Some(Arc::new(LineRuntime))).unwrap()
}

#[test]
fn test_eval_atomic_writes_persist() {
    let dir = tempfile::tempdir().unwrap();
    {
        let server = script_server(&dir);
        let reply = must(&server, &[
            "EVAL",
            "SET fleet $1 POINT 33 -115\nGET fleet $1 POINT",
            "1",
            "truck1",
        ]);
        assert_eq!(render(&reply), "[33 -115]");
        assert_eq!(render(&must(&server, &["GET", "fleet", "truck1", "POINT"])), "[33 -115]");
        server.close();
    }
    // the script's write went through the AOF
    let server = script_server(&dir);
    assert_eq!(render(&must(&server, &["GET", "fleet", "truck1", "POINT"])), "[33 -115]");
    server.close();
}

#[test]
fn test_eval_failure_keeps_prior_writes() {
    let dir = tempfile::tempdir().unwrap();
    {
        let server = script_server(&dir);
        let err = cmd(&server, &[
            "EVAL",
            "SET fleet a POINT 1 1\nNOSUCHCOMMAND x",
            "0",
        ])
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedInScripts(_)));
        // the write that happened before the failure remains
        assert_eq!(render(&must(&server, &["GET", "fleet", "a", "POINT"])), "[1 1]");
        server.close();
    }
    // and it must have reached the log despite the failure
    let server = script_server(&dir);
    assert_eq!(render(&must(&server, &["GET", "fleet", "a", "POINT"])), "[1 1]");
    server.close();
}

#[test]
fn test_evalro_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let server = script_server(&dir);
    must(&server, &["SET", "fleet", "truck1", "POINT", "33", "-115"]);

    let reply = must(&server, &["EVALRO", "GET fleet truck1 POINT", "0"]);
    assert_eq!(render(&reply), "[33 -115]");

    assert!(matches!(
        cmd(&server, &["EVALRO", "SET fleet truck2 POINT 1 1", "0"]),
        Err(Error::ReadOnly)
    ));
    server.close();
}

#[test]
fn test_evalna_acquires_per_call() {
    let dir = tempfile::tempdir().unwrap();
    let server = script_server(&dir);
    let reply = must(&server, &[
        "EVALNA",
        "SET fleet a POINT 1 1\nSET fleet b POINT 2 2\nSCAN fleet COUNT",
        "0",
    ]);
    assert_eq!(render(&reply), "2");
    server.close();
}

#[test]
fn test_banned_commands_in_scripts() {
    let dir = tempfile::tempdir().unwrap();
    let server = script_server(&dir);
    for script in ["FOLLOW no one", "AOFSHRINK", "EVAL x 0", "CONFIG GET maxmemory"] {
        let err = cmd(&server, &["EVAL", script, "0"]).unwrap_err();
        assert!(
            matches!(err, Error::UnsupportedInScripts(_)),
            "{} should be refused, got {:?}",
            script,
            err
        );
    }
    server.close();
}

#[test]
fn test_script_cache_and_sha_variants() {
    let dir = tempfile::tempdir().unwrap();
    let server = script_server(&dir);

    let sha = render(&must(&server, &["SCRIPT", "LOAD", "PING"]));
    assert_eq!(sha.len(), 40);
    let flags = must(&server, &["SCRIPT", "EXISTS", &sha, "0000"]);
    assert_eq!(render(&flags), "[1 0]");

    // EVALSHA has to be able to run what SCRIPT LOAD stored; PING is not a
    // read or write, so it is refused inside scripts, proving dispatch ran
    let err = cmd(&server, &["EVALSHA", &sha, "0"]).unwrap_err();
    assert!(matches!(err, Error::UnsupportedInScripts(_)));

    must(&server, &["SCRIPT", "FLUSH"]);
    let err = cmd(&server, &["EVALSHA", &sha, "0"]).unwrap_err();
    assert!(matches!(err, Error::ScriptError(_)));

    // plain EVAL populates the cache as it runs
    must(&server, &["SET", "k", "a", "POINT", "1", "1"]);
    must(&server, &["EVAL", "GET k a POINT", "0"]);
    let sha2 = render(&must(&server, &["SCRIPT", "LOAD", "GET k a POINT"]));
    let flags = must(&server, &["SCRIPT", "EXISTS", &sha2]);
    assert_eq!(render(&flags), "[1]");
    server.close();
}

#[test]
fn test_script_error_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let server = script_server(&dir);
    let err = cmd(&server, &["EVAL", "boom", "0"]).unwrap_err();
    assert!(matches!(err, Error::ScriptError(_)));
    server.close();
}

#[test]
fn test_whereeval_filters_scan() {
    let dir = tempfile::tempdir().unwrap();
    let server = script_server(&dir);
    for (id, speed) in [("slow", "10"), ("mid", "50"), ("fast", "90")] {
        must(&server, &["SET", "fleet", id, "FIELD", "speed", speed, "POINT", "1", "1"]);
    }
    let reply = must(&server, &[
        "SCAN", "fleet", "WHEREEVAL", "if-field speed 40", "0", "IDS",
    ]);
    assert_eq!(common::ids_of(&reply), vec!["fast", "mid"]);
    server.close();
}

#[test]
fn test_whereeval_without_runtime_fails() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(dir.path()).unwrap(); // no runtime
    must(&server, &["SET", "fleet", "a", "FIELD", "speed", "10", "POINT", "1", "1"]);
    let err = cmd(&server, &["SCAN", "fleet", "WHEREEVAL", "if-field speed 1", "0", "IDS"])
        .unwrap_err();
    assert!(matches!(err, Error::ScriptError(_)));
    server.close();
}

//! Inbound command messages and reply helpers.

use meridian_wire::{format_elapsed, Value};
use std::time::Instant;

/// Reply encoding requested by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Resp,
    Json,
}

/// Where a command came from. Replayed commands suppress AOF side effects;
/// follower-applied commands bypass the leader check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Client,
    Replay,
    Follower,
    Script,
}

/// One inbound command.
#[derive(Debug)]
pub struct Message {
    pub args: Vec<String>,
    pub output: OutputFormat,
    pub deadline: Option<Instant>,
    pub conn: ConnType,
}

impl Message {
    pub fn new(args: Vec<String>) -> Message {
        Message {
            args,
            output: OutputFormat::Resp,
            deadline: None,
            conn: ConnType::Client,
        }
    }

    pub fn json(mut self) -> Message {
        self.output = OutputFormat::Json;
        self
    }

    pub fn with_conn(mut self, conn: ConnType) -> Message {
        self.conn = conn;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Message {
        self.deadline = Some(deadline);
        self
    }

    /// The lowercased command name.
    pub fn command(&self) -> String {
        self.args.first().map(|s| s.to_lowercase()).unwrap_or_default()
    }
}

/// Pop the next token off an argument slice.
pub fn tokenval(args: &[String]) -> Option<(&[String], &str)> {
    args.split_first()
        .map(|(tok, rest)| (rest, tok.as_str()))
}

/// The standard OK reply for the message's output format.
pub fn ok_message(msg: &Message, start: Instant) -> Value {
    match msg.output {
        OutputFormat::Json => Value::Bulk(
            format!(
                r#"{{"ok":true,"elapsed":"{}"}}"#,
                format_elapsed(start.elapsed())
            )
            .into_bytes(),
        ),
        OutputFormat::Resp => Value::Simple("OK".into()),
    }
}

/// A JSON reply with extra members spliced between `"ok":true` and
/// `"elapsed"`.
pub fn json_ok_with(extra: &str, start: Instant) -> Value {
    Value::Bulk(
        format!(
            r#"{{"ok":true{}{},"elapsed":"{}"}}"#,
            if extra.is_empty() { "" } else { "," },
            extra.trim_start_matches(','),
            format_elapsed(start.elapsed())
        )
        .into_bytes(),
    )
}

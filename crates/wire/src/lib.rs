//! RESP wire values and framing.
//!
//! The append-only log is a sequence of RESP arrays of bulk strings,
//! byte-identical to the Redis serialization protocol, so this reader/writer
//! pair is shared by the AOF, the replication listener, and the follower's
//! leader connection. Payloads are opaque bytes; UTF-8 is not assumed.

#![warn(clippy::all)]

mod conn;
mod json;
mod resp;

pub use conn::RespConn;
pub use json::{format_elapsed, json_string};
pub use resp::{append_array, write_value, Reader, Value};

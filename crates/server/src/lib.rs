//! The Meridian server core.
//!
//! One [`Server`] owns the keyspace (named collections), the scheduler that
//! coordinates readers and writers, the append-only log, snapshots, and the
//! replication roles. Commands arrive as token vectors through
//! [`Server::command`]; the wire protocol server that produces them is an
//! external collaborator.

#![warn(clippy::all)]

mod aof;
mod aofshrink;
mod checksum;
mod config;
mod crud;
mod expire;
mod follow;
mod info;
mod json_cmds;
mod msg;
mod repl;
mod scan;
mod scanner;
mod scripts;
mod search;
mod server;
mod snapshot;

pub use config::Config;
pub use msg::{ok_message, tokenval, ConnType, Message, OutputFormat};
pub use scripts::{ScriptCall, ScriptRuntime};
pub use server::Server;
pub use snapshot::SnapshotMeta;

//! # Meridian
//!
//! An in-memory geospatial database: geo-tagged objects in named
//! collections, R-tree indexed spatial queries, a replicated RESP-framed
//! append-only log, binary snapshots, and an embedded-script host.
//!
//! # Quick start
//!
//! ```no_run
//! use meridian::{Message, Server};
//!
//! fn main() -> meridian::Result<()> {
//!     let server = Server::open("./data")?;
//!
//!     let mut msg = Message::new(
//!         ["SET", "fleet", "truck1", "POINT", "33", "-115"]
//!             .map(String::from)
//!             .to_vec(),
//!     );
//!     server.command(&mut msg)?;
//!
//!     let mut msg = Message::new(
//!         ["NEARBY", "fleet", "IDS", "POINT", "33", "-115", "5000"]
//!             .map(String::from)
//!             .to_vec(),
//!     );
//!     let reply = server.command(&mut msg)?;
//!     println!("{:?}", reply);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! [`Server`] is the entry point; commands are token vectors and replies are
//! RESP [`Value`]s (or a JSON envelope, per [`Message`]'s output format).
//! The internal crates (core geometry, collections, the scheduler,
//! durability, replication) back that surface.

pub use meridian_core::{error::Result, Error, Object};
pub use meridian_server::{
    ok_message, Config, ConnType, Message, OutputFormat, ScriptCall, ScriptRuntime, Server,
    SnapshotMeta,
};
pub use meridian_wire::Value;

/// Lower-level building blocks, re-exported for embedders that need them.
pub mod core {
    pub use meridian_collection::{AreaExpression, Collection, Cursor};
    pub use meridian_core::{dist, geohash, geojson, geometry, glob, json, tiles};
    pub use meridian_txn::{Scheduler, Status, TxnError};
}

//! Reader/writer coordination for Meridian.
//!
//! One [`Scheduler`] instance guards all server state. Unlimited readers run
//! concurrently until a writer arrives; the writer publishes a read deadline,
//! long scans observe it at their cooperative poll points and abort (or
//! retry), and the writer phase begins once in-flight readers drain. Writers
//! run serially, bounded by a write deadline so paused readers are never
//! starved, and the delay granted to readers adapts to whether any scan
//! actually had to be interrupted.
//!
//! [`Status`] is the per-operation control record: an optional deadline, an
//! error slot, and a back-reference to the scheduler for interruption checks.

#![warn(clippy::all)]

mod scheduler;
mod status;

pub use scheduler::{ReadGuard, Scheduler, WriteGuard};
pub use status::{monotime, Status, TxnError};

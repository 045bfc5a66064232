//! Per-operation status: deadline, abort state, scheduler back-reference.

use crate::scheduler::Scheduler;
use std::cell::Cell;
use std::sync::OnceLock;
use std::time::Instant;
use thiserror::Error;

/// Errors a transaction status can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TxnError {
    /// The scheduler was closed (server shutdown).
    #[error("closed")]
    Closed,
    /// A pending writer interrupted this scan. Retryable.
    #[error("interrupted")]
    Interrupted,
    /// The operation's own deadline passed.
    #[error("deadline passed")]
    Deadline,
}

const ERR_CODE_MASK: i64 = 0x3;
const DEADLINE_MASK: i64 = !ERR_CODE_MASK;
const CODE_CLOSED: i64 = 1;
const CODE_INTERRUPTED: i64 = 2;
const CODE_DEADLINE: i64 = 3;

/// Nanoseconds on the process-local monotonic clock. All scheduler deadlines
/// live on this clock so they can be published through plain atomics.
pub fn monotime() -> i64 {
    static BASE: OnceLock<Instant> = OnceLock::new();
    let base = BASE.get_or_init(Instant::now);
    base.elapsed().as_nanos() as i64
}

/// Control record for one operation.
///
/// The deadline and error code share one word: the low two bits hold the
/// error code, the rest the monotonic deadline (losing 4 ns of precision).
/// Statuses are used from a single thread; the scheduler's published state is
/// what crosses threads.
pub struct Status<'a> {
    sched: Option<&'a Scheduler>,
    state: Cell<i64>,
    /// Set for scans that got a full time slice; an observed interruption is
    /// reported back to the scheduler for its adaptive write delay.
    signal_interrupt: Cell<bool>,
    /// Extra time granted beyond the published read deadline. Grows
    /// exponentially with each retry so a repeatedly interrupted scan can
    /// still make progress.
    grace: Cell<i64>,
}

impl<'a> Status<'a> {
    /// A status with no deadline and no scheduler: never aborts. Used by
    /// AOF replay and other offline paths.
    pub fn background() -> Status<'static> {
        Status {
            sched: None,
            state: Cell::new(0),
            signal_interrupt: Cell::new(false),
            grace: Cell::new(0),
        }
    }

    pub(crate) fn new(sched: &'a Scheduler, signal_interrupt: bool) -> Status<'a> {
        Status {
            sched: Some(sched),
            state: Cell::new(0),
            signal_interrupt: Cell::new(signal_interrupt),
            grace: Cell::new(0),
        }
    }

    /// Attach an absolute deadline. An existing earlier deadline wins.
    pub fn with_deadline(self, deadline: Instant) -> Self {
        let now = Instant::now();
        let nanos = if deadline <= now {
            monotime() // already due
        } else {
            monotime() + (deadline - now).as_nanos() as i64
        };
        let masked = nanos & DEADLINE_MASK;
        let state = self.state.get();
        let existing = state & DEADLINE_MASK;
        if existing == 0 || masked < existing {
            self.state.set(masked | (state & ERR_CODE_MASK));
        }
        self
    }

    /// Whether the operation should stop: its deadline passed, or the
    /// scheduler signaled interruption.
    pub fn is_aborted(&self) -> bool {
        self.error().is_some()
    }

    /// The abort reason, if any.
    pub fn error(&self) -> Option<TxnError> {
        self.update_if_needed();
        match self.state.get() & ERR_CODE_MASK {
            CODE_CLOSED => Some(TxnError::Closed),
            CODE_INTERRUPTED => Some(TxnError::Interrupted),
            CODE_DEADLINE => Some(TxnError::Deadline),
            _ => None,
        }
    }

    /// Clear a recorded error, keeping the deadline.
    pub fn reset_error(&self) {
        self.state.set(self.state.get() & DEADLINE_MASK);
    }

    /// Drop the reader slot, let pending writers run, then re-acquire with an
    /// exponentially increased grace period. For scans that can restart at
    /// their cursor.
    pub fn retry(&self, guard: &mut crate::scheduler::ReadGuard<'a>) {
        let sched = self.sched.expect("retry requires a scheduler-backed status");
        guard.release();
        let grace = self.grace.get();
        let next = if grace == 0 {
            10_000_000 // 10ms
        } else {
            (grace * 2).min(1_000_000_000) // up to 1s
        };
        self.grace.set(next);
        self.reset_error();
        *guard = sched.read();
    }

    fn update_if_needed(&self) {
        let state = self.state.get();
        if state & ERR_CODE_MASK != 0 {
            return;
        }
        let now = monotime();
        let deadline = state & DEADLINE_MASK;
        if deadline != 0 && now >= deadline {
            self.state.set(state | CODE_DEADLINE);
            return;
        }
        if let Some(sched) = self.sched {
            if sched.is_closed() {
                self.state.set(state | CODE_CLOSED);
                return;
            }
            let read_deadline = sched.read_deadline();
            if read_deadline != 0 && now >= read_deadline + self.grace.get() {
                self.state.set(state | CODE_INTERRUPTED);
                if self.signal_interrupt.get() {
                    sched.notify_interrupted();
                    self.signal_interrupt.set(false);
                }
            }
        }
    }
}

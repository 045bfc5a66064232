//! The reader/writer scheduler.
//!
//! The fast paths are single atomic operations. A pending write shifts the
//! reader counter by `-MAX_READERS`, which simultaneously tells arriving
//! readers to take the slow path and lets the writer compute the in-flight
//! reader count it must wait out. Paused readers queue on a condition
//! variable until the write phase ends; active scanners observe the published
//! read deadline at their poll points and stop voluntarily.

use crate::status::{monotime, Status};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::time::Duration;

const MAX_READERS: i32 = 1 << 30;

struct SchedState {
    /// Readers parked waiting for the write phase to end.
    paused_readers: i32,
    /// Writers executing or waiting.
    writer_count: i32,
    /// When the current write phase must yield back to paused readers.
    write_deadline: i64,
    /// Write phase in progress.
    writing: bool,
    /// Time granted to readers to finish before a write phase begins.
    /// Adapted after every phase.
    write_delay: Duration,
}

/// Reader/writer coordinator guaranteeing write progress under long scans.
pub struct Scheduler {
    /// Deadline for reads to complete before the pending write phase;
    /// published atomically, zero when no write is pending.
    read_deadline: AtomicI64,
    /// Whether any reader had to be interrupted to enter the write phase.
    interrupted: AtomicBool,
    /// Executing readers; shifted by `-MAX_READERS` while a write is pending.
    reader_count: AtomicI32,
    closed: AtomicBool,

    sync: Mutex<SchedState>,
    /// Broadcast when the write phase completes.
    end_writes: Condvar,
    /// Signaled when a write completes and more writes are pending.
    writer_done: Condvar,
    /// Signaled when the in-flight reader count reaches zero.
    no_readers: Condvar,

    /// Bound on the time spent inside one write phase while readers wait.
    read_delay: Duration,
}

impl Scheduler {
    /// `initial_write_delay` seeds the adaptive grace given to readers before
    /// a write phase begins; `max_read_delay` bounds how long a write phase
    /// may run while readers are paused.
    pub fn new(initial_write_delay: Duration, max_read_delay: Duration) -> Self {
        Scheduler {
            read_deadline: AtomicI64::new(0),
            interrupted: AtomicBool::new(false),
            reader_count: AtomicI32::new(0),
            closed: AtomicBool::new(false),
            sync: Mutex::new(SchedState {
                paused_readers: 0,
                writer_count: 0,
                write_deadline: 0,
                writing: false,
                write_delay: initial_write_delay,
            }),
            end_writes: Condvar::new(),
            writer_done: Condvar::new(),
            no_readers: Condvar::new(),
            read_delay: max_read_delay,
        }
    }

    /// Acquire a reader slot.
    pub fn read(&self) -> ReadGuard<'_> {
        let n = self.reader_count.fetch_add(1, Ordering::SeqCst) + 1;
        if n < 0 {
            // a write is pending
            self.exec_read_slow();
        }
        ReadGuard {
            sched: self,
            active: true,
        }
    }

    /// Acquire a reader slot for a long-running scan, with a status that
    /// observes the scheduler's interruption state.
    pub fn scan(&self) -> (ReadGuard<'_>, Status<'_>) {
        let n = self.reader_count.fetch_add(1, Ordering::SeqCst) + 1;
        if n < 0 {
            self.exec_read_slow();
            // entered during a write phase: partial slice, do not skew the
            // adaptive delay when this scan gets interrupted
            return (
                ReadGuard {
                    sched: self,
                    active: true,
                },
                Status::new(self, false),
            );
        }
        (
            ReadGuard {
                sched: self,
                active: true,
            },
            Status::new(self, true),
        )
    }

    /// Acquire the writer role. Writers run serially.
    pub fn write(&self) -> WriteGuard<'_> {
        let mut st = self.sync.lock();
        if st.writer_count > 0 {
            // another writer already shifted the reader counter
            self.exec_write_slow(&mut st);
            return WriteGuard { sched: self };
        }
        let prev = self.reader_count.fetch_sub(MAX_READERS, Ordering::SeqCst);
        if prev - st.paused_readers > 0 {
            // readers in flight
            self.exec_write_slow(&mut st);
            return WriteGuard { sched: self };
        }
        // uncontended fast path
        st.writing = true;
        st.writer_count += 1;
        WriteGuard { sched: self }
    }

    /// Mark the scheduler closed. Statuses begin reporting
    /// [`crate::TxnError::Closed`]; guards already held drain normally.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _st = self.sync.lock();
        self.end_writes.notify_all();
        self.writer_done.notify_all();
        self.no_readers.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn read_deadline(&self) -> i64 {
        self.read_deadline.load(Ordering::SeqCst)
    }

    pub(crate) fn notify_interrupted(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn exec_write_slow(&self, st: &mut MutexGuard<'_, SchedState>) {
        // one thread is responsible for initiating the write phase and then
        // signalling subsequent writers to run
        let mut write_initiator = false;

        if st.writer_count == 0 {
            // no other writes pending: deadline for scans to stop by
            let deadline = monotime() + st.write_delay.as_nanos() as i64;
            self.read_deadline.store(deadline, Ordering::SeqCst);
            write_initiator = true;
        }
        st.writer_count += 1;

        loop {
            if write_initiator {
                // wait for all readers to finish; the read deadline bounds
                // how long running scanners keep us here
                loop {
                    let readers =
                        self.reader_count.load(Ordering::SeqCst) + MAX_READERS - st.paused_readers;
                    if readers <= 0 {
                        break;
                    }
                    self.no_readers.wait(st);
                }
                st.write_deadline = monotime() + self.read_delay.as_nanos() as i64;
                st.writing = true;

                // adapt: double the delay if we had to interrupt a scan,
                // otherwise shrink it by a quarter
                if self
                    .interrupted
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    if st.write_delay < Duration::from_secs(60) {
                        st.write_delay *= 2;
                    }
                } else if st.write_delay > Duration::from_micros(1) {
                    st.write_delay = st.write_delay / 4 * 3;
                }
                return;
            }
            // wait for the current writer, then run, unless the write phase
            // has exceeded its deadline with readers waiting; in that case
            // end the phase and reinitiate
            self.writer_done.wait(st);
            let now = monotime();
            if st.write_deadline < now && st.paused_readers > 0 {
                st.writing = false;
                let deadline = now + st.write_delay.as_nanos() as i64;
                self.read_deadline.store(deadline, Ordering::SeqCst);
                write_initiator = true;
                self.end_writes.notify_all();
                continue;
            }
            return;
        }
    }

    fn exec_read_slow(&self) {
        let mut st = self.sync.lock();
        while st.writing {
            self.end_writes.wait(&mut st);
        }
        // writes are not active, but the published deadline may already have
        // passed with a writer still pending: pause until the phase runs
        let mut now = monotime();
        while st.writer_count > 0 && self.read_deadline.load(Ordering::SeqCst) <= now {
            st.paused_readers += 1;
            let readers = self.reader_count.load(Ordering::SeqCst) + MAX_READERS - st.paused_readers;
            if readers == 0 {
                self.no_readers.notify_one();
            }
            self.end_writes.wait(&mut st);
            st.paused_readers -= 1;
            now = monotime();
        }
    }

    fn complete_read(&self) {
        let r = self.reader_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if r < 0 {
            let st = self.sync.lock();
            let readers = self.reader_count.load(Ordering::SeqCst) + MAX_READERS - st.paused_readers;
            if readers == 0 {
                self.no_readers.notify_one();
            }
        }
    }

    fn complete_write(&self) {
        let mut st = self.sync.lock();
        st.writer_count -= 1;
        if st.writer_count == 0 {
            st.writing = false;
            self.reader_count.fetch_add(MAX_READERS, Ordering::SeqCst);
            self.read_deadline.store(0, Ordering::SeqCst);
            self.end_writes.notify_all();
        } else {
            self.writer_done.notify_one();
        }
    }
}

/// RAII reader slot.
pub struct ReadGuard<'a> {
    sched: &'a Scheduler,
    active: bool,
}

impl ReadGuard<'_> {
    /// Release the slot early (used by retry).
    pub fn release(&mut self) {
        if self.active {
            self.active = false;
            self.sched.complete_read();
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// RAII writer role.
pub struct WriteGuard<'a> {
    sched: &'a Scheduler,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.sched.complete_write();
    }
}

//! The server: keyspace, scheduler, dispatch.
//!
//! All state lives in [`Db`] behind one `RwLock`; the scheduler is the
//! admission controller in front of it. Write commands acquire the writer
//! role, mutate, append to the AOF and flush; read commands take a scan slot
//! and retry from their cursor when a pending writer interrupts them.

use crate::config::Config;
use crate::expire::ExpireIndex;
use crate::msg::{ok_message, ConnType, Message, OutputFormat};
use crate::scripts::ScriptRuntime;
use crate::snapshot::SnapshotMeta;
use meridian_collection::Collection;
use meridian_core::error::{Error, Result};
use meridian_core::Object;
use meridian_txn::{Scheduler, Status, TxnError};
use meridian_wire::Value;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant, SystemTime};
use tracing::{info, warn};

/// Notifies AOF tail connections that the flushed size advanced.
pub(crate) struct AofSignal {
    pub size: Mutex<u64>,
    pub cond: Condvar,
}

impl AofSignal {
    fn new() -> Self {
        AofSignal {
            size: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn publish(&self, size: u64) {
        let mut guard = self.size.lock();
        *guard = size;
        self.cond.notify_all();
    }

    /// Wait until the flushed size exceeds `after`, with a timeout so tail
    /// loops can observe disconnect requests.
    pub fn wait_beyond(&self, after: u64, timeout: Duration) -> u64 {
        let mut guard = self.size.lock();
        if *guard <= after {
            self.cond.wait_for(&mut guard, timeout);
        }
        *guard
    }
}

/// Everything the scheduler protects.
pub(crate) struct Db {
    pub cols: BTreeMap<String, Collection>,
    pub expires: ExpireIndex,
    pub config: Config,
    pub aof: Option<File>,
    pub aof_size: u64,
    pub aof_buf: Vec<u8>,
    pub shrinking: bool,
    pub shrink_log: Vec<Vec<String>>,
    pub snapshot_meta: SnapshotMeta,
}

/// The Meridian server core.
pub struct Server {
    pub(crate) dir: PathBuf,
    pub(crate) sched: Arc<Scheduler>,
    pub(crate) db: RwLock<Db>,
    pub(crate) scripts: Mutex<HashMap<String, String>>,
    pub(crate) runtime: Option<Arc<dyn ScriptRuntime>>,

    pub(crate) out_of_memory: AtomicBool,
    /// Set on the first AOF write failure; all further writes are rejected.
    pub(crate) aof_broken: AtomicBool,
    pub(crate) following: AtomicBool,
    /// Generation counter for follow loops; bumping it stops stale loops.
    pub(crate) followc: AtomicU64,
    /// Follower is caught up to the leader right now.
    pub(crate) fcup: AtomicBool,
    /// Follower finished its first full sync at least once.
    pub(crate) fcuponce: AtomicBool,
    /// Bumped to force replication connections to drop (AOF shrink).
    pub(crate) repl_epoch: AtomicU64,
    pub(crate) aof_signal: Arc<AofSignal>,
    pub(crate) shutdown: AtomicBool,
    /// Back-reference set at open; lets `&self` methods hand owned handles
    /// to spawned threads (follow loops).
    pub(crate) self_ref: OnceLock<Weak<Server>>,
}

impl Server {
    /// Open (or create) a server rooted at `dir`, replaying the append-only
    /// log into memory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Arc<Server>> {
        Self::open_with_runtime(dir, None)
    }

    /// Open with a script runtime for the EVAL family and WHEREEVAL.
    pub fn open_with_runtime(
        dir: impl AsRef<Path>,
        runtime: Option<Arc<dyn ScriptRuntime>>,
    ) -> Result<Arc<Server>> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let config = Config::load(&dir)?;
        let snapshot_meta = SnapshotMeta::load(&dir)?;
        let following = config.is_following();

        let server = Arc::new(Server {
            dir: dir.clone(),
            sched: Arc::new(Scheduler::new(
                Duration::from_millis(250),
                Duration::from_millis(250),
            )),
            db: RwLock::new(Db {
                cols: BTreeMap::new(),
                expires: ExpireIndex::new(),
                config,
                aof: None,
                aof_size: 0,
                aof_buf: Vec::new(),
                shrinking: false,
                shrink_log: Vec::new(),
                snapshot_meta,
            }),
            scripts: Mutex::new(HashMap::new()),
            runtime,
            out_of_memory: AtomicBool::new(false),
            aof_broken: AtomicBool::new(false),
            following: AtomicBool::new(following),
            followc: AtomicU64::new(0),
            fcup: AtomicBool::new(false),
            fcuponce: AtomicBool::new(false),
            repl_epoch: AtomicU64::new(0),
            aof_signal: Arc::new(AofSignal::new()),
            shutdown: AtomicBool::new(false),
            self_ref: OnceLock::new(),
        });
        server
            .self_ref
            .set(Arc::downgrade(&server))
            .expect("fresh server");

        server.open_aof()?;
        server.load_aof()?;

        if following {
            let (host, port) = {
                let db = server.db.read();
                (db.config.follow_host.clone(), db.config.follow_port)
            };
            info!(%host, port, "resuming follow");
            server.start_follow_thread(host, port);
        }
        Ok(server)
    }

    /// Stop accepting work. Held guards drain; follow loops and replication
    /// tails exit on their next poll.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.followc.fetch_add(1, Ordering::SeqCst);
        self.repl_epoch.fetch_add(1, Ordering::SeqCst);
        self.sched.close();
        self.aof_signal.publish(u64::MAX);
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn server_id(&self) -> String {
        self.db.read().config.server_id.clone()
    }

    // ------------------------------------------------------------------
    // dispatch
    // ------------------------------------------------------------------

    /// Execute one command. This is the single entry point for client
    /// connections, replication, replay, and scripts.
    pub fn command(&self, msg: &mut Message) -> Result<Value> {
        let start = Instant::now();
        let name = msg.command();
        if name.is_empty() {
            return Err(Error::InvalidNumberOfArguments);
        }
        if self.is_closed() && msg.conn != ConnType::Replay {
            return Err(Error::Closed);
        }
        if is_write_command(&name) {
            return self.execute_write(msg, &name);
        }
        if is_read_command(&name) {
            return self.execute_read(msg, &name, start);
        }
        match name.as_str() {
            "ping" => Ok(match msg.output {
                OutputFormat::Resp => Value::Simple("PONG".into()),
                OutputFormat::Json => ok_message(msg, start),
            }),
            "output" => self.cmd_output(msg, start),
            "client" => self.cmd_client(msg, start),
            "config" => self.cmd_config(msg, start),
            "readonly" => self.cmd_readonly(msg, start),
            "follow" => self.cmd_follow(msg, start),
            "aofmd5" => self.cmd_aofmd5(msg, start),
            "aofshrink" => self.cmd_aofshrink(msg, start),
            "savesnapshot" => self.cmd_savesnapshot(msg, start),
            "loadsnapshot" => self.cmd_loadsnapshot(msg, start),
            "snapshot" => self.cmd_snapshot_latest_meta(msg, start),
            "script" => self.cmd_script(msg, start),
            "eval" | "evalsha" | "evalro" | "evalrosha" | "evalna" | "evalnasha" => {
                self.cmd_eval(msg, &name, start)
            }
            "replconf" => Ok(ok_message(msg, start)),
            "aof" | "aofsync" => Err(Error::Protocol(
                "aof tailing requires a replication connection".into(),
            )),
            _ => Err(Error::invalid_argument(name.as_str())),
        }
    }

    fn execute_write(&self, msg: &mut Message, name: &str) -> Result<Value> {
        if self.aof_broken.load(Ordering::SeqCst) {
            return Err(Error::AofFailure("append-only file is broken".into()));
        }
        if msg.conn == ConnType::Replay {
            // startup replay runs single-threaded, before any reader exists
            let mut db = self.db.write();
            let (value, _) = self.apply_write(&mut db, msg, name)?;
            return Ok(value);
        }

        let _w = self.sched.write();
        let mut db = self.db.write();
        self.sweep_expired(&mut db);

        if matches!(msg.conn, ConnType::Client | ConnType::Script) {
            if db.config.read_only {
                return Err(Error::ReadOnly);
            }
            if db.config.is_following() {
                return Err(Error::NotLeader);
            }
            if self.out_of_memory.load(Ordering::SeqCst) && grows_memory(name) {
                return Err(Error::OutOfMemory);
            }
        }

        let (value, mutated) = self.apply_write(&mut db, msg, name)?;
        if mutated {
            self.write_aof(&mut db, &msg.args)?;
            if msg.conn == ConnType::Follower {
                if db.aof_buf.len() > 10240 {
                    self.flush_aof(&mut db)?;
                }
            } else {
                self.flush_aof(&mut db)?;
            }
            self.update_oom(&db);
        }
        Ok(value)
    }

    pub(crate) fn apply_write(
        &self,
        db: &mut Db,
        msg: &Message,
        name: &str,
    ) -> Result<(Value, bool)> {
        match name {
            "set" => self.cmd_set(db, msg),
            "fset" => self.cmd_fset(db, msg),
            "del" => self.cmd_del(db, msg),
            "pdel" => self.cmd_pdel(db, msg),
            "drop" => self.cmd_drop(db, msg),
            "rename" => self.cmd_rename(db, msg, false),
            "renamenx" => self.cmd_rename(db, msg, true),
            "expire" => self.cmd_expire(db, msg),
            "persist" => self.cmd_persist(db, msg),
            "flushdb" => self.cmd_flushdb(db, msg),
            "jset" => self.cmd_jset(db, msg),
            "jdel" => self.cmd_jdel(db, msg),
            other => Err(Error::invalid_argument(other)),
        }
    }

    fn execute_read(&self, msg: &Message, name: &str, start: Instant) -> Result<Value> {
        if msg.conn == ConnType::Client
            && self.following.load(Ordering::SeqCst)
            && !self.fcuponce.load(Ordering::SeqCst)
        {
            return Err(Error::CatchingUp);
        }
        let (mut guard, status) = self.sched.scan();
        let status = match msg.deadline {
            Some(deadline) => status.with_deadline(deadline),
            None => status,
        };
        loop {
            let db = self.db.read();
            match self.dispatch_read(&db, msg, name, &status, start) {
                Err(Error::Interrupted) => {
                    // drop the state lock before waiting out the writer,
                    // then restart the scan at its cursor
                    drop(db);
                    status.retry(&mut guard);
                }
                other => return other,
            }
        }
    }

    pub(crate) fn dispatch_read(
        &self,
        db: &Db,
        msg: &Message,
        name: &str,
        status: &Status,
        start: Instant,
    ) -> Result<Value> {
        match name {
            "get" => self.cmd_get(db, msg, start),
            "jget" => self.cmd_jget(db, msg, start),
            "bounds" => self.cmd_bounds(db, msg, start),
            "type" => self.cmd_type(db, msg, start),
            "ttl" => self.cmd_ttl(db, msg, start),
            "keys" => self.cmd_keys(db, msg, status, start),
            "stats" => self.cmd_stats(db, msg, start),
            "scan" => self.cmd_scan(db, msg, status, start),
            "search" => self.cmd_search(db, msg, status, start),
            "within" => self.cmd_within_or_intersects(db, msg, status, start, true),
            "intersects" => self.cmd_within_or_intersects(db, msg, status, start, false),
            "nearby" => self.cmd_nearby(db, msg, status, start),
            "test" => self.cmd_test(db, msg, start),
            "server" => self.cmd_server_info(db, msg, start),
            "info" => self.cmd_info(db, msg, start),
            other => Err(Error::invalid_argument(other)),
        }
    }

    // ------------------------------------------------------------------
    // shared helpers
    // ------------------------------------------------------------------

    pub(crate) fn get_col<'a>(&self, db: &'a Db, key: &str) -> Option<&'a Collection> {
        db.cols.get(key)
    }

    /// Remove a collection when its last item went away.
    pub(crate) fn drop_col_if_empty(&self, db: &mut Db, key: &str) {
        if db.cols.get(key).map_or(false, |c| c.count() == 0) {
            db.cols.remove(key);
        }
    }

    pub(crate) fn has_expired(&self, db: &Db, key: &str, id: &str) -> bool {
        db.expires.has_expired(key, id, SystemTime::now())
    }

    /// Physically remove items whose expiry has passed. Runs at writer
    /// entry, so observation stays lazy and reads never mutate.
    pub(crate) fn sweep_expired(&self, db: &mut Db) {
        let due = db.expires.sweep_due(SystemTime::now());
        for (key, id) in due {
            if let Some(col) = db.cols.get_mut(&key) {
                col.delete(&id);
            }
            self.drop_col_if_empty(db, &key);
        }
    }

    /// Area-expression lookup for the `GET key id` primitive; observes
    /// expiration like any other read.
    pub(crate) fn lookup_obj(&self, db: &Db, key: &str, id: &str) -> Result<Arc<Object>> {
        let col = db.cols.get(key).ok_or(Error::KeyNotFound)?;
        if self.has_expired(db, key, id) {
            return Err(Error::IdNotFound);
        }
        col.get(id).map(|(obj, _)| obj).ok_or(Error::IdNotFound)
    }

    pub(crate) fn update_oom(&self, db: &Db) {
        let max = db.config.max_memory;
        if max == 0 {
            self.out_of_memory.store(false, Ordering::SeqCst);
            return;
        }
        let total: u64 = db.cols.values().map(|c| c.total_weight() as u64).sum();
        if total > max {
            if !self.out_of_memory.swap(true, Ordering::SeqCst) {
                warn!(total, max, "memory cap exceeded, rejecting writes");
            }
        } else {
            self.out_of_memory.store(false, Ordering::SeqCst);
        }
    }
}

/// Commands that mutate state and are recorded in the AOF.
pub(crate) fn is_write_command(name: &str) -> bool {
    matches!(
        name,
        "set"
            | "fset"
            | "del"
            | "pdel"
            | "drop"
            | "rename"
            | "renamenx"
            | "expire"
            | "persist"
            | "flushdb"
            | "jset"
            | "jdel"
    )
}

/// Commands that only read state.
pub(crate) fn is_read_command(name: &str) -> bool {
    matches!(
        name,
        "get"
            | "jget"
            | "bounds"
            | "type"
            | "ttl"
            | "keys"
            | "stats"
            | "scan"
            | "search"
            | "within"
            | "intersects"
            | "nearby"
            | "test"
            | "server"
            | "info"
    )
}

/// Writes that can increase memory use; these are the ones the OOM flag
/// rejects.
fn grows_memory(name: &str) -> bool {
    matches!(name, "set" | "fset" | "jset")
}

pub(crate) fn txn_to_err(err: TxnError) -> Error {
    match err {
        TxnError::Closed => Error::Closed,
        TxnError::Interrupted => Error::Interrupted,
        TxnError::Deadline => Error::Deadline,
    }
}

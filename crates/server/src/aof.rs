//! The append-only log.
//!
//! Every applied write becomes one RESP array of bulk strings, byte-exact
//! Redis framing, so any RESP reader replays it. Writes buffer in memory and
//! flush at command end (or at ~10 KiB during follower application). A write
//! or sync failure is fatal: the server stops accepting writes.

use crate::msg::{ConnType, Message};
use crate::server::{Db, Server};
use meridian_core::error::{Error, Result};
use meridian_wire::{append_array, Reader};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

pub(crate) const AOF_NAME: &str = "appendfile";

impl Server {
    pub(crate) fn aof_path(&self) -> PathBuf {
        self.dir.join(AOF_NAME)
    }

    pub(crate) fn open_aof(&self) -> Result<()> {
        let mut db = self.db.write();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.aof_path())?;
        let size = file.metadata()?.len();
        db.aof = Some(file);
        db.aof_size = size;
        self.aof_signal.publish(size);
        Ok(())
    }

    /// Append one record to the AOF buffer. While a shrink is running the
    /// record also lands in the shrink log so the compacted file catches up.
    pub(crate) fn write_aof(&self, db: &mut Db, args: &[String]) -> Result<()> {
        if db.shrinking {
            db.shrink_log.push(args.to_vec());
        }
        append_array(&mut db.aof_buf, args);
        Ok(())
    }

    pub(crate) fn flush_aof(&self, db: &mut Db) -> Result<()> {
        if db.aof_buf.is_empty() {
            return Ok(());
        }
        let buf = std::mem::take(&mut db.aof_buf);
        let file = db
            .aof
            .as_mut()
            .ok_or_else(|| Error::AofFailure("append-only file is not open".into()))?;
        if let Err(err) = file.write_all(&buf).and_then(|_| file.flush()) {
            self.aof_broken.store(true, Ordering::SeqCst);
            error!(%err, "aof write failed; the server no longer accepts writes");
            return Err(Error::AofFailure(err.to_string()));
        }
        db.aof_size += buf.len() as u64;
        self.aof_signal.publish(db.aof_size);
        Ok(())
    }

    /// The log size including buffered, not-yet-flushed bytes.
    pub(crate) fn logical_aof_size(&self, db: &Db) -> u64 {
        db.aof_size + db.aof_buf.len() as u64
    }

    /// Replay the log from offset zero. A `SAVESNAPSHOT <id>` header (the
    /// shrink format) or any `LOADSNAPSHOT` record loads the named snapshot;
    /// everything else executes as an inbound command with replication side
    /// effects suppressed. An incomplete trailing record is trimmed.
    pub(crate) fn load_aof(self: &Arc<Self>) -> Result<()> {
        let path = self.aof_path();
        let file = std::fs::File::open(&path)?;
        let mut rd = Reader::new(file);
        let mut pos: u64 = 0;
        let mut first = true;
        let mut records: u64 = 0;
        loop {
            match rd.read_multibulk() {
                Ok(Some((args, consumed))) => {
                    if args.is_empty() {
                        return Err(Error::AofFailure("empty record in aof".into()));
                    }
                    let cmd = args[0].to_lowercase();
                    match cmd.as_str() {
                        "savesnapshot" | "loadsnapshot" => {
                            let id = args
                                .get(1)
                                .ok_or_else(|| Error::AofFailure("snapshot record without id".into()))?;
                            if cmd == "loadsnapshot" || first {
                                // a shrink header: state resumes from this snapshot
                                self.load_snapshot_collections(id)?;
                            }
                        }
                        _ => {
                            let mut msg =
                                Message::new(args.clone()).with_conn(ConnType::Replay);
                            if let Err(err) = self.command(&mut msg) {
                                // data errors replay as the original client
                                // saw them; only infrastructure errors stop us
                                if err.is_fatal() {
                                    return Err(err);
                                }
                            }
                        }
                    }
                    pos += consumed;
                    records += 1;
                    first = false;
                }
                Ok(None) => break,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData
                    ) =>
                {
                    warn!(pos, %err, "aof ends mid-record, trimming to last whole record");
                    let file = OpenOptions::new().write(true).open(&path)?;
                    file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        let size = std::fs::metadata(&path)?.len();
        {
            let mut db = self.db.write();
            db.aof_size = size;
        }
        self.aof_signal.publish(size);
        info!(records, size, "aof replay complete");
        Ok(())
    }

    /// AOFMD5 pos size: checksum over a window of the log. Used by
    /// followers hunting for the divergence point.
    pub(crate) fn cmd_aofmd5(
        &self,
        msg: &Message,
        _start: std::time::Instant,
    ) -> Result<meridian_wire::Value> {
        if msg.args.len() != 3 {
            return Err(Error::InvalidNumberOfArguments);
        }
        let pos = msg.args[1]
            .parse::<u64>()
            .map_err(|_| Error::invalid_argument(msg.args[1].as_str()))?;
        let size = msg.args[2]
            .parse::<u64>()
            .map_err(|_| Error::invalid_argument(msg.args[2].as_str()))?;
        let sum = self.checksum(pos, size)?;
        Ok(meridian_wire::Value::Simple(sum))
    }
}

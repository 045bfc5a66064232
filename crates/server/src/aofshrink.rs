//! AOF shrink: rewrite the log as a `SAVESNAPSHOT <id>` header plus the
//! suffix past the snapshot's offset, capture commands that arrive during
//! the rewrite in the shrink log, and swap the files atomically via rename.
//! Followers are disconnected afterwards and resync against the new log.

use crate::msg::{ok_message, Message};
use crate::server::Server;
use meridian_core::error::{Error, Result};
use meridian_wire::{append_array, Value};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{info, warn};

const SHRINK_SUFFIX: &str = "-shrink";
const BACKUP_SUFFIX: &str = "-bak";

impl Server {
    pub(crate) fn cmd_aofshrink(&self, msg: &Message, start: Instant) -> Result<Value> {
        // phase one: mark shrinking and pin the copy window
        let (snap_id, snap_offset, copy_end) = {
            let _w = self.sched.write();
            let mut db = self.db.write();
            if db.aof.is_none() {
                return Err(Error::AofFailure("aof disabled".into()));
            }
            if db.shrinking {
                return Err(Error::Protocol("aof already shrinking".into()));
            }
            db.shrinking = true;
            db.shrink_log.clear();
            self.flush_aof(&mut db)?;
            (
                db.snapshot_meta.id.clone(),
                db.snapshot_meta.offset,
                db.aof_size,
            )
        };

        let result = self.do_shrink(&snap_id, snap_offset, copy_end);

        {
            let _w = self.sched.write();
            let mut db = self.db.write();
            db.shrinking = false;
            db.shrink_log.clear();
        }
        info!(elapsed = ?start.elapsed(), "aof shrink ended");
        result?;
        Ok(ok_message(msg, start))
    }

    fn do_shrink(&self, snap_id: &str, snap_offset: u64, copy_end: u64) -> Result<()> {
        let live_path = self.aof_path();
        let shrink_path = self.dir.join(format!("{}{}", super::aof::AOF_NAME, SHRINK_SUFFIX));
        let backup_path = self.dir.join(format!("{}{}", super::aof::AOF_NAME, BACKUP_SUFFIX));

        let mut dst = File::create(&shrink_path)?;
        let mut header_len = 0u64;
        if !snap_id.is_empty() {
            let mut header = Vec::new();
            append_array(&mut header, &["SAVESNAPSHOT", snap_id]);
            dst.write_all(&header)?;
            header_len = header.len() as u64;
        } else if snap_offset != 0 {
            warn!("snapshot meta has an offset but no id; shrinking from zero");
        }

        // copy the suffix that postdates the snapshot, up to the size pinned
        // at phase one; later arrivals are in the shrink log
        let mut src = File::open(&live_path)?;
        src.seek(SeekFrom::Start(snap_offset.min(copy_end)))?;
        let mut limited = src.take(copy_end.saturating_sub(snap_offset));
        std::io::copy(&mut limited, &mut dst)?;
        dst.sync_all()?;

        // phase two: drain the shrink log and swap files under the writer
        let _w = self.sched.write();
        let mut db = self.db.write();
        self.flush_aof(&mut db)?;
        let mut tail = Vec::new();
        for args in &db.shrink_log {
            append_array(&mut tail, args);
        }
        dst.write_all(&tail)?;
        dst.sync_all()?;
        drop(dst);

        // anything failing past this point is unrecoverable for the live log
        db.aof = None;
        std::fs::rename(&live_path, &backup_path)
            .map_err(|err| Error::AofFailure(format!("shrink backup rename: {}", err)))?;
        std::fs::rename(&shrink_path, &live_path)
            .map_err(|err| Error::AofFailure(format!("shrink swap rename: {}", err)))?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&live_path)
            .map_err(|err| Error::AofFailure(format!("shrink reopen: {}", err)))?;
        db.aof_size = file.metadata()?.len();
        db.aof = Some(file);
        db.snapshot_meta.offset = header_len;
        db.snapshot_meta.save(&self.dir)?;
        std::fs::remove_file(&backup_path).ok();

        self.aof_signal.publish(db.aof_size);
        // the log was rewritten in place: force followers to resync
        self.repl_epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

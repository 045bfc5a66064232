//! The follower: sync to the leader's latest snapshot, verify the AOF
//! overlap by checksum, then tail live records and apply each one.
//!
//! Divergence at the top of the local log (or the leader loading a
//! snapshot) resets the follower: AOF truncated to zero, snapshot refetched,
//! sync restarted.

use crate::checksum::{do_server, CheckSome};
use crate::msg::{ok_message, tokenval, ConnType, Message};
use crate::server::Server;
use meridian_core::error::{Error, Result};
use meridian_wire::{RespConn, Value};
use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

fn no_longer_following(err: &Error) -> bool {
    matches!(err, Error::Protocol(m) if m == "no longer following")
}

fn divergence(err: &Error) -> bool {
    matches!(err, Error::Protocol(m) if m == "divergent aof")
}

impl Server {
    /// FOLLOW host port | FOLLOW no one.
    pub(crate) fn cmd_follow(&self, msg: &Message, start: Instant) -> Result<Value> {
        let args = &msg.args[1..];
        let (rest, host) = tokenval(args).ok_or(Error::InvalidNumberOfArguments)?;
        let (rest, sport) = tokenval(rest).ok_or(Error::InvalidNumberOfArguments)?;
        if !rest.is_empty() {
            return Err(Error::InvalidNumberOfArguments);
        }
        let host = host.to_lowercase();
        let sport = sport.to_lowercase();

        let update;
        let mut new_target: Option<(String, u16)> = None;
        {
            let _w = self.sched.write();
            let mut db = self.db.write();
            if host == "no" && sport == "one" {
                update = db.config.is_following();
                db.config.follow_host = String::new();
                db.config.follow_port = 0;
            } else {
                let port: u16 = sport
                    .parse()
                    .map_err(|_| Error::invalid_argument(sport.as_str()))?;
                update = db.config.follow_host != host || db.config.follow_port != port;
                if update {
                    self.validate_leader(&host, port)?;
                }
                db.config.follow_host = host.clone();
                db.config.follow_port = port;
                new_target = Some((host.clone(), port));
            }
            db.config.save(&self.dir)?;
            self.following
                .store(db.config.is_following(), Ordering::SeqCst);
        }

        if update {
            self.followc.fetch_add(1, Ordering::SeqCst);
            match new_target {
                Some((host, port)) => {
                    info!(%host, port, "following new host");
                    self.start_follow_thread(host, port);
                }
                None => {
                    info!("following no one");
                    self.fcup.store(false, Ordering::SeqCst);
                }
            }
        }
        Ok(ok_message(msg, start))
    }

    /// Check that we can follow a given host:port.
    fn validate_leader(&self, host: &str, port: u16) -> Result<()> {
        let addr = format!("{}:{}", host, port);
        let mut conn = RespConn::dial_timeout(&addr, DIAL_TIMEOUT)
            .map_err(|err| Error::Protocol(format!("cannot follow: {}", err)))?;
        let meta = do_server(&mut conn)?;
        let id = meta.get("id").cloned().unwrap_or_default();
        if id.is_empty() {
            return Err(Error::Protocol("cannot follow: invalid id".into()));
        }
        if id == self.db.read().config.server_id {
            return Err(Error::Protocol("cannot follow self".into()));
        }
        if !meta.get("following").cloned().unwrap_or_default().is_empty() {
            return Err(Error::Protocol("cannot follow a follower".into()));
        }
        Ok(())
    }

    pub(crate) fn start_follow_thread(&self, host: String, port: u16) {
        let Some(me) = self.self_ref.get().and_then(Weak::upgrade) else {
            return;
        };
        let followc = self.followc.load(Ordering::SeqCst);
        std::thread::spawn(move || {
            me.follow(&host, port, followc);
        });
    }

    fn follow(&self, host: &str, port: u16, followc: u64) {
        loop {
            if self.is_closed() || self.followc.load(Ordering::SeqCst) != followc {
                return;
            }
            let l_top = match self.sync_to_latest_snapshot(host, port, followc) {
                Ok(top) => top,
                Err(err) => {
                    if no_longer_following(&err) {
                        return;
                    }
                    error!(%err, "failed to sync to the latest snapshot");
                    std::thread::sleep(Duration::from_secs(1));
                    continue;
                }
            };
            let f_top = self.db.read().aof_size;
            loop {
                match self.follow_step(host, port, followc, l_top, f_top) {
                    Err(err) if no_longer_following(&err) => return,
                    Err(err) if divergence(&err) => {
                        warn!("follow: divergent aof, resetting");
                        if let Err(err) = self.reset_follower_log() {
                            error!(%err, "failed to reset follower log");
                        }
                        break; // back to snapshot sync
                    }
                    Err(err) => {
                        if !matches!(&err, Error::Io(ioe) if ioe.kind() == std::io::ErrorKind::UnexpectedEof)
                        {
                            error!(%err, "follow");
                        }
                    }
                    Ok(()) => {}
                }
                if self.is_closed() || self.followc.load(Ordering::SeqCst) != followc {
                    return;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    /// Load the leader's latest snapshot and restart the local AOF behind a
    /// LOADSNAPSHOT record. Returns the leader-side offset the snapshot
    /// anchors to (`lTop`).
    fn sync_to_latest_snapshot(&self, host: &str, port: u16, followc: u64) -> Result<u64> {
        if self.followc.load(Ordering::SeqCst) != followc {
            return Err(Error::Protocol("no longer following".into()));
        }
        self.validate_leader(host, port)?;
        let addr = format!("{}:{}", host, port);
        let mut conn = RespConn::dial_timeout(&addr, DIAL_TIMEOUT).map_err(Error::Io)?;
        let reply = conn
            .do_cmd(&["snapshot", "latest", "meta"])
            .map_err(Error::Io)?;
        if let Some(errmsg) = reply.error_message() {
            return Err(Error::Protocol(errmsg.to_string()));
        }
        let parts = reply.as_array();
        let id = parts.first().map(|v| v.as_string()).unwrap_or_default();
        let offset = parts.get(1).map(|v| v.as_integer()).unwrap_or(0) as u64;
        if id.is_empty() {
            // no snapshot on the leader: tail its log from the beginning
            return Ok(0);
        }

        let _w = self.sched.write();
        let mut db = self.db.write();
        self.load_snapshot_into(&mut db, &id)?;

        // restart the local log: LOADSNAPSHOT is its first record
        db.aof = None;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.aof_path())?;
        drop(file);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.aof_path())?;
        db.aof = Some(file);
        db.aof_size = 0;
        db.aof_buf.clear();
        self.write_aof(&mut db, &["LOADSNAPSHOT".to_string(), id.clone()])?;
        self.flush_aof(&mut db)?;
        db.snapshot_meta.id = id;
        db.snapshot_meta.offset = db.aof_size;
        db.snapshot_meta.save(&self.dir)?;
        self.aof_signal.publish(db.aof_size);
        Ok(offset)
    }

    /// Truncate the local log to zero so the next sync starts clean.
    fn reset_follower_log(&self) -> Result<()> {
        let _w = self.sched.write();
        let mut db = self.db.write();
        db.aof = None;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.aof_path())?;
        drop(file);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.aof_path())?;
        db.aof = Some(file);
        db.aof_size = 0;
        db.aof_buf.clear();
        db.cols.clear();
        db.expires.clear_all();
        self.aof_signal.publish(0);
        Ok(())
    }

    fn follow_step(&self, host: &str, port: u16, followc: u64, l_top: u64, f_top: u64) -> Result<()> {
        if self.followc.load(Ordering::SeqCst) != followc {
            return Err(Error::Protocol("no longer following".into()));
        }
        self.fcup.store(false, Ordering::SeqCst);
        self.validate_leader(host, port)?;
        let addr = format!("{}:{}", host, port);

        // verify checksum overlap before tailing
        let rel_pos = match self.follow_check_some(&addr, followc, l_top, f_top)? {
            CheckSome::RelPos(rel) => rel,
            CheckSome::Reset => return Err(Error::Protocol("divergent aof".into())),
        };

        let mut conn = RespConn::dial_timeout(&addr, DIAL_TIMEOUT).map_err(Error::Io)?;
        let meta = do_server(&mut conn)?;
        let l_size: u64 = meta
            .get("aof_size")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Protocol("leader sent no aof_size".into()))?;

        let reply = conn
            .do_cmd(&["replconf", "listening-port", "0"])
            .map_err(Error::Io)?;
        if reply.error_message().is_some() {
            return Err(Error::Protocol("invalid response to replconf request".into()));
        }
        debug!(addr, "follow: replconf");

        let tail_from = (l_top + rel_pos).to_string();
        let reply = conn
            .do_cmd(&["aof", tail_from.as_str()])
            .map_err(Error::Io)?;
        if reply.as_string() != "OK" {
            return Err(Error::Protocol("invalid response to aof live request".into()));
        }
        debug!(addr, "follow: read aof");

        let mut caught_up = rel_pos >= l_size.saturating_sub(l_top);
        if caught_up {
            self.fcup.store(true, Ordering::SeqCst);
            self.fcuponce.store(true, Ordering::SeqCst);
            info!("caught up");
        }
        loop {
            let Some((args, _)) = conn.read_multibulk().map_err(Error::Io)? else {
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            };
            let f_size = self.follow_handle_command(&args, followc)?;
            if !caught_up && f_size.saturating_sub(f_top) >= l_size.saturating_sub(l_top) {
                caught_up = true;
                let _w = self.sched.write();
                let mut db = self.db.write();
                self.flush_aof(&mut db)?;
                self.fcup.store(true, Ordering::SeqCst);
                self.fcuponce.store(true, Ordering::SeqCst);
                info!("caught up");
            }
        }
    }

    /// Apply one record from the leader and append it to the local log.
    /// Returns the local logical log size afterwards.
    fn follow_handle_command(&self, args: &[String], followc: u64) -> Result<u64> {
        let _w = self.sched.write();
        let mut db = self.db.write();
        if self.followc.load(Ordering::SeqCst) != followc {
            return Err(Error::Protocol("no longer following".into()));
        }
        let name = args
            .first()
            .map(|s| s.to_lowercase())
            .unwrap_or_default();
        match name.as_str() {
            "savesnapshot" => {
                // the leader saved a snapshot; fetch it for later syncs
                let id = args
                    .get(1)
                    .ok_or_else(|| Error::Protocol("savesnapshot without id".into()))?;
                info!(id = %id, "leader saved snapshot, fetching");
                if let Err(err) = self.fetch_snapshot(id) {
                    warn!(%err, "could not fetch leader snapshot");
                }
                self.write_aof(&mut db, args)?;
                self.flush_aof(&mut db)?;
            }
            "loadsnapshot" => {
                // the leader rewrote its state out from under us
                return Err(Error::Protocol("divergent aof".into()));
            }
            _ => {
                let msg = Message::new(args.to_vec()).with_conn(ConnType::Follower);
                if let Err(err) = self.apply_write(&mut db, &msg, &name).map(|_| ()) {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    // data-level errors replay as the leader's clients saw
                    // them; keep the byte stream aligned regardless
                    debug!(%err, cmd = %name, "follow: command error");
                }
                self.write_aof(&mut db, args)?;
                if db.aof_buf.len() > 10240 {
                    self.flush_aof(&mut db)?;
                }
            }
        }
        Ok(self.logical_aof_size(&db))
    }
}

//! Snapshots: a consistent binary dump of every collection under
//! `snapshots/<id-hex>/<collection-key>/`, anchored to an AOF offset by the
//! `snapshot_meta` JSON sidecar. Push/pull to external storage goes through
//! the out-of-band `push_snapshot` / `pull_snapshot` helper processes; the
//! core only waits for a successful exit.

use crate::msg::{ok_message, tokenval, Message, OutputFormat};
use crate::server::{Db, Server};
use meridian_collection::Collection;
use meridian_core::error::{Error, Result};
use meridian_wire::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

const META_FILE: &str = "snapshot_meta";

/// Record of the last snapshot for this dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotMeta {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub offset: u64,
}

impl SnapshotMeta {
    pub fn load(dir: &Path) -> Result<SnapshotMeta> {
        match std::fs::read(dir.join(META_FILE)) {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|err| Error::SnapshotFailure(format!("bad snapshot meta: {}", err))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(SnapshotMeta::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self).expect("meta serializes");
        std::fs::write(dir.join(META_FILE), data)?;
        Ok(())
    }
}

impl Server {
    pub(crate) fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.dir.join("snapshots").join(id)
    }

    /// SAVESNAPSHOT: record the marker in the AOF, then dump every
    /// collection (one worker per collection) and push the result.
    pub(crate) fn cmd_savesnapshot(&self, msg: &Message, start: Instant) -> Result<Value> {
        let snapshot_id: u64 = rand::random();
        let id_str = format!("{:x}", snapshot_id);

        let _w = self.sched.write();
        let mut db = self.db.write();
        if db.config.is_following() && msg.conn == crate::msg::ConnType::Client {
            return Err(Error::NotLeader);
        }
        self.write_aof(&mut db, &["SAVESNAPSHOT".to_string(), id_str.clone()])?;
        self.flush_aof(&mut db)?;
        let offset = db.aof_size;

        let dir = self.snapshot_dir(&id_str);
        info!(id = %id_str, "saving snapshot");
        save_collections(&dir, snapshot_id, &db.cols)?;
        info!(id = %id_str, "saved snapshot");

        match push_snapshot(&id_str, &dir) {
            Ok(()) => {
                db.snapshot_meta = SnapshotMeta {
                    id: id_str.clone(),
                    offset,
                };
                db.snapshot_meta.save(&self.dir)?;
            }
            Err(err) => {
                // the snapshot is on disk but not durable upstream; leave
                // the meta pointing at the previous one
                error!(%err, "failed to push snapshot");
                return Err(Error::SnapshotFailure(err.to_string()));
            }
        }

        Ok(match msg.output {
            OutputFormat::Json => crate::msg::json_ok_with(
                &format!("\"id\":\"{}\"", id_str),
                start,
            ),
            OutputFormat::Resp => Value::Simple(id_str),
        })
    }

    /// LOADSNAPSHOT <id>: fetch if missing locally, then load every
    /// collection directory, replacing the keyspace entries it names.
    pub(crate) fn cmd_loadsnapshot(&self, msg: &Message, start: Instant) -> Result<Value> {
        let args = &msg.args[1..];
        let (rest, id_str) = tokenval(args).ok_or(Error::InvalidNumberOfArguments)?;
        if !rest.is_empty() || id_str.is_empty() {
            return Err(Error::InvalidNumberOfArguments);
        }
        let id_str = id_str.to_string();
        {
            let _w = self.sched.write();
            let mut db = self.db.write();
            self.write_aof(&mut db, &["LOADSNAPSHOT".to_string(), id_str.clone()])?;
            self.flush_aof(&mut db)?;
            self.load_snapshot_into(&mut db, &id_str)?;
        }
        Ok(ok_message(msg, start))
    }

    /// `SNAPSHOT LATEST META`: the follower asks which snapshot to bootstrap
    /// from.
    pub(crate) fn cmd_snapshot_latest_meta(&self, msg: &Message, start: Instant) -> Result<Value> {
        let sub: Vec<String> = msg.args[1..]
            .iter()
            .map(|s| s.to_lowercase())
            .collect();
        if sub != ["latest", "meta"] {
            return Err(Error::InvalidNumberOfArguments);
        }
        let meta = self.db.read().snapshot_meta.clone();
        Ok(match msg.output {
            OutputFormat::Json => crate::msg::json_ok_with(
                &format!("\"id\":\"{}\",\"offset\":{}", meta.id, meta.offset),
                start,
            ),
            OutputFormat::Resp => Value::Array(vec![
                Value::Simple(meta.id),
                Value::Integer(meta.offset as i64),
            ]),
        })
    }

    /// Load a snapshot during AOF replay (no locks needed; startup is
    /// single-threaded).
    pub(crate) fn load_snapshot_collections(self: &Arc<Self>, id_str: &str) -> Result<()> {
        let mut db = self.db.write();
        self.load_snapshot_into(&mut db, id_str)
    }

    pub(crate) fn load_snapshot_into(&self, db: &mut Db, id_str: &str) -> Result<()> {
        let snapshot_id = u64::from_str_radix(id_str, 16)
            .map_err(|_| Error::SnapshotFailure(format!("bad snapshot id '{}'", id_str)))?;
        let dir = self.fetch_snapshot(id_str)?;
        info!(id = %id_str, "loading snapshot");
        let loaded = load_collections(&dir, snapshot_id)?;
        for (key, col) in loaded {
            db.cols.insert(key, col);
        }
        db.snapshot_meta.id = id_str.to_string();
        info!(id = %id_str, "loaded snapshot");
        Ok(())
    }

    /// Ensure the snapshot directory exists locally, pulling it through the
    /// helper process when it does not.
    pub(crate) fn fetch_snapshot(&self, id_str: &str) -> Result<PathBuf> {
        let dir = self.snapshot_dir(id_str);
        if dir.is_dir() {
            info!(id = %id_str, "snapshot found locally, not pulling");
            return Ok(dir);
        }
        std::fs::create_dir_all(&dir)?;
        info!(id = %id_str, "pulling snapshot (not found locally)");
        let pulled = Command::new("pull_snapshot")
            .arg(id_str)
            .arg(&dir)
            .status()
            .map_err(|err| Error::SnapshotFailure(format!("pull_snapshot: {}", err)))
            .and_then(|status| {
                if status.success() {
                    Ok(())
                } else {
                    Err(Error::SnapshotFailure(format!(
                        "pull_snapshot exited with {}",
                        status
                    )))
                }
            });
        if let Err(err) = pulled {
            // leave no half-created directory behind to shadow a real pull
            std::fs::remove_dir_all(&dir).ok();
            return Err(err);
        }
        info!(id = %id_str, "pulled snapshot");
        Ok(dir)
    }
}

/// Save every collection into `<dir>/<key>/`, one worker thread each.
fn save_collections(
    dir: &Path,
    snapshot_id: u64,
    cols: &BTreeMap<String, Collection>,
) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let results: Vec<(String, Result<()>)> = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for (key, col) in cols {
            let col_dir = dir.join(key);
            handles.push((
                key.clone(),
                scope.spawn(move || -> Result<()> {
                    std::fs::create_dir_all(&col_dir)?;
                    col.save(&col_dir, snapshot_id)
                }),
            ));
        }
        handles
            .into_iter()
            .map(|(key, handle)| (key, handle.join().expect("snapshot worker panicked")))
            .collect()
    });
    for (key, result) in results {
        if let Err(err) = result {
            error!(key, %err, "collection snapshot failed");
            return Err(err);
        }
        info!(key, "collection saved");
    }
    Ok(())
}

/// Load every collection directory under `dir`, one worker thread each.
fn load_collections(dir: &Path, snapshot_id: u64) -> Result<Vec<(String, Collection)>> {
    let mut keys = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            keys.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    let results: Vec<(String, Result<Collection>)> = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for key in &keys {
            let col_dir = dir.join(key);
            handles.push((
                key.clone(),
                scope.spawn(move || Collection::load(&col_dir, snapshot_id)),
            ));
        }
        handles
            .into_iter()
            .map(|(key, handle)| (key, handle.join().expect("snapshot worker panicked")))
            .collect()
    });
    let mut out = Vec::with_capacity(results.len());
    for (key, result) in results {
        match result {
            Ok(col) => {
                info!(key, "collection loaded");
                out.push((key, col));
            }
            Err(err) => {
                error!(key, %err, "collection load failed");
                return Err(err);
            }
        }
    }
    Ok(out)
}

/// Hand the snapshot to external storage. A missing helper binary degrades
/// to local-only snapshots with a warning; a failing helper is an error.
fn push_snapshot(id_str: &str, dir: &Path) -> std::result::Result<(), std::io::Error> {
    info!(id = %id_str, "pushing snapshot");
    match Command::new("push_snapshot").arg(id_str).arg(dir).status() {
        Ok(status) if status.success() => {
            info!(id = %id_str, "pushed snapshot");
            Ok(())
        }
        Ok(status) => Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("push_snapshot exited with {}", status),
        )),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!("push_snapshot helper not installed; snapshot is local only");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

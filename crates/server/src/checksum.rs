//! AOF checksum windows and the divergence search the follower runs before
//! tailing. Checksums are md5 over byte ranges of the log; follower and
//! leader binary-search the largest matching prefix relative to their
//! respective tops (each side has an independent snapshot header).

use crate::server::Server;
use md5::{Digest, Md5};
use meridian_core::error::{Error, Result};
use meridian_wire::{Reader, RespConn};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, warn};

/// Checksum block size exchanged with the leader.
pub(crate) const CHECKSUM_SZ: u64 = 512 * 1024;

/// Outcome of the pre-tail checksum hunt.
pub(crate) enum CheckSome {
    /// Tail from this offset relative to the tops.
    RelPos(u64),
    /// The follower's log diverges at its top: reset and resync.
    Reset,
}

#[cfg(test)]
pub(crate) fn hex_digest(data: impl AsRef<[u8]>) -> String {
    let digest = Md5::digest(data.as_ref());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

impl Server {
    /// md5 over `[pos, pos+size)` of the local AOF. Ranges beyond the end
    /// report EOF.
    pub(crate) fn checksum(&self, pos: u64, size: u64) -> Result<String> {
        let aof_size = self.db.read().aof_size;
        if pos + size > aof_size {
            return Err(Error::Protocol("EOF".into()));
        }
        let mut file = std::fs::File::open(self.aof_path())?;
        file.seek(SeekFrom::Start(pos))?;
        let mut hasher = Md5::new();
        let mut remaining = size;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                return Err(Error::Protocol("EOF".into()));
            }
            hasher.update(&buf[..n]);
            remaining -= n as u64;
        }
        let digest = hasher.finalize();
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    fn match_checksums(
        &self,
        conn: &mut RespConn,
        l_pos: u64,
        f_pos: u64,
        size: u64,
    ) -> Result<bool> {
        let local = match self.checksum(f_pos, size) {
            Ok(sum) => sum,
            Err(Error::Protocol(m)) if m == "EOF" => return Ok(false),
            Err(err) => return Err(err),
        };
        let remote = match conn_aofmd5(conn, l_pos, size) {
            Ok(sum) => sum,
            Err(Error::Protocol(m)) if m.ends_with("EOF") => return Ok(false),
            Err(err) => return Err(err),
        };
        Ok(local == remote)
    }

    /// Find how far the local AOF matches the leader's, binary-searching
    /// whole checksum blocks, then snapping to a record boundary.
    pub(crate) fn follow_check_some(
        &self,
        addr: &str,
        followc: u64,
        l_top: u64,
        f_top: u64,
    ) -> Result<CheckSome> {
        debug!(addr, "follow: check some");
        let _w = self.sched.write();
        let mut db = self.db.write();
        if self.followc.load(Ordering::SeqCst) != followc {
            return Err(Error::Protocol("no longer following".into()));
        }
        self.flush_aof(&mut db)?;
        let aof_size = db.aof_size;
        if aof_size.saturating_sub(f_top) < CHECKSUM_SZ {
            // too little local history to verify; tail from the top
            return Ok(CheckSome::RelPos(0));
        }

        let mut conn = RespConn::dial_timeout(addr, Duration::from_secs(2))?;
        let meta = do_server(&mut conn)?;
        let l_size: u64 = meta
            .get("aof_size")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Protocol("leader sent no aof_size".into()))?;

        let mut l_min = l_top;
        let mut l_max = l_size.saturating_sub(CHECKSUM_SZ);
        let mut l_limit = l_size;
        let mut f_min = f_top;
        let mut f_max = aof_size - CHECKSUM_SZ;
        let mut f_limit = aof_size;

        if !self.match_checksums(&mut conn, l_min, f_min, CHECKSUM_SZ)? {
            // divergence at the very top of our log is unrecoverable here
            return Ok(CheckSome::Reset);
        }
        l_min += CHECKSUM_SZ;
        f_min += CHECKSUM_SZ;
        loop {
            if f_max < f_min || f_max + CHECKSUM_SZ > f_limit {
                break;
            }
            if self.match_checksums(&mut conn, l_max, f_max, CHECKSUM_SZ)? {
                f_min = f_max + CHECKSUM_SZ;
                l_min = l_max + CHECKSUM_SZ;
            } else {
                f_limit = f_max;
                l_limit = l_max;
            }
            f_max = (f_limit - f_min) / 2 - CHECKSUM_SZ / 2 + f_min;
            l_max = (l_limit - l_min) / 2 - CHECKSUM_SZ / 2 + l_min;
        }
        let f_pos = f_min;
        if f_pos == f_top {
            return Ok(CheckSome::RelPos(0));
        }

        // truncate at a whole record
        let snapped = end_of_last_record(&self.aof_path(), f_pos)?;
        if snapped == f_pos {
            debug!("follow: aof fully intact");
            return Ok(CheckSome::RelPos(f_pos - f_top));
        }
        warn!(to = snapped, "truncating aof to the last whole record");
        db.aof = None;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.aof_path())?;
        file.set_len(snapped)?;
        drop(file);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.aof_path())?;
        db.aof = Some(file);
        db.aof_size = snapped;
        self.aof_signal.publish(snapped);
        Ok(CheckSome::RelPos(snapped - f_top))
    }
}

/// Ask the leader for a checksum window.
pub(crate) fn conn_aofmd5(conn: &mut RespConn, pos: u64, size: u64) -> Result<String> {
    let pos = pos.to_string();
    let size = size.to_string();
    let reply = conn
        .do_cmd(&["aofmd5", pos.as_str(), size.as_str()])
        .map_err(Error::Io)?;
    if let Some(errmsg) = reply.error_message() {
        return Err(Error::Protocol(errmsg.to_string()));
    }
    let sum = reply.as_string();
    if sum.len() != 32 {
        return Err(Error::Protocol("checksum not ok".into()));
    }
    Ok(sum)
}

/// Fetch the leader's SERVER map (flat key/value array).
pub(crate) fn do_server(
    conn: &mut RespConn,
) -> Result<std::collections::HashMap<String, String>> {
    let reply = conn.do_cmd(&["server"]).map_err(Error::Io)?;
    if let Some(errmsg) = reply.error_message() {
        return Err(Error::Protocol(errmsg.to_string()));
    }
    let arr = reply.as_array();
    let mut map = std::collections::HashMap::new();
    for pair in arr.chunks(2) {
        if let [k, v] = pair {
            map.insert(k.as_string(), v.as_string());
        }
    }
    Ok(map)
}

/// Scan backwards from `start_pos` for the last position where a whole RESP
/// record ends at or before `start_pos`.
pub(crate) fn end_of_last_record(path: &Path, start_pos: u64) -> Result<u64> {
    let data = std::fs::read(path)?;
    let limit = (start_pos as usize).min(data.len());
    for pos in (0..limit).rev() {
        if data[pos] != b'*' {
            continue;
        }
        let mut rd = Reader::new(&data[pos..]);
        if let Ok(Some((_, consumed))) = rd.read_multibulk() {
            let end = pos as u64 + consumed;
            if end <= start_pos {
                return Ok(end);
            }
        }
    }
    Err(Error::Protocol("no record boundary found".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_wire::append_array;

    #[test]
    fn test_hex_digest_known() {
        // md5 of "hello" is well known
        assert_eq!(hex_digest("hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_end_of_last_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aof");
        let mut buf = Vec::new();
        append_array(&mut buf, &["SET", "k", "a", "POINT", "1", "2"]);
        let first_len = buf.len() as u64;
        append_array(&mut buf, &["SET", "k", "b", "POINT", "3", "4"]);
        let full_len = buf.len() as u64;
        std::fs::write(&path, &buf).unwrap();

        // a position in the middle of the second record snaps back to the
        // end of the first
        assert_eq!(end_of_last_record(&path, full_len - 3).unwrap(), first_len);
        assert_eq!(end_of_last_record(&path, full_len).unwrap(), full_len);
        assert_eq!(end_of_last_record(&path, first_len).unwrap(), first_len);
    }
}

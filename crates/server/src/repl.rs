//! The replication listener: a minimal RESP endpoint serving exactly the
//! leader side of the sync protocol (SERVER, AOFMD5, SNAPSHOT LATEST META,
//! REPLCONF, and the live AOF tail). The general client wire server is not
//! here; this surface exists for followers.

use crate::msg::Message;
use crate::server::Server;
use meridian_core::error::Result;
use meridian_wire::{write_value, Reader, Value};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

impl Server {
    /// Bind the replication endpoint. Returns the bound address (useful with
    /// port zero) and the accept-loop handle.
    pub fn serve_replication(
        self: &Arc<Self>,
        addr: &str,
    ) -> Result<(SocketAddr, std::thread::JoinHandle<()>)> {
        let listener = TcpListener::bind(addr)?;
        let bound = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        info!(%bound, "replication listener up");
        let server = self.clone();
        let handle = std::thread::spawn(move || loop {
            if server.is_closed() {
                return;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "replication connection");
                    stream.set_nonblocking(false).ok();
                    stream.set_nodelay(true).ok();
                    let server = server.clone();
                    std::thread::spawn(move || {
                        let _ = server.handle_repl_conn(stream);
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(_) => return,
            }
        });
        Ok((bound, handle))
    }

    fn handle_repl_conn(&self, stream: TcpStream) -> std::io::Result<()> {
        let mut rd = Reader::new(stream.try_clone()?);
        let mut w = stream;
        loop {
            let Some((args, _)) = rd.read_multibulk()? else {
                return Ok(());
            };
            if args.is_empty() {
                continue;
            }
            let name = args[0].to_lowercase();
            match name.as_str() {
                "aof" | "aofsync" => {
                    // AOF <offset> | AOFSYNC <sync-id> <offset>
                    let offset_arg = if name == "aof" { args.get(1) } else { args.get(2) };
                    let Some(pos) = offset_arg.and_then(|s| s.parse::<u64>().ok()) else {
                        write_value(&mut w, &Value::Error("invalid offset".into()))?;
                        continue;
                    };
                    write_value(&mut w, &Value::Simple("OK".into()))?;
                    w.flush()?;
                    return self.stream_aof(&mut w, pos);
                }
                _ => {
                    let mut msg = Message::new(args);
                    let reply = match self.command(&mut msg) {
                        Ok(value) => value,
                        Err(err) => Value::Error(err.resp_safe_message()),
                    };
                    write_value(&mut w, &reply)?;
                    w.flush()?;
                }
            }
        }
    }

    /// Write framed records from `pos` onward, blocking on the flush signal
    /// for new data. Ends when the server closes or a shrink rewrites the
    /// log out from under the connection.
    fn stream_aof(&self, w: &mut TcpStream, mut pos: u64) -> std::io::Result<()> {
        let epoch = self.repl_epoch.load(Ordering::SeqCst);
        let mut file = std::fs::File::open(self.aof_path())?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            if self.is_closed() || self.repl_epoch.load(Ordering::SeqCst) != epoch {
                return Ok(());
            }
            let size = *self.aof_signal.size.lock();
            if pos < size {
                file.seek(SeekFrom::Start(pos))?;
                let mut remaining = size - pos;
                while remaining > 0 {
                    let want = remaining.min(buf.len() as u64) as usize;
                    let n = file.read(&mut buf[..want])?;
                    if n == 0 {
                        break;
                    }
                    w.write_all(&buf[..n])?;
                    pos += n as u64;
                    remaining -= n as u64;
                }
                w.flush()?;
            } else {
                self.aof_signal.wait_beyond(pos, Duration::from_millis(250));
            }
        }
    }
}

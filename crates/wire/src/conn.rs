//! A blocking RESP client connection, used by followers to talk to their
//! leader and by tests to drive the replication listener.

use crate::resp::{append_array, Reader, Value};
use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// One RESP connection over TCP.
pub struct RespConn {
    writer: TcpStream,
    reader: Reader<TcpStream>,
}

impl RespConn {
    /// Connect with a dial timeout. Read/write timeouts are left unset; the
    /// follower tail read blocks indefinitely by design.
    pub fn dial_timeout(addr: &str, timeout: Duration) -> io::Result<RespConn> {
        let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses");
        for sock_addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sock_addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    let reader = Reader::new(stream.try_clone()?);
                    return Ok(RespConn {
                        writer: stream,
                        reader,
                    });
                }
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// Send one command and wait for a single reply.
    pub fn do_cmd<S: AsRef<[u8]>>(&mut self, args: &[S]) -> io::Result<Value> {
        let mut buf = Vec::new();
        append_array(&mut buf, args);
        self.writer.write_all(&buf)?;
        self.writer.flush()?;
        match self.reader.read_value()? {
            Some((value, _)) => Ok(value),
            None => Err(io::ErrorKind::UnexpectedEof.into()),
        }
    }

    /// Read one multibulk record off the stream (live AOF tail).
    pub fn read_multibulk(&mut self) -> io::Result<Option<(Vec<String>, u64)>> {
        self.reader.read_multibulk()
    }

    pub fn shutdown(&self) {
        self.writer.shutdown(std::net::Shutdown::Both).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::write_value;
    use std::net::TcpListener;

    #[test]
    fn test_do_cmd_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut rd = Reader::new(stream.try_clone().unwrap());
            let (args, _) = rd.read_multibulk().unwrap().unwrap();
            assert_eq!(args, vec!["PING"]);
            let mut w = stream;
            write_value(&mut w, &Value::Simple("PONG".into())).unwrap();
        });

        let mut conn =
            RespConn::dial_timeout(&addr.to_string(), Duration::from_secs(2)).unwrap();
        let reply = conn.do_cmd(&["PING"]).unwrap();
        assert_eq!(reply, Value::Simple("PONG".into()));
        server.join().unwrap();
    }
}

//! RESP value model, reader and writer.

use std::io::{self, BufRead, BufReader, Read, Write};

/// A RESP protocol value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR ...\r\n`
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$5\r\nhello\r\n`
    Bulk(Vec<u8>),
    /// `*N\r\n...`
    Array(Vec<Value>),
    /// `$-1\r\n`
    Null,
}

impl Value {
    pub fn from_str(s: impl Into<String>) -> Value {
        Value::Bulk(s.into().into_bytes())
    }

    /// Lossy string form of the value, mirroring how the original protocol
    /// layer stringifies replies.
    pub fn as_string(&self) -> String {
        match self {
            Value::Simple(s) | Value::Error(s) => s.clone(),
            Value::Integer(n) => n.to_string(),
            Value::Bulk(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Array(_) => String::new(),
            Value::Null => String::new(),
        }
    }

    pub fn as_integer(&self) -> i64 {
        match self {
            Value::Integer(n) => *n,
            Value::Simple(s) | Value::Error(s) => s.parse().unwrap_or(0),
            Value::Bulk(b) => String::from_utf8_lossy(b).parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn as_array(&self) -> &[Value] {
        match self {
            Value::Array(vals) => vals,
            _ => &[],
        }
    }

    /// The error message, when this value is an error reply.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Value::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Append one RESP array of bulk strings to `buf`. This is the exact AOF
/// record framing: `*N\r\n` then `$len\r\n<bytes>\r\n` per argument.
pub fn append_array<S: AsRef<[u8]>>(buf: &mut Vec<u8>, args: &[S]) {
    buf.push(b'*');
    buf.extend_from_slice(args.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for arg in args {
        let bytes = arg.as_ref();
        buf.push(b'$');
        buf.extend_from_slice(bytes.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(bytes);
        buf.extend_from_slice(b"\r\n");
    }
}

/// Serialize any RESP value.
pub fn write_value(w: &mut dyn Write, value: &Value) -> io::Result<()> {
    match value {
        Value::Simple(s) => write!(w, "+{}\r\n", s),
        Value::Error(s) => write!(w, "-{}\r\n", s),
        Value::Integer(n) => write!(w, ":{}\r\n", n),
        Value::Bulk(b) => {
            write!(w, "${}\r\n", b.len())?;
            w.write_all(b)?;
            w.write_all(b"\r\n")
        }
        Value::Array(vals) => {
            write!(w, "*{}\r\n", vals.len())?;
            for v in vals {
                write_value(w, v)?;
            }
            Ok(())
        }
        Value::Null => w.write_all(b"$-1\r\n"),
    }
}

/// Buffered RESP reader that tracks how many bytes each record consumed;
/// the AOF loader and the follower both need exact log positions.
pub struct Reader<R: Read> {
    r: BufReader<R>,
}

impl<R: Read> Reader<R> {
    pub fn new(inner: R) -> Self {
        Reader {
            r: BufReader::new(inner),
        }
    }

    pub fn into_inner(self) -> R {
        self.r.into_inner()
    }

    fn read_line(&mut self, consumed: &mut u64) -> io::Result<Option<String>> {
        let mut line = Vec::new();
        let n = self.r.read_until(b'\n', &mut line)?;
        if n == 0 {
            return Ok(None); // clean EOF
        }
        *consumed += n as u64;
        if line.len() < 2 || line[line.len() - 2] != b'\r' {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed resp line",
            ));
        }
        line.truncate(line.len() - 2);
        String::from_utf8(line)
            .map(Some)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 resp line"))
    }

    fn read_exact_payload(&mut self, len: usize, consumed: &mut u64) -> io::Result<Vec<u8>> {
        let mut payload = vec![0u8; len + 2];
        self.r.read_exact(&mut payload)?;
        *consumed += (len + 2) as u64;
        if &payload[len..] != b"\r\n" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bulk not crlf-terminated",
            ));
        }
        payload.truncate(len);
        Ok(payload)
    }

    /// Read one value of any RESP type. Returns the value and the number of
    /// bytes consumed, or `None` on clean EOF at a record boundary. EOF in
    /// the middle of a record is an `UnexpectedEof` error.
    pub fn read_value(&mut self) -> io::Result<Option<(Value, u64)>> {
        let mut consumed = 0u64;
        match self.read_value_inner(&mut consumed)? {
            Some(v) => Ok(Some((v, consumed))),
            None => Ok(None),
        }
    }

    fn read_value_inner(&mut self, consumed: &mut u64) -> io::Result<Option<Value>> {
        let started = *consumed > 0;
        let Some(line) = self.read_line(consumed)? else {
            if started {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            return Ok(None);
        };
        let (kind, rest) = match line.as_bytes().first() {
            Some(&k) => (k, &line[1..]),
            None => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "empty resp line"));
            }
        };
        let value = match kind {
            b'+' => Value::Simple(rest.to_string()),
            b'-' => Value::Error(rest.to_string()),
            b':' => Value::Integer(parse_int(rest)?),
            b'$' => {
                let len = parse_int(rest)?;
                if len < 0 {
                    Value::Null
                } else {
                    Value::Bulk(self.read_exact_payload(len as usize, consumed)?)
                }
            }
            b'*' => {
                let len = parse_int(rest)?;
                if len < 0 {
                    Value::Null
                } else {
                    let mut vals = Vec::with_capacity(len as usize);
                    for _ in 0..len {
                        match self.read_value_inner(consumed)? {
                            Some(v) => vals.push(v),
                            None => return Err(io::ErrorKind::UnexpectedEof.into()),
                        }
                    }
                    Value::Array(vals)
                }
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "inline commands not accepted",
                ));
            }
        };
        Ok(Some(value))
    }

    /// Read one multibulk record (an array of bulk strings) as argument
    /// strings. Returns `None` on clean EOF.
    pub fn read_multibulk(&mut self) -> io::Result<Option<(Vec<String>, u64)>> {
        let Some((value, consumed)) = self.read_value()? else {
            return Ok(None);
        };
        let Value::Array(vals) = value else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expected multibulk",
            ));
        };
        let mut args = Vec::with_capacity(vals.len());
        for v in vals {
            match v {
                Value::Bulk(b) => args.push(String::from_utf8_lossy(&b).into_owned()),
                Value::Simple(s) => args.push(s),
                Value::Integer(n) => args.push(n.to_string()),
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "multibulk element must be a bulk string",
                    ));
                }
            }
        }
        Ok(Some((args, consumed)))
    }
}

fn parse_int(s: &str) -> io::Result<i64> {
    s.trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad resp integer"))
}

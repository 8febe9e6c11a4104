//! Minimal HTTP front end.
//!
//! The streaming core treats request parsing as an external concern; this
//! module reads just enough of the head to route a connection - method,
//! target, query, headers - then wraps the stream in the core's non-blocking
//! [`Socket`] seam and gets out of the way.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use embercast_core::{RequestHead, Socket};

/// Largest request head we accept.
const MAX_HEAD: usize = 8192;

/// How long a client may take to send its head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Non-blocking socket over an accepted TCP stream.
///
/// Bytes that arrived behind the request head (producers often start
/// streaming immediately) are replayed before the kernel buffer.
pub struct TcpSocket {
    stream: TcpStream,
    buffered: Vec<u8>,
    pos: usize,
}

impl TcpSocket {
    pub fn new(stream: TcpStream, leftover: Vec<u8>) -> io::Result<Self> {
        stream.set_read_timeout(None)?;
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            buffered: leftover,
            pos: 0,
        })
    }

    fn buffered_left(&self) -> usize {
        self.buffered.len() - self.pos
    }
}

impl Socket for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffered_left() > 0 {
            let n = buf.len().min(self.buffered_left());
            buf[..n].copy_from_slice(&self.buffered[self.pos..self.pos + n]);
            self.pos += n;
            if self.buffered_left() == 0 {
                self.buffered.clear();
                self.pos = 0;
            }
            return Ok(n);
        }
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn readable(&mut self) -> io::Result<bool> {
        if self.buffered_left() > 0 {
            return Ok(true);
        }
        let mut probe = [0u8; 1];
        match self.stream.peek(&mut probe) {
            Ok(_) => Ok(true), // data, or EOF the next read will surface
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Reads and parses a request head, returning any stream bytes that
/// followed it.
pub fn read_head(stream: &mut TcpStream) -> Result<(RequestHead, Vec<u8>)> {
    stream.set_read_timeout(Some(HEAD_TIMEOUT))?;
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(p) = find_head_end(&buf) {
            break p;
        }
        if buf.len() > MAX_HEAD {
            bail!("request head too large");
        }
        let n = stream.read(&mut chunk).context("reading request head")?;
        if n == 0 {
            bail!("connection closed before head completed");
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head_text = std::str::from_utf8(&buf[..head_end]).context("head is not UTF-8")?;
    let head = parse_head(head_text)?;
    let leftover = buf[head_end + 4..].to_vec();
    Ok((head, leftover))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(text: &str) -> Result<RequestHead> {
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_ascii_uppercase();
    let target = parts.next().unwrap_or_default();
    if method.is_empty() || target.is_empty() {
        bail!("malformed request line: {request_line:?}");
    }

    let (uri, query_text) = match target.split_once('?') {
        Some((u, q)) => (u, Some(q)),
        None => (target, None),
    };
    let mut query = BTreeMap::new();
    if let Some(q) = query_text {
        for pair in q.split('&') {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            if !k.is_empty() {
                query.insert(k.to_string(), v.to_string());
            }
        }
    }

    let mut headers = BTreeMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Ok(RequestHead {
        method,
        uri: uri.to_string(),
        query,
        headers,
        username: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_line_query_and_headers() {
        let head = parse_head(
            "GET /live?burst=8192 HTTP/1.1\r\nHost: radio\r\nInitial-Burst: 4096",
        )
        .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.uri, "/live");
        assert_eq!(head.query_param("burst"), Some("8192"));
        assert_eq!(head.header("initial-burst"), Some("4096"));
        assert_eq!(head.header("host"), Some("radio"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_head("\r\n").is_err());
    }
}

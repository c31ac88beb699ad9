// src/conn.rs
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::buffer::ByteBuffer;
use crate::config::ServerConfig;
use crate::http::Request;
use crate::parser::{HttpParser, ParseStatus};
use crate::response::Response;
use crate::syscalls;

/// Level-triggered writes keep looping while more than this remains.
pub const WRITE_LOOP_THRESHOLD: usize = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Idle,
    Reading,
    Processing,
    Writing,
    Closed,
}

/// One accepted client socket with its buffers, parser and pending response.
///
/// The outgoing response is two segments sent with a single `writev`: the
/// unread part of `write_buf` (status line and headers) followed by the
/// mapped file from `file_offset` on.
pub struct Connection {
    fd: RawFd,
    addr: SocketAddr,
    state: ConnState,
    read_buf: ByteBuffer,
    write_buf: ByteBuffer,
    parser: HttpParser,
    request: Request,
    response: Response,
    file_offset: usize,
    config: Arc<ServerConfig>,
    users: Arc<AtomicUsize>,
}

impl Connection {
    pub fn new(
        fd: RawFd,
        addr: SocketAddr,
        config: Arc<ServerConfig>,
        users: Arc<AtomicUsize>,
    ) -> Self {
        let mut conn = Self {
            fd: -1,
            addr,
            state: ConnState::Closed,
            read_buf: ByteBuffer::new(),
            write_buf: ByteBuffer::new(),
            parser: HttpParser::new(config.max_request_bytes),
            request: Request::new(),
            response: Response::new(),
            file_offset: 0,
            config,
            users,
        };
        conn.init(fd, addr);
        conn
    }

    /// Take ownership of `fd` and start from empty buffers. A previously held
    /// socket is closed first.
    pub fn init(&mut self, fd: RawFd, addr: SocketAddr) {
        self.close();
        self.fd = fd;
        self.addr = addr;
        self.state = ConnState::Idle;
        self.read_buf.retrieve_all();
        self.write_buf.retrieve_all();
        self.parser.reset();
        self.request.reset();
        self.file_offset = 0;
        let users = self.users.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(fd, %addr, users, "client connected");
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Keep-alive decision of the response being written.
    pub fn is_keep_alive(&self) -> bool {
        self.response.is_keep_alive()
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Bytes of the current response not yet accepted by the socket.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable_bytes() + self.response.file_len() - self.file_offset
    }

    /// The two pending segments: headers, then the rest of the file.
    pub fn pending(&self) -> (&[u8], &[u8]) {
        (
            self.write_buf.peek(),
            &self.response.file()[self.file_offset..],
        )
    }

    /// Read what the socket has. Level-triggered reads once, edge-triggered
    /// drains until would-block.
    ///
    /// `Ok(0)` means the peer closed without sending anything more. A
    /// would-block error is only returned when nothing was read.
    pub fn read(&mut self) -> io::Result<usize> {
        self.state = ConnState::Reading;
        let edge = self.config.trigger_mode.conn_edge;
        let mut total = 0;
        loop {
            match self.read_buf.read_fd(self.fd) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if !edge {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Parse buffered input and, once a request is complete (or malformed),
    /// render its response. Returns `true` when a response is ready to write.
    pub fn process(&mut self) -> bool {
        self.state = ConnState::Processing;
        if self.parser.is_finished() {
            self.parser.reset();
            self.request.reset();
        }
        if self.read_buf.readable_bytes() == 0 {
            self.state = ConnState::Idle;
            return false;
        }

        match self.parser.parse(&mut self.read_buf, &mut self.request) {
            Ok(ParseStatus::Complete) => {
                debug!(fd = self.fd, method = %self.request.method, path = %self.request.path, "request");
                self.response.init(
                    &self.config.doc_root,
                    &self.request.path,
                    self.request.is_keep_alive(),
                    Some(200),
                );
            }
            Ok(ParseStatus::Incomplete) => return false,
            Err(e) => {
                debug!(fd = self.fd, error = %e, "bad request");
                self.read_buf.retrieve_all();
                self.response
                    .init(&self.config.doc_root, &self.request.path, false, Some(400));
            }
        }

        self.write_buf.retrieve_all();
        self.response.make_response(&mut self.write_buf);
        self.file_offset = 0;
        self.state = ConnState::Writing;
        true
    }

    /// Gather-write the pending segments. Edge-triggered connections loop
    /// until drained or would-block; level-triggered ones loop only while a
    /// large remainder is left.
    ///
    /// Errors (including would-block) are returned as-is; the caller checks
    /// [`to_write_bytes`](Self::to_write_bytes) first.
    pub fn write(&mut self) -> io::Result<usize> {
        self.state = ConnState::Writing;
        let edge = self.config.trigger_mode.conn_edge;
        let mut total = 0;
        while self.to_write_bytes() > 0 {
            let (head, body) = self.pending();
            let n = match syscalls::writev(self.fd, &[head, body]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                break;
            }
            self.advance(n);
            total += n;
            if !edge && self.to_write_bytes() <= WRITE_LOOP_THRESHOLD {
                break;
            }
        }
        Ok(total)
    }

    /// Account for `n` bytes accepted by the socket across both segments.
    pub fn advance(&mut self, n: usize) {
        let head = self.write_buf.readable_bytes();
        if n >= head {
            self.write_buf.retrieve_all();
            self.file_offset = (self.file_offset + n - head).min(self.response.file_len());
        } else {
            self.write_buf.retrieve(n);
        }
    }

    /// Release the mapping and the socket. Only the first call has effect.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        self.response.unmap_file();
        syscalls::close_fd(self.fd);
        let users = self.users.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(fd = self.fd, addr = %self.addr, users, "client closed");
        self.fd = -1;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("to_write", &self.to_write_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TriggerMode;
    use std::io::{Read, Write};
    use std::fs::Permissions;
    use std::os::fd::IntoRawFd;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixStream;
    use std::path::Path;

    fn doc_root(body: &[u8]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, data) in [
            ("index.html", body),
            ("404.html", b"<h1>missing</h1>".as_slice()),
            ("400.html", b"<h1>bad</h1>".as_slice()),
        ] {
            let path = dir.path().join(name);
            std::fs::write(&path, data).unwrap();
            std::fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();
        }
        dir
    }

    fn connect(root: &Path, mode: u8) -> (Connection, UnixStream, Arc<AtomicUsize>) {
        let config = Arc::new(ServerConfig {
            doc_root: root.to_path_buf(),
            trigger_mode: TriggerMode::from_code(mode),
            ..ServerConfig::default()
        });
        let users = Arc::new(AtomicUsize::new(0));
        let (ours, peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let addr = "127.0.0.1:4000".parse().unwrap();
        let conn = Connection::new(ours.into_raw_fd(), addr, config, users.clone());
        (conn, peer, users)
    }

    fn read_response(peer: &mut UnixStream, len: usize) -> String {
        let mut out = vec![0u8; len];
        peer.read_exact(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_serves_file_and_keeps_alive() {
        let root = doc_root(b"<h1>home</h1>");
        let (mut conn, mut peer, users) = connect(root.path(), 3);
        assert_eq!(users.load(Ordering::Acquire), 1);

        peer.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert!(conn.read().unwrap() > 0);
        assert!(conn.process());
        assert_eq!(conn.state(), ConnState::Writing);
        assert!(conn.is_keep_alive());
        assert_eq!(conn.request().path, "/index.html");

        let total = conn.to_write_bytes();
        conn.write().unwrap();
        assert_eq!(conn.to_write_bytes(), 0);

        let text = read_response(&mut peer, total);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\n<h1>home</h1>"));

        // nothing buffered: wait for the next request
        assert!(!conn.process());
        assert_eq!(conn.state(), ConnState::Idle);
    }

    #[test]
    fn test_fragmented_request() {
        let root = doc_root(b"home");
        let (mut conn, mut peer, _) = connect(root.path(), 0);

        peer.write_all(b"GET /index.html HT").unwrap();
        conn.read().unwrap();
        assert!(!conn.process());

        peer.write_all(b"TP/1.1\r\n\r\n").unwrap();
        conn.read().unwrap();
        assert!(conn.process());
        assert_eq!(conn.response().code(), 200);
    }

    #[test]
    fn test_malformed_request_closes() {
        let root = doc_root(b"home");
        let (mut conn, mut peer, _) = connect(root.path(), 3);

        peer.write_all(b"NONSENSE\r\n\r\n").unwrap();
        conn.read().unwrap();
        assert!(conn.process());
        assert_eq!(conn.response().code(), 400);
        assert!(!conn.is_keep_alive());
    }

    #[test]
    fn test_partial_write_accounting() {
        let body: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let root = doc_root(&body);
        let (mut conn, mut peer, _) = connect(root.path(), 3);

        peer.write_all(b"GET /index.html HTTP/1.1\r\n\r\n").unwrap();
        conn.read().unwrap();
        assert!(conn.process());

        let head_len = conn.pending().0.len();
        assert_eq!(conn.to_write_bytes(), head_len + 1000);

        // the socket took the headers and 100 bytes of the file
        conn.advance(head_len + 100);
        let (head, rest) = conn.pending();
        assert!(head.is_empty());
        assert_eq!(rest, &body[100..]);
        assert_eq!(conn.to_write_bytes(), 900);

        conn.write().unwrap();
        assert_eq!(conn.to_write_bytes(), 0);
        let mut got = vec![0u8; 900];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(got, &body[100..]);
    }

    #[test]
    fn test_partial_header_write() {
        let root = doc_root(b"abc");
        let (mut conn, mut peer, _) = connect(root.path(), 3);
        peer.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        conn.read().unwrap();
        assert!(conn.process());

        let head_len = conn.pending().0.len();
        conn.advance(5);
        assert_eq!(conn.pending().0.len(), head_len - 5);
        assert_eq!(conn.pending().1, b"abc");
    }

    #[test]
    fn test_peer_close_reads_zero() {
        let root = doc_root(b"home");
        let (mut conn, peer, _) = connect(root.path(), 1);
        drop(peer);
        assert_eq!(conn.read().unwrap(), 0);
    }

    #[test]
    fn test_close_once() {
        let root = doc_root(b"home");
        let (mut conn, _peer, users) = connect(root.path(), 3);
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(users.load(Ordering::Acquire), 0);
        conn.close();
        drop(conn);
        assert_eq!(users.load(Ordering::Acquire), 0);
    }
}

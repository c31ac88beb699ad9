// src/buffer.rs
use libc::c_void;
use std::io;
use std::os::fd::RawFd;

pub const INITIAL_BUF_SIZE: usize = 1024;

/// Stack-local spill area for `read_fd`. A single `readv` can pull up to this
/// many bytes beyond the buffer's current writable tail.
const OVERFLOW_SIZE: usize = 65535;

/// Growable byte region with independent read and write cursors.
///
/// Layout: `[0, read_pos)` is reclaimable, `[read_pos, write_pos)` is the
/// unread payload and `[write_pos, len)` is writable tail.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_BUF_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    #[inline(always)]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline(always)]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    #[inline(always)]
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The unread region. Does not consume anything.
    #[inline(always)]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Consume `len` unread bytes.
    pub fn retrieve(&mut self, len: usize) {
        assert!(
            len <= self.readable_bytes(),
            "retrieve({}) past readable region ({})",
            len,
            self.readable_bytes()
        );
        self.read_pos += len;
    }

    /// Consume everything before `end`, an offset into `peek()`.
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    /// Reset both cursors and zero the backing memory.
    pub fn retrieve_all(&mut self) {
        self.buf.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Writable tail, to be followed by `has_written`.
    pub fn begin_write(&mut self) -> &mut [u8] {
        &mut self.buf[self.write_pos..]
    }

    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.write_pos += len;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.buf.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }

    /// Fill the buffer from a readiness-signaled descriptor with one `readv`.
    ///
    /// The first iovec is the writable tail; anything beyond lands in a stack
    /// spill area and is appended afterwards, growing the buffer.
    /// `Ok(0)` means the peer closed its side.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut overflow = [0u8; OVERFLOW_SIZE];
        let writable = self.writable_bytes();

        let iov = [
            libc::iovec {
                iov_base: self.buf[self.write_pos..].as_mut_ptr() as *mut c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: overflow.as_mut_ptr() as *mut c_void,
                iov_len: overflow.len(),
            },
        ];

        let res = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = res as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&overflow[..n - writable]);
        }
        Ok(n)
    }

    /// Drain unread bytes with a single `write`, consuming what was accepted.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.peek();
        let res = unsafe {
            libc::write(fd, readable.as_ptr() as *const c_void, readable.len())
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        self.read_pos += res as usize;
        Ok(res as usize)
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_append_retrieve_accounting() {
        let mut buf = ByteBuffer::with_capacity(8);
        let mut appended = 0;
        let mut retrieved = 0;

        for round in 0..50usize {
            let chunk = vec![b'a' + (round % 26) as u8; round % 13 + 1];
            buf.append(&chunk);
            appended += chunk.len();

            let take = buf.readable_bytes() / 2;
            buf.retrieve(take);
            retrieved += take;

            assert_eq!(buf.readable_bytes(), appended - retrieved);
        }
    }

    #[test]
    fn test_compacts_before_growing() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.append(b"0123456789abcdef");
        buf.retrieve(12);
        assert_eq!(buf.prependable_bytes(), 12);

        // 4 unread + 10 new fits once the consumed prefix is reclaimed
        buf.append(b"ghijklmnop");
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.prependable_bytes(), 0);
        assert_eq!(buf.peek(), b"cdefghijklmnop");
    }

    #[test]
    fn test_grows_when_reclaim_is_not_enough() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.append(b"abc");
        buf.append(b"defgh");
        assert!(buf.capacity() >= 8);
        assert_eq!(buf.peek(), b"abcdefgh");
    }

    #[test]
    fn test_retrieve_all_zeroes() {
        let mut buf = ByteBuffer::with_capacity(8);
        buf.append(b"hello");
        assert_eq!(buf.retrieve_all_to_string(), "hello");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), 8);
        assert!(buf.begin_write().iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic]
    fn test_retrieve_past_end_panics() {
        let mut buf = ByteBuffer::new();
        buf.append(b"ab");
        buf.retrieve(3);
    }

    #[test]
    fn test_read_fd_spills_into_overflow() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        tx.write_all(&payload).unwrap();

        let mut buf = ByteBuffer::with_capacity(64);
        let n = buf.read_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), payload.as_slice());
        assert!(buf.capacity() >= payload.len());
    }

    #[test]
    fn test_read_fd_would_block() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        let mut buf = ByteBuffer::new();
        let err = buf.read_fd(rx.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_write_fd_advances_read_cursor() {
        let (tx, mut rx) = UnixStream::pair().unwrap();
        let mut buf = ByteBuffer::new();
        buf.append(b"GET / HTTP/1.1\r\n");

        let n = buf.write_fd(tx.as_raw_fd()).unwrap();
        assert_eq!(n, 16);
        assert_eq!(buf.readable_bytes(), 0);

        let mut out = [0u8; 16];
        rx.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"GET / HTTP/1.1\r\n");
    }
}

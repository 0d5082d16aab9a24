//! Growable byte queue used for connection input and output.
//!
//! Layout:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0        <=     read_index    <=   write_index   <=   capacity
//! ```
//!
//! The small fixed prepend area lets a caller stamp a length or framing
//! prefix in front of already-queued data without shifting it.

use std::io;
use std::os::fd::RawFd;

/// Outcome of [`Buffer::read_fd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    /// Bytes appended to the buffer. Zero means the socket had nothing to
    /// deliver (a spurious readiness wake), not end-of-stream.
    Read(usize),
    /// The peer closed its write half before any byte was read.
    Eof,
}

/// Size of the reserved prepend area.
const CHEAP_PREPEND: usize = 8;
/// Initial readable/writable capacity.
const INITIAL_SIZE: usize = 1024;

/// Byte queue with a cheap-prepend area and scatter-read fd support.
#[derive(Debug)]
pub struct Buffer {
    storage: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            storage: vec![0; CHEAP_PREPEND + initial],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to read.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Number of bytes that can be appended without growing.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_index
    }

    /// Bytes in front of the readable region (prepend area plus consumed
    /// slack).
    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_index == self.write_index
    }

    /// The readable region.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.storage[self.read_index..self.write_index]
    }

    /// Consume `len` bytes from the front of the readable region.
    pub fn retrieve(&mut self, len: usize) {
        assert!(
            len <= self.readable_bytes(),
            "retrieve({}) exceeds readable bytes ({})",
            len,
            self.readable_bytes()
        );
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Discard everything and reset both indices to the prepend boundary.
    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Consume `len` bytes and return them as a string (lossy on invalid
    /// UTF-8).
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        assert!(len <= self.readable_bytes());
        let s = String::from_utf8_lossy(&self.readable()[..len]).into_owned();
        self.retrieve(len);
        s
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Append bytes, growing or compacting as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.write_index..self.write_index + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Write bytes into the prepend area, immediately in front of the
    /// readable region.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend({}) exceeds prependable bytes ({})",
            data.len(),
            self.prependable_bytes()
        );
        self.read_index -= data.len();
        self.storage[self.read_index..self.read_index + data.len()].copy_from_slice(data);
    }

    /// Position of the first `\r\n` within the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.readable().windows(2).position(|w| w == b"\r\n")
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Grow, or compact by moving the readable region back to the prepend
    /// boundary when the combined front and back slack is sufficient.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.storage.resize(self.write_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            // copy_within handles the overlapping ranges.
            self.storage
                .copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = CHEAP_PREPEND + readable;
        }
    }

    /// Scatter-read from `fd` into the writable region plus a 64 KiB stack
    /// spill area, looping until the kernel reports `EAGAIN`.
    ///
    /// Returns [`ReadResult::Eof`] only when the peer closed before any byte
    /// was read this call; a close observed after data was read surfaces on
    /// the next readiness event.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<ReadResult> {
        let mut spill = [0u8; 65536];
        let mut total = 0usize;

        loop {
            let writable = self.writable_bytes();
            let mut iov = [
                libc::iovec {
                    iov_base: self.storage[self.write_index..].as_mut_ptr() as *mut libc::c_void,
                    iov_len: writable,
                },
                libc::iovec {
                    iov_base: spill.as_mut_ptr() as *mut libc::c_void,
                    iov_len: spill.len(),
                },
            ];
            let iovcnt = if writable < spill.len() { 2 } else { 1 };

            let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => break,
                    _ => return Err(err),
                }
            } else if n == 0 {
                if total == 0 {
                    return Ok(ReadResult::Eof);
                }
                break;
            } else {
                let n = n as usize;
                if n <= writable {
                    self.write_index += n;
                } else {
                    // The writable region filled up; the rest landed in the
                    // spill area and gets appended (which grows the buffer).
                    self.write_index = self.storage.len();
                    self.append(&spill[..n - writable]);
                }
                total += n;
            }
        }

        Ok(ReadResult::Read(total))
    }

    /// Write the readable region to `fd`, looping until the buffer drains
    /// or the kernel reports `EAGAIN`. `EINTR` is retried transparently.
    ///
    /// Returns the number of bytes written; the caller checks
    /// [`readable_bytes`](Self::readable_bytes) to learn whether a drain
    /// completed.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut total = 0usize;

        while self.readable_bytes() > 0 {
            let n = unsafe {
                libc::write(
                    fd,
                    self.readable().as_ptr() as *const libc::c_void,
                    self.readable_bytes(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => break,
                    _ => return Err(err),
                }
            }
            let n = n as usize;
            self.retrieve(n);
            total += n;
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_basic_append_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), 8);
        assert!(buf.is_empty());

        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.readable(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.readable(), b"world");
        assert_eq!(buf.prependable_bytes(), 8 + 6);

        buf.retrieve(5);
        assert!(buf.is_empty());
        assert_eq!(buf.prependable_bytes(), 8);
    }

    #[test]
    fn test_round_trip_concatenation() {
        let mut buf = Buffer::new();
        let parts: [&[u8]; 4] = [b"one", b"", b"two-three", b"4"];
        for p in parts {
            buf.append(p);
        }
        let total: usize = parts.iter().map(|p| p.len()).sum();
        assert_eq!(buf.retrieve_as_string(total), "onetwo-three4");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_prepend() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(b"\x00\x07");
        assert_eq!(buf.readable(), b"\x00\x07payload");
        assert_eq!(buf.prependable_bytes(), 6);
    }

    #[test]
    fn test_compact_instead_of_grow() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[b'a'; 16]);
        buf.retrieve(10);
        let cap_before = buf.storage.len();

        // 10 front slack + 0 back slack is enough for 9 more bytes.
        buf.append(&[b'b'; 9]);
        assert_eq!(buf.storage.len(), cap_before);
        assert_eq!(buf.readable_bytes(), 15);
        assert_eq!(&buf.readable()[..6], b"aaaaaa");
    }

    #[test]
    fn test_grow_when_slack_insufficient() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[b'a'; 16]);
        let cap_before = buf.storage.len();
        buf.append(&[b'b'; 64]);
        assert!(buf.storage.len() > cap_before);
        assert_eq!(buf.readable_bytes(), 80);
    }

    #[test]
    fn test_find_crlf() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(buf.find_crlf(), Some(14));
        buf.retrieve(16);
        assert_eq!(buf.find_crlf(), Some(7));
        buf.retrieve_all();
        assert_eq!(buf.find_crlf(), None);
    }

    #[test]
    fn test_read_fd_and_eof() {
        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();

        writer.write_all(b"ping").unwrap();
        let mut buf = Buffer::new();
        assert_eq!(
            buf.read_fd(reader.as_raw_fd()).unwrap(),
            ReadResult::Read(4)
        );
        assert_eq!(buf.readable(), b"ping");

        // Nothing pending: not EOF, just an empty read.
        assert_eq!(
            buf.read_fd(reader.as_raw_fd()).unwrap(),
            ReadResult::Read(0)
        );

        drop(writer);
        assert_eq!(buf.read_fd(reader.as_raw_fd()).unwrap(), ReadResult::Eof);
    }

    #[test]
    fn test_read_fd_spills_past_writable_region() {
        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();

        let payload = vec![0xabu8; 8192];
        writer.write_all(&payload).unwrap();

        let mut buf = Buffer::with_capacity(16);
        match buf.read_fd(reader.as_raw_fd()).unwrap() {
            ReadResult::Read(n) => assert_eq!(n, payload.len()),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(buf.readable(), &payload[..]);
    }

    #[test]
    fn test_write_fd_drains() {
        let (reader_end, writer_end) = UnixStream::pair().unwrap();
        writer_end.set_nonblocking(true).unwrap();

        let mut buf = Buffer::new();
        buf.append(b"response bytes");
        let n = buf.write_fd(writer_end.as_raw_fd()).unwrap();
        assert_eq!(n, 14);
        assert!(buf.is_empty());

        let mut reader_end = reader_end;
        let mut out = [0u8; 14];
        reader_end.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"response bytes");
    }
}

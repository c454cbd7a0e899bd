//! Growable, prependable byte buffer used to stage socket reads and writes.
//!
//! Three indices -- `reader_idx <= writer_idx <= buf.len()` -- split the
//! backing `Vec<u8>` into a prependable region, a readable span and a
//! writable span. Consuming the readable span down to empty resets both
//! indices to the origin so the buffer never creeps forward unbounded.

use std::io;
use std::os::unix::io::RawFd;

/// Extra room grabbed via `readv` so a single syscall can drain more than
/// currently fits in the buffer's writable span without resizing first.
const SPILL_SIZE: usize = 64 * 1024;

const INITIAL_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct ByteBuffer {
    buf: Vec<u8>,
    reader_idx: usize,
    writer_idx: usize,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Self {
        Self { buf: vec![0; initial], reader_idx: 0, writer_idx: 0 }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer_idx - self.reader_idx
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_idx
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader_idx
    }

    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_idx..self.writer_idx]
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Advances the writer index. Callers must have just written `len`
    /// bytes into the writable span (e.g. via `ensure_writable` + a raw
    /// copy, or as the return value of a successful `read_fd`).
    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable_bytes());
        self.writer_idx += len;
    }

    pub fn retrieve(&mut self, len: usize) {
        debug_assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_idx += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Retrieves bytes up to (but not including) the given absolute index,
    /// which must fall within the current readable span.
    pub fn retrieve_until(&mut self, end: usize) {
        debug_assert!(end >= self.reader_idx && end <= self.writer_idx);
        self.retrieve(end - self.reader_idx);
    }

    pub fn retrieve_all(&mut self) {
        self.reader_idx = 0;
        self.writer_idx = 0;
    }

    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.writer_idx;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    /// Growth policy: reuse the already-consumed prefix when it plus the
    /// tail room covers `len`; otherwise grow the backing store.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() >= len {
            self.buf.copy_within(self.reader_idx..self.writer_idx, 0);
            self.writer_idx -= self.reader_idx;
            self.reader_idx = 0;
        } else {
            self.buf.resize(self.writer_idx + len, 0);
        }
    }

    /// Scatter-reads into the writable span plus a transient stack
    /// extension, so one syscall can drain large edge-triggered bursts
    /// without a resize on the hot path. Returns `Ok(0)` on EOF and an
    /// `ErrorKind::WouldBlock` error when the socket has no more data.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; SPILL_SIZE];
        self.ensure_writable(1);
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.writer_idx..].as_mut_ptr().cast(),
                iov_len: writable,
            },
            libc::iovec { iov_base: extra.as_mut_ptr().cast(), iov_len: extra.len() },
        ];

        // SAFETY: both iovec entries point into memory we own for the
        // duration of this call (`self.buf`'s writable tail and the local
        // stack array), and `fd` is a socket owned by the caller.
        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iov.len() as libc::c_int) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;

        if n <= writable {
            self.has_written(n);
        } else {
            self.has_written(writable);
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable span directly and retrieves whatever portion
    /// the kernel accepted.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.peek();
        if readable.is_empty() {
            return Ok(0);
        }
        // SAFETY: `readable` points into `self.buf`'s live readable span
        // for the duration of this call.
        let n = unsafe {
            libc::write(fd, readable.as_ptr().cast(), readable.len())
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        self.retrieve(n);
        Ok(n)
    }
}

use std::io;
use std::os::fd::RawFd;

/// Bytes reserved in front of the readable region so a length or type prefix
/// can be prepended without shifting the payload.
const PREPEND: usize = 8;
/// Initial size of the writable region.
const INITIAL_SIZE: usize = 1024;

/// A growable byte queue backing one direction of a connection.
///
/// The backing storage is split into three regions by a reader index `r` and
/// a writer index `w`:
///
/// ```text
/// +-------------+------------------+------------------+
/// | prependable |     readable     |     writable     |
/// +-------------+------------------+------------------+
/// 0             r                  w           capacity
/// ```
///
/// Incoming bytes are appended at `w`, consumed from `r`. When the writable
/// tail runs short the buffer first compacts (moves `[r, w)` back to the
/// prepend boundary) and only grows the backing storage if compaction is not
/// enough.
///
/// A `Buffer` is owned by exactly one connection and only touched on that
/// connection's loop thread.
#[derive(Debug)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Buffer {
    /// Creates a buffer with the default initial size.
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// Creates a buffer whose writable region starts at `size` bytes.
    pub fn with_capacity(size: usize) -> Buffer {
        Buffer {
            buf: vec![0; PREPEND + size],
            reader_index: PREPEND,
            writer_index: PREPEND,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Number of bytes that can be appended without reallocating.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    /// Number of bytes in front of the readable region.
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// Returns the readable bytes without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Consumes `len` readable bytes. Consuming everything (or more) resets
    /// both indices to the prepend boundary.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Discards all readable bytes.
    pub fn retrieve_all(&mut self) {
        self.reader_index = PREPEND;
        self.writer_index = PREPEND;
    }

    /// Consumes `len` readable bytes and returns them.
    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let data = self.buf[self.reader_index..self.reader_index + len].to_vec();
        self.retrieve(len);
        data
    }

    /// Consumes and returns all readable bytes.
    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        self.retrieve_as_vec(self.readable_bytes())
    }

    /// Consumes all readable bytes as a string, replacing invalid UTF-8 with
    /// the replacement character.
    pub fn retrieve_all_as_string(&mut self) -> String {
        let data = self.retrieve_all_as_vec();
        String::from_utf8_lossy(&data).into_owned()
    }

    /// Appends `data` to the writable region, growing if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Writes `data` directly in front of the readable bytes.
    ///
    /// Panics if `data` is longer than the prependable region; callers size
    /// their prefix against the fixed prepend reservation.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        self.buf[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // Enough room overall, move the readable bytes to the front.
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader_index..self.writer_index, PREPEND);
            self.reader_index = PREPEND;
            self.writer_index = PREPEND + readable;
        }
    }

    /// Reads from `fd` once, into the writable tail plus a 64 KiB stack
    /// scratch area via a scattered read. Bytes landing in the scratch area
    /// are appended after the fact, so a single call can absorb up to
    /// `writable_bytes() + 65536` bytes while keeping the common case free
    /// of extra allocations. Returns the total number of bytes read; `Ok(0)`
    /// means the peer closed its write side.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();
        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.writer_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let iov_cnt: libc::c_int = if writable < extra.len() { 2 } else { 1 };

        let n = syscall!(readv(fd, iov.as_mut_ptr(), iov_cnt))? as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable bytes to `fd` once, without consuming them; the
    /// caller retrieves whatever the kernel accepted.
    pub fn write_fd(&self, fd: RawFd) -> io::Result<usize> {
        let readable = self.peek();
        let n = syscall!(write(
            fd,
            readable.as_ptr() as *const libc::c_void,
            readable.len(),
        ))?;
        Ok(n as usize)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Buffer, PREPEND};

    #[test]
    fn append_then_retrieve_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        buf.append(b" world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");
        assert_eq!(buf.retrieve_all_as_string(), "hello world");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), PREPEND);
    }

    #[test]
    fn partial_retrieve_advances_reader() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        buf.retrieve(2);
        assert_eq!(buf.peek(), b"cdef");
        assert_eq!(buf.prependable_bytes(), PREPEND + 2);
        // Over-consuming resets instead of underflowing.
        buf.retrieve(100);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), PREPEND);
    }

    #[test]
    fn prepend_fills_the_reserved_zone() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());
        assert_eq!(buf.prependable_bytes(), PREPEND - 4);
        assert_eq!(&buf.retrieve_all_as_vec()[4..], b"payload");
    }

    #[test]
    fn compaction_reclaims_consumed_space() {
        let mut buf = Buffer::with_capacity(32);
        buf.append(&[1u8; 24]);
        buf.retrieve(20);
        let cap_before = buf.writable_bytes() + buf.readable_bytes() + buf.prependable_bytes();
        // 24 bytes do not fit the tail but do fit after compaction.
        buf.append(&[2u8; 24]);
        let cap_after = buf.writable_bytes() + buf.readable_bytes() + buf.prependable_bytes();
        assert_eq!(cap_before, cap_after);
        let data = buf.retrieve_all_as_vec();
        assert_eq!(&data[..4], &[1, 1, 1, 1]);
        assert_eq!(&data[4..], &[2u8; 24][..]);
    }

    #[test]
    fn growth_when_compaction_is_not_enough() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[3u8; 16]);
        buf.append(&[4u8; 100]);
        assert_eq!(buf.readable_bytes(), 116);
        let data = buf.retrieve_all_as_vec();
        assert_eq!(&data[..16], &[3u8; 16][..]);
        assert_eq!(&data[16..], &[4u8; 100][..]);
    }
}

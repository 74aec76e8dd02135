//! Growable byte buffer for non-blocking socket I/O.
//!
//! Layout mirrors the classic reactor buffer:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0      <=      reader_index   <=   writer_index    <=    len
//! ```
//!
//! The first [`CHEAP_PREPEND`] bytes are reserved so a length or message
//! header can be prepended after the payload was appended, without moving
//! the payload.

use std::io;
use std::os::fd::RawFd;

/// Reserved head room for prepending headers.
pub const CHEAP_PREPEND: usize = 8;
/// Initial readable/writable capacity.
pub const INITIAL_SIZE: usize = 1024;

/// Input/output buffer with separated read and write cursors.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    /// Creates a buffer with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Buffer::default()
    }

    /// Creates a buffer able to hold `initial` bytes before growing.
    #[must_use]
    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    /// Bytes available for reading.
    #[must_use]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Bytes that can be appended without growing.
    #[must_use]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    /// Bytes in front of the read cursor, available for prepending.
    #[must_use]
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region, without consuming it.
    #[must_use]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Offset of the first `\r\n` in the readable region.
    #[must_use]
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Offset of the first `\n` in the readable region.
    #[must_use]
    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// Consumes `len` readable bytes.
    ///
    /// # Panics
    /// if `len` exceeds the readable region
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consumes everything and rewinds both cursors to the head room.
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Consumes `len` bytes and returns them.
    #[must_use]
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let bytes = self.peek()[..len].to_vec();
        self.retrieve(len);
        bytes
    }

    /// Consumes the whole readable region and returns it.
    #[must_use]
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let len = self.readable_bytes();
        self.retrieve_as_bytes(len)
    }

    /// Consumes `len` bytes and returns them as a string, replacing
    /// invalid UTF-8.
    #[must_use]
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        String::from_utf8_lossy(&self.retrieve_as_bytes(len)).into_owned()
    }

    /// Consumes the whole readable region and returns it as a string.
    #[must_use]
    pub fn retrieve_all_as_string(&mut self) -> String {
        let len = self.readable_bytes();
        self.retrieve_as_string(len)
    }

    /// Appends `data` after the readable region, growing if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Makes room for at least `len` writable bytes.
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        assert!(self.writable_bytes() >= len);
    }

    /// Takes back `len` bytes that were appended but not meant to be kept.
    ///
    /// # Panics
    /// if `len` exceeds the readable region
    pub fn unwrite(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.writer_index -= len;
    }

    /// Writes `data` in front of the readable region.
    ///
    /// # Panics
    /// if the head room is smaller than `data`
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        self.buf[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    /// Appends a big-endian `i64`.
    pub fn append_i64(&mut self, x: i64) {
        self.append(&x.to_be_bytes());
    }

    /// Appends a big-endian `i32`.
    pub fn append_i32(&mut self, x: i32) {
        self.append(&x.to_be_bytes());
    }

    /// Appends a big-endian `i16`.
    pub fn append_i16(&mut self, x: i16) {
        self.append(&x.to_be_bytes());
    }

    /// Appends a single byte.
    pub fn append_i8(&mut self, x: i8) {
        self.append(&x.to_be_bytes());
    }

    /// Reads a big-endian `i64` without consuming it.
    ///
    /// # Panics
    /// if fewer than 8 bytes are readable
    #[must_use]
    pub fn peek_i64(&self) -> i64 {
        let mut be = [0_u8; 8];
        be.copy_from_slice(&self.peek()[..8]);
        i64::from_be_bytes(be)
    }

    /// Reads a big-endian `i32` without consuming it.
    ///
    /// # Panics
    /// if fewer than 4 bytes are readable
    #[must_use]
    pub fn peek_i32(&self) -> i32 {
        let mut be = [0_u8; 4];
        be.copy_from_slice(&self.peek()[..4]);
        i32::from_be_bytes(be)
    }

    /// Reads a big-endian `i16` without consuming it.
    ///
    /// # Panics
    /// if fewer than 2 bytes are readable
    #[must_use]
    pub fn peek_i16(&self) -> i16 {
        let mut be = [0_u8; 2];
        be.copy_from_slice(&self.peek()[..2]);
        i16::from_be_bytes(be)
    }

    /// Reads and consumes a big-endian `i64`.
    pub fn read_i64(&mut self) -> i64 {
        let x = self.peek_i64();
        self.retrieve(8);
        x
    }

    /// Reads and consumes a big-endian `i32`.
    pub fn read_i32(&mut self) -> i32 {
        let x = self.peek_i32();
        self.retrieve(4);
        x
    }

    /// Reads and consumes a big-endian `i16`.
    pub fn read_i16(&mut self) -> i16 {
        let x = self.peek_i16();
        self.retrieve(2);
        x
    }

    /// Drops spare capacity, keeping `reserve` writable bytes.
    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.readable_bytes();
        let mut shrunk = Buffer::with_capacity(readable + reserve);
        shrunk.append(self.peek());
        *self = shrunk;
    }

    /// Reads from `fd` into the buffer, growing only when the incoming
    /// burst exceeds the writable region.
    ///
    /// Uses scatter input with a 64 KiB stack spill so one syscall drains
    /// most bursts, however small the buffer currently is. Returns the
    /// number of bytes read; `Ok(0)` means end of stream.
    ///
    /// # Errors
    /// any `read(2)` error, `WouldBlock` included
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0_u8; 65536];
        let writable = self.writable_bytes();
        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.writer_index..].as_mut_ptr().cast(),
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr().cast(),
                iov_len: extrabuf.len(),
            },
        ];
        let iovcnt = if writable < extrabuf.len() { 2 } else { 1 };
        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        }
        // compact: move readable data back to the head room
        if self.reader_index > CHEAP_PREPEND {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_retrieve_accounting() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        let data = vec![b'x'; 200];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), 200);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE - 200);

        let head = buf.retrieve_as_string(50);
        assert_eq!(head.len(), 50);
        assert_eq!(buf.readable_bytes(), 150);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 50);

        buf.append(&data);
        assert_eq!(buf.readable_bytes(), 350);

        let rest = buf.retrieve_all_as_string();
        assert_eq!(rest.len(), 350);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'y'; 400]);
        buf.retrieve(50);
        buf.append(&vec![b'z'; 1000]);
        assert_eq!(buf.readable_bytes(), 1350);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn compacts_inside_current_allocation() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.retrieve(500);
        assert_eq!(buf.readable_bytes(), 300);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 500);

        // 400 fits once the 300 readable bytes move back to the front
        buf.append(&vec![b'b'; 400]);
        assert_eq!(buf.readable_bytes(), 700);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(&buf.peek()[..300], &vec![b'a'; 300][..]);
        assert_eq!(&buf.peek()[300..], &vec![b'b'; 400][..]);
    }

    #[test]
    fn prepend_uses_head_room() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7_i32.to_be_bytes());
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        assert_eq!(buf.read_i32(), 7);
        assert_eq!(buf.retrieve_all_as_string(), "payload");
    }

    #[test]
    fn big_endian_ints_round_trip() {
        let mut buf = Buffer::new();
        buf.append_i64(-1);
        buf.append_i32(0x0102_0304);
        buf.append_i16(512);
        buf.append_i8(-8);
        assert_eq!(buf.readable_bytes(), 15);
        assert_eq!(buf.read_i64(), -1);
        assert_eq!(buf.peek_i32(), 0x0102_0304);
        assert_eq!(buf.read_i32(), 0x0102_0304);
        assert_eq!(buf.read_i16(), 512);
        assert_eq!(buf.retrieve_as_bytes(1), vec![0xF8]);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn find_crlf_and_eol() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(buf.find_crlf(), Some(14));
        assert_eq!(buf.find_eol(), Some(15));
        buf.retrieve(16);
        assert_eq!(buf.find_crlf(), Some(7));
        buf.retrieve_all();
        assert_eq!(buf.find_crlf(), None);
        assert_eq!(buf.find_eol(), None);
    }

    #[test]
    fn shrink_keeps_content() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'q'; 2000]);
        buf.retrieve(1500);
        buf.shrink(0);
        assert_eq!(buf.readable_bytes(), 500);
        assert_eq!(buf.peek(), &vec![b'q'; 500][..]);
    }

    #[test]
    fn read_fd_spills_into_extra_buffer() {
        let mut fds = [0_i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let payload = vec![b'p'; 3000];
        let written = unsafe { libc::write(fds[1], payload.as_ptr().cast(), payload.len()) };
        assert_eq!(written, 3000);

        let mut buf = Buffer::with_capacity(100);
        let n = buf.read_fd(fds[0]).unwrap();
        assert_eq!(n, 3000);
        assert_eq!(buf.readable_bytes(), 3000);
        assert_eq!(buf.peek(), &payload[..]);

        unsafe {
            _ = libc::close(fds[0]);
            _ = libc::close(fds[1]);
        }
    }
}

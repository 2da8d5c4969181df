//! Ring-buffer framer for meta protocol responses.
//!
//! Socket bytes are pushed in as they arrive; complete records are pulled out
//! one at a time. A record is everything up to and including the first CRLF,
//! except that a `VA <len>` header also owns the following `<len>` bytes and
//! their trailing CRLF.
//!
//! # Example
//!
//! ```ignore
//! let mut framer = FrameBuffer::new(16 * 1024, 1 << 30);
//! framer.push(b"HD\r\nVA 4\r\nAB");
//!
//! let rec = framer.next_record()?.unwrap();   // HD
//! framer.read_out(&mut out);
//! assert!(framer.next_record()?.is_none());   // VA body incomplete
//!
//! framer.push(b"CD\r\n");
//! let rec = framer.next_record()?.unwrap();   // VA 4 + body
//! ```
//!
//! # Design
//!
//! Storage is a power-of-two circular array addressed through a bitmask.
//! `begin`, `end` and `scan` are monotonic positions; only `pos & mask`
//! touches memory. The header scan resumes from `scan`, so bytes that were
//! already checked for a line terminator are never looked at twice, and the
//! decoded `VA` length is kept until the body has fully arrived.

use crate::error::{MemcacheError, Result};

/// Default initial ring capacity.
pub const DEFAULT_FRAME_CAPACITY: usize = 16 * 1024;

/// Longest header line accepted before a CRLF must appear.
pub const MAX_HEADER_LEN: usize = 8192;

/// Default largest `VA` body accepted (1 GiB).
pub const DEFAULT_MAX_VALUE_SIZE: usize = 1 << 30;

/// Boundaries of one complete record at the front of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    /// Header line length including its CRLF.
    pub header_len: usize,
    /// Body length for `VA` records, excluding the trailing CRLF.
    pub body_len: Option<usize>,
}

impl Record {
    /// Total bytes the record occupies on the wire.
    #[inline]
    pub fn total_len(&self) -> usize {
        self.header_len + self.body_len.map_or(0, |n| n + 2)
    }
}

/// Circular byte buffer that yields complete protocol records.
pub struct FrameBuffer {
    buf: Box<[u8]>,
    mask: usize,
    begin: usize,
    end: usize,
    scan: usize,
    pending: Option<Record>,
    max_value_size: usize,
}

impl FrameBuffer {
    /// Create a framer. `capacity` is rounded up to a power of two.
    pub fn new(capacity: usize, max_value_size: usize) -> Self {
        let capacity = capacity.max(64).next_power_of_two();
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            mask: capacity - 1,
            begin: 0,
            end: 0,
            scan: 0,
            pending: None,
            max_value_size,
        }
    }

    /// Current ring capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Buffered bytes not yet read out.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Append bytes read from the socket, growing the ring if they do not fit.
    pub fn push(&mut self, data: &[u8]) {
        let needed = self.len() + data.len();
        if needed > self.capacity() {
            self.grow(needed);
        }
        self.write_at(self.end, data);
        self.end += data.len();
    }

    /// Look for a complete record at the front of the ring.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Repeated calls without
    /// a `read_out` return the same record.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        let record = match self.pending {
            Some(record) => record,
            None => match self.scan_header()? {
                Some(record) => {
                    self.pending = Some(record);
                    record
                }
                None => return Ok(None),
            },
        };

        if self.len() < record.total_len() {
            return Ok(None);
        }

        if let Some(body_len) = record.body_len {
            let tail = self.begin + record.header_len + body_len;
            if self.byte_at(tail) != b'\r' || self.byte_at(tail + 1) != b'\n' {
                return Err(MemcacheError::broken_pipe("VA body not terminated by CRLF"));
            }
        }

        Ok(Some(record))
    }

    /// Copy the whole front record (header and body) onto `out` and consume it.
    ///
    /// Returns `None` if no complete record is buffered.
    pub fn read_out(&mut self, out: &mut Vec<u8>) -> Option<Record> {
        let record = self.complete_pending()?;
        let total = record.total_len();
        let start = out.len();
        out.resize(start + total, 0);
        self.copy_range(self.begin, &mut out[start..]);
        self.consume(total);
        Some(record)
    }

    /// Copy the front record's header line onto `header` and its body into
    /// `body`, then consume it.
    ///
    /// `body` must be exactly the record's body length; for records without
    /// a body pass an empty slice.
    pub fn read_out_parts(&mut self, header: &mut Vec<u8>, body: &mut [u8]) -> Option<Record> {
        let record = self.complete_pending()?;
        if record.body_len.unwrap_or(0) != body.len() {
            return None;
        }
        let start = header.len();
        header.resize(start + record.header_len, 0);
        self.copy_range(self.begin, &mut header[start..]);
        self.copy_range(self.begin + record.header_len, body);
        self.consume(record.total_len());
        Some(record)
    }

    fn complete_pending(&self) -> Option<Record> {
        self.pending
            .filter(|record| self.len() >= record.total_len())
    }

    fn consume(&mut self, n: usize) {
        self.begin += n;
        self.scan = self.begin;
        self.pending = None;
        if self.begin == self.end {
            self.begin = 0;
            self.end = 0;
            self.scan = 0;
        }
    }

    fn scan_header(&mut self) -> Result<Option<Record>> {
        // Stop one short of `end`: a trailing '\r' may be half a CRLF.
        while self.scan + 1 < self.end {
            if self.byte_at(self.scan) == b'\r' && self.byte_at(self.scan + 1) == b'\n' {
                let header_len = self.scan + 2 - self.begin;
                let body_len = self.value_len(header_len)?;
                return Ok(Some(Record {
                    header_len,
                    body_len,
                }));
            }
            self.scan += 1;
        }

        if self.len() > MAX_HEADER_LEN {
            return Err(MemcacheError::broken_pipe(format!(
                "no CRLF within {} header bytes",
                MAX_HEADER_LEN
            )));
        }
        Ok(None)
    }

    /// Decode the `<len>` of a `VA <len> ...` header, `None` for other records.
    fn value_len(&self, header_len: usize) -> Result<Option<usize>> {
        if header_len < 3
            || self.byte_at(self.begin) != b'V'
            || self.byte_at(self.begin + 1) != b'A'
            || self.byte_at(self.begin + 2) != b' '
        {
            return Ok(None);
        }

        let line_end = self.begin + header_len - 2;
        let mut pos = self.begin + 3;
        let mut len: usize = 0;
        let mut digits = 0;
        while pos < line_end {
            let b = self.byte_at(pos);
            if b == b' ' {
                break;
            }
            if !b.is_ascii_digit() {
                return Err(MemcacheError::broken_pipe("malformed VA length"));
            }
            len = len
                .checked_mul(10)
                .and_then(|v| v.checked_add((b - b'0') as usize))
                .ok_or_else(|| MemcacheError::broken_pipe("VA length overflow"))?;
            digits += 1;
            pos += 1;
        }

        if digits == 0 {
            return Err(MemcacheError::broken_pipe("VA without length"));
        }
        if len > self.max_value_size {
            return Err(MemcacheError::broken_pipe(format!(
                "VA length {} exceeds maximum {}",
                len, self.max_value_size
            )));
        }
        Ok(Some(len))
    }

    #[inline]
    fn byte_at(&self, pos: usize) -> u8 {
        self.buf[pos & self.mask]
    }

    fn copy_range(&self, pos: usize, out: &mut [u8]) {
        let start = pos & self.mask;
        let first = out.len().min(self.capacity() - start);
        out[..first].copy_from_slice(&self.buf[start..start + first]);
        let rest = out.len() - first;
        out[first..].copy_from_slice(&self.buf[..rest]);
    }

    fn write_at(&mut self, pos: usize, data: &[u8]) {
        let start = pos & self.mask;
        let first = data.len().min(self.capacity() - start);
        self.buf[start..start + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        self.buf[..rest].copy_from_slice(&data[first..]);
    }

    fn grow(&mut self, needed: usize) {
        let capacity = needed.next_power_of_two();
        let mut live = vec![0u8; self.len()];
        self.copy_range(self.begin, &mut live);

        let scan_offset = self.scan - self.begin;
        self.buf = vec![0u8; capacity].into_boxed_slice();
        self.mask = capacity - 1;
        self.begin = 0;
        self.end = live.len();
        self.scan = scan_offset;
        self.buf[..live.len()].copy_from_slice(&live);
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_CAPACITY, DEFAULT_MAX_VALUE_SIZE)
    }
}

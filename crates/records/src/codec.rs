//! Compact binary primitives shared by every record type.
//!
//! ```text
//! uint     n < 0xfd -> [n]
//!          u16      -> [0xfd][u16 LE]
//!          u32      -> [0xfe][u32 LE]
//!          u64      -> [0xff][u64 LE]
//! buffer   [uint len][bytes]
//! string   buffer holding UTF-8
//! fixed32  32 raw bytes
//! flags    uint bitmask; bit i set => optional field i follows
//! ```
//!
//! Unlike the key encoding these values are never compared byte-wise, so the
//! integers are little-endian and sized for compactness only.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Read};

use crate::{RecordError, RecordResult};

const UINT16: u8 = 0xfd;
const UINT32: u8 = 0xfe;
const UINT64: u8 = 0xff;

/// Upper bound on a single length-prefixed field.
const MAX_FIELD_BYTES: u64 = 64 * 1024 * 1024;

/// Append-only output buffer for record encoding.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64),
        }
    }

    pub fn uint(&mut self, n: u64) {
        if n < UINT16 as u64 {
            self.buf.push(n as u8);
        } else if n <= u16::MAX as u64 {
            self.buf.push(UINT16);
            self.buf.extend_from_slice(&(n as u16).to_le_bytes());
        } else if n <= u32::MAX as u64 {
            self.buf.push(UINT32);
            self.buf.extend_from_slice(&(n as u32).to_le_bytes());
        } else {
            self.buf.push(UINT64);
            self.buf.extend_from_slice(&n.to_le_bytes());
        }
    }

    pub fn buffer(&mut self, bytes: &[u8]) {
        self.uint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn string(&mut self, s: &str) {
        self.buffer(s.as_bytes());
    }

    pub fn fixed32(&mut self, bytes: &[u8; 32]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes the presence bitmask for a run of optional fields.
    pub fn flags(&mut self, present: &[bool]) {
        let mask = present
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, &p)| if p { acc | (1 << i) } else { acc });
        self.uint(mask);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an encoded record.
#[derive(Debug)]
pub struct Decoder<'a> {
    rdr: &'a [u8],
}

fn eof(e: io::Error) -> RecordError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        RecordError::UnexpectedEnd
    } else {
        RecordError::Invalid("read failure")
    }
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { rdr: bytes }
    }

    /// Reads a compact uint. Only the shortest form of a value is accepted,
    /// so every decoded value re-encodes to the same bytes.
    pub fn uint(&mut self) -> RecordResult<u64> {
        let tag = self.rdr.read_u8().map_err(eof)?;
        let (n, floor) = match tag {
            UINT16 => (
                self.rdr.read_u16::<LittleEndian>().map_err(eof)? as u64,
                UINT16 as u64,
            ),
            UINT32 => (
                self.rdr.read_u32::<LittleEndian>().map_err(eof)? as u64,
                u16::MAX as u64 + 1,
            ),
            UINT64 => (
                self.rdr.read_u64::<LittleEndian>().map_err(eof)?,
                u32::MAX as u64 + 1,
            ),
            n => return Ok(n as u64),
        };
        if n < floor {
            return Err(RecordError::Invalid("non-minimal uint"));
        }
        Ok(n)
    }

    pub fn buffer(&mut self) -> RecordResult<Vec<u8>> {
        let len = self.uint()?;
        if len > MAX_FIELD_BYTES || len > self.rdr.len() as u64 {
            return Err(RecordError::UnexpectedEnd);
        }
        let mut out = vec![0u8; len as usize];
        self.rdr.read_exact(&mut out).map_err(eof)?;
        Ok(out)
    }

    pub fn string(&mut self) -> RecordResult<String> {
        String::from_utf8(self.buffer()?).map_err(|_| RecordError::Invalid("string is not utf-8"))
    }

    pub fn fixed32(&mut self) -> RecordResult<[u8; 32]> {
        let mut out = [0u8; 32];
        self.rdr.read_exact(&mut out).map_err(eof)?;
        Ok(out)
    }

    /// Reads a presence bitmask covering `count` optional fields.
    pub fn flags(&mut self, count: usize) -> RecordResult<Vec<bool>> {
        let mask = self.uint()?;
        if count < 64 && mask >> count != 0 {
            return Err(RecordError::Invalid("unknown flag bits"));
        }
        Ok((0..count).map(|i| mask & (1 << i) != 0).collect())
    }

    /// Fails unless every byte was consumed.
    pub fn finish(self) -> RecordResult<()> {
        if self.rdr.is_empty() {
            Ok(())
        } else {
            Err(RecordError::TrailingBytes(self.rdr.len()))
        }
    }
}

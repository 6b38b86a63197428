//! Order-preserving primitives used to build keys.
//!
//! ## Unsigned integers
//!
//! ```text
//! n <  0xfb          -> [n]
//! n <= u16::MAX      -> [0xfb][n: u16 BE]
//! n <= u32::MAX      -> [0xfc][n: u32 BE]
//! otherwise          -> [0xfd][n: u64 BE]
//! ```
//!
//! The tag byte grows with the magnitude band and the payload is big-endian,
//! so comparing encodings byte-by-byte gives the same answer as comparing
//! the numbers.
//!
//! ## Byte strings
//!
//! Every byte is copied verbatim except the four that would break ordering
//! or the sentinel:
//!
//! ```text
//! 0x00 -> 01 01      0x01 -> 01 02
//! 0xfe -> fe 01      0xff -> fe 02
//! ```
//!
//! The encoding is terminated by a single `0x00`, which sorts below every
//! escaped byte, so a string sorts before all of its extensions. Escaped
//! output never contains `0xff`; appending `0xff` to an unterminated prefix
//! therefore yields an exclusive upper bound for every string that starts
//! with that prefix.

use byteorder::{BigEndian, ByteOrder};

use crate::{KeyError, KeyResult};

const UINT16: u8 = 0xfb;
const UINT32: u8 = 0xfc;
const UINT64: u8 = 0xfd;

const TERMINATOR: u8 = 0x00;
const ESCAPE_LOW: u8 = 0x01;
const ESCAPE_HIGH: u8 = 0xfe;

/// High sentinel appended to unterminated prefixes to form an exclusive end.
pub const SENTINEL: u8 = 0xff;

/// Appends the order-preserving encoding of `n` to `buf`.
pub fn write_uint(buf: &mut Vec<u8>, n: u64) {
    if n < UINT16 as u64 {
        buf.push(n as u8);
    } else if n <= u16::MAX as u64 {
        buf.push(UINT16);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= u32::MAX as u64 {
        buf.push(UINT32);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(UINT64);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

/// Reads an integer written by [`write_uint`], returning the value and the
/// number of bytes consumed.
pub fn read_uint(buf: &[u8]) -> KeyResult<(u64, usize)> {
    let tag = *buf.first().ok_or(KeyError::Malformed("missing integer"))?;
    let width = match tag {
        UINT16 => 2,
        UINT32 => 4,
        UINT64 => 8,
        n if n < UINT16 => return Ok((n as u64, 1)),
        _ => return Err(KeyError::Malformed("invalid integer tag")),
    };
    let body = buf
        .get(1..1 + width)
        .ok_or(KeyError::Malformed("truncated integer"))?;
    let n = match width {
        2 => BigEndian::read_u16(body) as u64,
        4 => BigEndian::read_u32(body) as u64,
        _ => BigEndian::read_u64(body),
    };
    Ok((n, 1 + width))
}

/// Appends the escaped bytes of `bytes` without a terminator.
pub fn write_bytes_prefix(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        match b {
            0x00 => buf.extend_from_slice(&[ESCAPE_LOW, 0x01]),
            0x01 => buf.extend_from_slice(&[ESCAPE_LOW, 0x02]),
            0xfe => buf.extend_from_slice(&[ESCAPE_HIGH, 0x01]),
            0xff => buf.extend_from_slice(&[ESCAPE_HIGH, 0x02]),
            other => buf.push(other),
        }
    }
}

/// Appends the escaped, terminated encoding of `bytes`.
pub fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_bytes_prefix(buf, bytes);
    buf.push(TERMINATOR);
}

/// Reads a byte string written by [`write_bytes`], returning the raw bytes
/// and the number of encoded bytes consumed (terminator included).
pub fn read_bytes(buf: &[u8]) -> KeyResult<(Vec<u8>, usize)> {
    let mut out = Vec::with_capacity(buf.len());
    let mut i = 0;
    loop {
        let b = *buf
            .get(i)
            .ok_or(KeyError::Malformed("unterminated byte string"))?;
        i += 1;
        match b {
            TERMINATOR => return Ok((out, i)),
            ESCAPE_LOW | ESCAPE_HIGH => {
                let next = *buf
                    .get(i)
                    .ok_or(KeyError::Malformed("truncated escape"))?;
                i += 1;
                out.push(match (b, next) {
                    (ESCAPE_LOW, 0x01) => 0x00,
                    (ESCAPE_LOW, 0x02) => 0x01,
                    (ESCAPE_HIGH, 0x01) => 0xfe,
                    (ESCAPE_HIGH, 0x02) => 0xff,
                    _ => return Err(KeyError::Malformed("invalid escape")),
                });
            }
            SENTINEL => return Err(KeyError::Malformed("sentinel inside byte string")),
            other => out.push(other),
        }
    }
}

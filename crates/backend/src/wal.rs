//! # WAL - Write-Ahead Log
//!
//! Durability for [`MemoryBackend`](crate::MemoryBackend). Every
//! [`WriteBatch`] is serialized into one frame and appended **before** the
//! in-memory map changes, so replaying the log on open rebuilds exactly the
//! acknowledged writes. One frame per batch keeps batches atomic across a
//! crash: a torn frame is dropped whole.
//!
//! ## Frame format
//!
//! ```text
//! [record_len: u32 LE][crc32: u32 LE][body ...]
//! ```
//!
//! Body: `[seq: u64][op_count: u32][op ...]`, each op one of
//!
//! ```text
//! put          [0: u8][key_len: u32][key][val_len: u32][value]
//! delete       [1: u8][key_len: u32][key]
//! delete range [2: u8][start_len: u32][start][end_len: u32][end]
//! ```
//!
//! `record_len` covers the CRC and body, not itself.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use crate::{BackendError, BackendResult, BatchOp, WriteBatch};

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;
const OP_DELETE_RANGE: u8 = 2;

/// 64 MiB safety cap on a single frame.
const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// A replayed batch and the sequence number it was written with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub seq: u64,
    pub batch: WriteBatch,
}

/// Append-only log writer.
///
/// When `sync` is set every append is followed by `sync_all()`.
pub struct WalWriter {
    file: File,
    sync: bool,
    /// Reusable frame buffer.
    buf: Vec<u8>,
}

fn write_field(buf: &mut Vec<u8>, bytes: &[u8]) -> io::Result<()> {
    buf.write_u32::<LittleEndian>(bytes.len() as u32)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

impl WalWriter {
    /// Opens (or creates) the log in append mode.
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> BackendResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        Ok(Self {
            file,
            sync,
            buf: Vec::with_capacity(256),
        })
    }

    /// Serializes `batch` as one frame and appends it.
    pub fn append(&mut self, seq: u64, batch: &WriteBatch) -> BackendResult<()> {
        self.buf.clear();
        // header is patched in once the body is known
        self.buf.extend_from_slice(&[0u8; 8]);

        self.buf.write_u64::<LittleEndian>(seq)?;
        self.buf.write_u32::<LittleEndian>(batch.len() as u32)?;
        for op in batch.ops() {
            match op {
                BatchOp::Put { key, value } => {
                    self.buf.write_u8(OP_PUT)?;
                    write_field(&mut self.buf, key)?;
                    write_field(&mut self.buf, value)?;
                }
                BatchOp::Delete { key } => {
                    self.buf.write_u8(OP_DELETE)?;
                    write_field(&mut self.buf, key)?;
                }
                BatchOp::DeleteRange { start, end } => {
                    self.buf.write_u8(OP_DELETE_RANGE)?;
                    write_field(&mut self.buf, start)?;
                    write_field(&mut self.buf, end)?;
                }
            }
        }

        let body = &self.buf[8..];
        let mut hasher = Crc32::new();
        hasher.update(body);
        let crc = hasher.finalize();

        let record_len = (body.len() as u64) + 4;
        if record_len > MAX_RECORD_SIZE as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write batch too large for one log frame",
            )
            .into());
        }

        self.buf[0..4].copy_from_slice(&(record_len as u32).to_le_bytes());
        self.buf[4..8].copy_from_slice(&crc.to_le_bytes());

        self.file.write_all(&self.buf)?;
        self.file.flush()?;
        if self.sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Forces buffered frames to disk regardless of the `sync` setting.
    pub fn sync_to_disk(&mut self) -> BackendResult<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Sequential reader yielding every intact frame.
///
/// A truncated tail frame (crash mid-append) is a clean end of log; a
/// checksum mismatch is [`BackendError::Corrupt`].
pub struct WalReader<R: Read> {
    rdr: BufReader<R>,
}

impl WalReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> BackendResult<WalReader<File>> {
        let f = File::open(path)?;
        Ok(WalReader {
            rdr: BufReader::new(f),
        })
    }
}

fn read_field(br: &mut &[u8]) -> BackendResult<Vec<u8>> {
    let len = br.read_u32::<LittleEndian>()? as usize;
    if len > br.len() {
        return Err(BackendError::Corrupt);
    }
    let mut out = vec![0u8; len];
    br.read_exact(&mut out)?;
    Ok(out)
}

fn parse_body(mut br: &[u8]) -> BackendResult<WalRecord> {
    let seq = br.read_u64::<LittleEndian>()?;
    let count = br.read_u32::<LittleEndian>()?;
    let mut batch = WriteBatch::new();
    for _ in 0..count {
        match br.read_u8()? {
            OP_PUT => {
                let key = read_field(&mut br)?;
                let value = read_field(&mut br)?;
                batch.try_put(key, value);
            }
            OP_DELETE => batch.try_delete(read_field(&mut br)?),
            OP_DELETE_RANGE => {
                let start = read_field(&mut br)?;
                let end = read_field(&mut br)?;
                batch.try_delete_range(start, end);
            }
            _ => return Err(BackendError::Corrupt),
        }
    }
    if !br.is_empty() {
        return Err(BackendError::Corrupt);
    }
    Ok(WalRecord { seq, batch })
}

impl<R: Read> WalReader<R> {
    pub fn from_reader(reader: R) -> Self {
        WalReader {
            rdr: BufReader::new(reader),
        }
    }

    /// Calls `apply` for every intact frame in log order.
    pub fn replay<F>(&mut self, mut apply: F) -> BackendResult<()>
    where
        F: FnMut(WalRecord),
    {
        let mut body = Vec::with_capacity(256);

        loop {
            let record_len = match self.rdr.read_u32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if record_len <= 4 || record_len > MAX_RECORD_SIZE {
                return Err(BackendError::Corrupt);
            }

            let crc = match self.rdr.read_u32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            body.clear();
            body.resize((record_len - 4) as usize, 0);
            match self.rdr.read_exact(&mut body) {
                Ok(()) => {}
                // torn tail
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            let mut hasher = Crc32::new();
            hasher.update(&body);
            if hasher.finalize() != crc {
                return Err(BackendError::Corrupt);
            }

            // a frame that passed its checksum but does not parse is corrupt,
            // not torn
            let record = parse_body(&body).map_err(|e| match e {
                BackendError::Io(_) => BackendError::Corrupt,
                other => other,
            })?;
            apply(record);
        }
    }
}

//! Redo log for mini-transactions
//!
//! Each committed mini-transaction becomes one batch:
//!
//! ```text
//! [len u32][lsn u64][space_id u32][n_records u32][records...][crc32 u32]
//! ```
//!
//! `len` covers the whole batch and `lsn` is the log position just past the
//! batch, which is also the LSN stamped on every page the batch modified.
//! A batch whose length or checksum does not check out marks the torn tail of
//! the log; replay stops there.

use crate::error::Result;
use crate::page::{read_u16, read_u32, read_u64};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

const RECORD_INIT_PAGE: u8 = 1;
const RECORD_WRITE: u8 = 2;

const BATCH_HEADER_SIZE: usize = 4 + 8 + 4 + 4;
const BATCH_TRAILER_SIZE: usize = 4;

/// One logical page change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoRecord {
    /// Page was zeroed and stamped with its identity and type
    InitPage { page_no: u32, page_type: u16 },

    /// Bytes were written at `offset`
    Write {
        page_no: u32,
        offset: u16,
        bytes: Vec<u8>,
    },
}

impl RedoRecord {
    pub fn page_no(&self) -> u32 {
        match self {
            RedoRecord::InitPage { page_no, .. } | RedoRecord::Write { page_no, .. } => *page_no,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            RedoRecord::InitPage { page_no, page_type } => {
                out.push(RECORD_INIT_PAGE);
                out.extend_from_slice(&page_no.to_be_bytes());
                out.extend_from_slice(&page_type.to_be_bytes());
            }
            RedoRecord::Write {
                page_no,
                offset,
                bytes,
            } => {
                out.push(RECORD_WRITE);
                out.extend_from_slice(&page_no.to_be_bytes());
                out.extend_from_slice(&offset.to_be_bytes());
                out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                out.extend_from_slice(bytes);
            }
        }
    }

    fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        match *buf.first()? {
            RECORD_INIT_PAGE => {
                if buf.len() < 7 {
                    return None;
                }
                let record = RedoRecord::InitPage {
                    page_no: read_u32(buf, 1),
                    page_type: read_u16(buf, 5),
                };
                Some((record, 7))
            }
            RECORD_WRITE => {
                if buf.len() < 9 {
                    return None;
                }
                let len = read_u16(buf, 7) as usize;
                if buf.len() < 9 + len {
                    return None;
                }
                let record = RedoRecord::Write {
                    page_no: read_u32(buf, 1),
                    offset: read_u16(buf, 5),
                    bytes: buf[9..9 + len].to_vec(),
                };
                Some((record, 9 + len))
            }
            _ => None,
        }
    }
}

/// A decoded, checksum-verified batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoBatch {
    pub lsn: u64,
    pub space_id: u32,
    pub records: Vec<RedoRecord>,
}

struct RedoInner {
    /// Every batch appended so far
    buf: Vec<u8>,
    /// Bytes of `buf` already written to the sink
    flushed: usize,
    sink: Option<File>,
}

/// Append-only redo log shared by all mini-transactions of a tablespace
pub struct RedoLog {
    inner: Mutex<RedoInner>,
}

impl RedoLog {
    /// Log kept only in memory
    pub fn in_memory() -> Self {
        RedoLog {
            inner: Mutex::new(RedoInner {
                buf: Vec::new(),
                flushed: 0,
                sink: None,
            }),
        }
    }

    /// In-memory log seeded with the bytes of an earlier one (for replay)
    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        bytes.truncate(Self::valid_prefix_len(&bytes));
        RedoLog {
            inner: Mutex::new(RedoInner {
                flushed: bytes.len(),
                buf: bytes,
                sink: None,
            }),
        }
    }

    /// Log persisted to `path`, continuing after any batches already there
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        // Drop a torn tail so new batches follow the last complete one
        let valid = Self::valid_prefix_len(&buf);
        if valid < buf.len() {
            tracing::warn!(
                "Discarding {} bytes of torn redo log tail",
                buf.len() - valid
            );
            buf.truncate(valid);
            file.set_len(valid as u64)?;
        }

        Ok(RedoLog {
            inner: Mutex::new(RedoInner {
                flushed: buf.len(),
                buf,
                sink: Some(file),
            }),
        })
    }

    /// Append one mini-transaction's records; returns the batch LSN
    pub fn append(&self, space_id: u32, records: &[RedoRecord]) -> Result<u64> {
        let mut body = Vec::new();
        for record in records {
            record.encode(&mut body);
        }

        let mut inner = self.inner.lock();
        let total = BATCH_HEADER_SIZE + body.len() + BATCH_TRAILER_SIZE;
        let lsn = (inner.buf.len() + total) as u64;

        let mut batch = Vec::with_capacity(total);
        batch.extend_from_slice(&(total as u32).to_be_bytes());
        batch.extend_from_slice(&lsn.to_be_bytes());
        batch.extend_from_slice(&space_id.to_be_bytes());
        batch.extend_from_slice(&(records.len() as u32).to_be_bytes());
        batch.extend_from_slice(&body);
        let crc = crc32fast::hash(&batch);
        batch.extend_from_slice(&crc.to_be_bytes());

        inner.buf.extend_from_slice(&batch);
        Ok(lsn)
    }

    /// Log position after the newest batch
    pub fn current_lsn(&self) -> u64 {
        self.inner.lock().buf.len() as u64
    }

    /// Write everything up to at least `lsn` to the sink.
    ///
    /// Must happen before any page stamped with `lsn` reaches storage.
    pub fn flush_to(&self, lsn: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.flushed as u64 >= lsn {
            return Ok(());
        }

        let RedoInner { buf, flushed, sink } = &mut *inner;
        if let Some(file) = sink.as_mut() {
            file.write_all(&buf[*flushed..])?;
            file.sync_data()?;
        }
        *flushed = buf.len();
        Ok(())
    }

    /// Copy of the full log
    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().buf.clone()
    }

    fn valid_prefix_len(bytes: &[u8]) -> usize {
        let mut pos = 0;
        while let Some((_, len)) = Self::parse_batch(&bytes[pos..]) {
            pos += len;
        }
        pos
    }

    fn parse_batch(buf: &[u8]) -> Option<(RedoBatch, usize)> {
        if buf.len() < BATCH_HEADER_SIZE + BATCH_TRAILER_SIZE {
            return None;
        }

        let total = read_u32(buf, 0) as usize;
        if total < BATCH_HEADER_SIZE + BATCH_TRAILER_SIZE || total > buf.len() {
            return None;
        }

        let crc = read_u32(buf, total - BATCH_TRAILER_SIZE);
        if crc32fast::hash(&buf[..total - BATCH_TRAILER_SIZE]) != crc {
            return None;
        }

        let lsn = read_u64(buf, 4);
        let space_id = read_u32(buf, 12);
        let n_records = read_u32(buf, 16) as usize;

        let body = &buf[BATCH_HEADER_SIZE..total - BATCH_TRAILER_SIZE];
        let mut records = Vec::with_capacity(n_records);
        let mut pos = 0;
        for _ in 0..n_records {
            let (record, len) = RedoRecord::decode(&body[pos..])?;
            records.push(record);
            pos += len;
        }
        if pos != body.len() {
            return None;
        }

        Some((
            RedoBatch {
                lsn,
                space_id,
                records,
            },
            total,
        ))
    }

    /// Decode all complete batches, stopping at the first torn one
    pub fn parse(bytes: &[u8]) -> Vec<RedoBatch> {
        let mut batches = Vec::new();
        let mut pos = 0;
        while let Some((batch, len)) = Self::parse_batch(&bytes[pos..]) {
            batches.push(batch);
            pos += len;
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records() -> Vec<RedoRecord> {
        vec![
            RedoRecord::InitPage {
                page_no: 5,
                page_type: 3,
            },
            RedoRecord::Write {
                page_no: 5,
                offset: 38,
                bytes: vec![1, 2, 3, 4],
            },
        ]
    }

    #[test]
    fn test_append_assigns_increasing_lsn() {
        let log = RedoLog::in_memory();
        let lsn1 = log.append(1, &sample_records()).unwrap();
        let lsn2 = log.append(1, &sample_records()).unwrap();

        assert!(lsn2 > lsn1);
        assert_eq!(log.current_lsn(), lsn2);
    }

    #[test]
    fn test_parse_batches() {
        let log = RedoLog::in_memory();
        let lsn = log.append(9, &sample_records()).unwrap();

        let batches = RedoLog::parse(&log.contents());
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].lsn, lsn);
        assert_eq!(batches[0].space_id, 9);
        assert_eq!(batches[0].records, sample_records());
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let log = RedoLog::in_memory();
        log.append(1, &sample_records()).unwrap();
        log.append(1, &sample_records()).unwrap();

        let mut bytes = log.contents();
        bytes.truncate(bytes.len() - 3);
        assert_eq!(RedoLog::parse(&bytes).len(), 1);

        // A flipped bit in the last batch is caught by the crc
        let mut bytes = log.contents();
        let last = bytes.len() - 6;
        bytes[last] ^= 0x01;
        assert_eq!(RedoLog::parse(&bytes).len(), 1);
    }

    #[test]
    fn test_file_log_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redo.log");

        let lsn = {
            let log = RedoLog::open(&path).unwrap();
            let lsn = log.append(1, &sample_records()).unwrap();
            log.flush_to(lsn).unwrap();
            lsn
        };

        let log = RedoLog::open(&path).unwrap();
        assert_eq!(log.current_lsn(), lsn);
        assert_eq!(RedoLog::parse(&log.contents()).len(), 1);
    }
}

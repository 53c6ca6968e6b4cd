//! Transaction-log reader
//!
//! Decodes the store's binary transaction-log files without relying on the
//! store's own tooling. A record is little-endian:
//!
//! ```text
//! +----------------+----------+----------------+----------+-------------+
//! | i64 sequence   | u32 crc  | u32 length L   | u32 kind | payload     |
//! | number         | (opaque) | (kind+payload) |          | (L-4 bytes) |
//! +----------------+----------+----------------+----------+-------------+
//! ```
//!
//! Sequence numbers within one file are strictly increasing, and the first
//! sequence number of the n-th rolled-over file equals
//! `n * entries_per_file`.
//!
//! Truncation policy: headers are only parsed while at least
//! [`HEADER_LEN`] bytes remain, so a trailing fragment shorter than a
//! header is ignored (and a file shorter than one record yields no
//! entries). A parsed header whose declared region overruns the buffer, or
//! declares fewer than 4 bytes, is a [`TlogError::TruncatedLog`].

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Fixed bytes before an entry's kind+payload region.
pub const HEADER_LEN: usize = 16;

/// Entry type code written when a node takes the master role.
pub const ENTRY_KIND_MASTER_SET: u32 = 4;

/// Extensions a tlog file moves through over its lifecycle: active,
/// compacted, frozen, snapshot.
pub const TLOG_EXTENSIONS: [&str; 4] = ["tlog", "tlc", "tlf", "tls"];

#[derive(Debug, Error)]
pub enum TlogError {
    #[error("no transaction log files in {0}")]
    NoLogFiles(PathBuf),
    #[error("truncated log entry at offset {offset}")]
    TruncatedLog { offset: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One decoded log entry. Payload borrows from the scanned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry<'a> {
    /// Sequence number.
    pub i: i64,
    /// Checksum as stored; this reader does not validate it.
    pub checksum: u32,
    /// Entry type code.
    pub kind: u32,
    pub payload: &'a [u8],
}

/// Lazy scanner over one tlog file's bytes.
///
/// Not restartable: retrying after an error means scanning again from
/// offset 0. After yielding an error the scanner is exhausted.
pub struct TlogScanner<'a> {
    data: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> TlogScanner<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        TlogScanner {
            data,
            offset: 0,
            done: false,
        }
    }
}

impl<'a> Iterator for TlogScanner<'a> {
    type Item = Result<LogEntry<'a>, TlogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let remaining = self.data.len() - self.offset;
        if remaining < HEADER_LEN {
            // Trailing fragment smaller than a header: tolerated.
            self.done = true;
            return None;
        }
        let at = self.offset;
        let i = i64::from_le_bytes(self.data[at..at + 8].try_into().unwrap());
        let checksum = u32::from_le_bytes(self.data[at + 8..at + 12].try_into().unwrap());
        let region_len = u32::from_le_bytes(self.data[at + 12..at + 16].try_into().unwrap()) as usize;

        let region_start = at + HEADER_LEN;
        if region_len < 4 || region_start + region_len > self.data.len() {
            self.done = true;
            return Some(Err(TlogError::TruncatedLog { offset: at }));
        }
        let kind = u32::from_le_bytes(
            self.data[region_start..region_start + 4]
                .try_into()
                .unwrap(),
        );
        let payload = &self.data[region_start + 4..region_start + region_len];
        self.offset = region_start + region_len;
        Some(Ok(LogEntry {
            i,
            checksum,
            kind,
            payload,
        }))
    }
}

/// Sequence number of the last complete entry, or `None` for a file with
/// no complete entry.
pub fn last_sequence_number(data: &[u8]) -> Result<Option<i64>, TlogError> {
    let mut last = None;
    for entry in TlogScanner::new(data) {
        last = Some(entry?.i);
    }
    Ok(last)
}

/// Type code of the last complete entry.
pub fn last_entry_kind(data: &[u8]) -> Result<Option<u32>, TlogError> {
    let mut last = None;
    for entry in TlogScanner::new(data) {
        last = Some(entry?.kind);
    }
    Ok(last)
}

/// Sequence number of the first entry.
pub fn first_sequence_number(data: &[u8]) -> Result<Option<i64>, TlogError> {
    match TlogScanner::new(data).next() {
        Some(entry) => Ok(Some(entry?.i)),
        None => Ok(None),
    }
}

/// Whether `first_i` is a valid opening sequence number for rollover
/// segment `segment` with the given entries-per-file constant.
pub fn rollover_start_ok(first_i: i64, segment: u64, entries_per_file: u64) -> bool {
    first_i == (segment * entries_per_file) as i64
}

/// File name of rollover segment `index`, e.g. `003.tlog`.
pub fn tlog_file_name(index: u64) -> String {
    format!("{index:03}.tlog")
}

/// The active tlog with the maximal filename-derived index in `dir`.
pub fn last_tlog_in(dir: &Path) -> Result<(u64, PathBuf), TlogError> {
    let mut best: Option<(u64, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("tlog") {
            continue;
        }
        let Some(index) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        else {
            continue;
        };
        if best.as_ref().map_or(true, |(max, _)| index > *max) {
            best = Some((index, path));
        }
    }
    best.ok_or_else(|| TlogError::NoLogFiles(dir.to_path_buf()))
}

/// Count tlog files in `dir` across every lifecycle extension.
pub fn tlog_census(dir: &Path) -> Result<usize, TlogError> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if TLOG_EXTENSIONS.contains(&ext) {
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Append one encoded entry to `buf`. The harness only decodes real tlogs;
/// encoding exists to build fixtures for tests and fault drills.
pub fn encode_entry(buf: &mut Vec<u8>, i: i64, checksum: u32, kind: u32, payload: &[u8]) {
    buf.extend_from_slice(&i.to_le_bytes());
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf.extend_from_slice(&((payload.len() + 4) as u32).to_le_bytes());
    buf.extend_from_slice(&kind.to_le_bytes());
    buf.extend_from_slice(payload);
}

//! Write-ahead log records: length-prefixed, crc32c-checksummed.
//!
//! On-disk frame, all integers little-endian:
//! ```text
//! ┌─────────┬─────────┬──────────────────────────────────────────┐
//! │ len u32 │ crc u32 │ body (len bytes, crc32c over body)       │
//! └─────────┴─────────┴──────────────────────────────────────────┘
//! body = rev u64 | author_id [16] | op_id [16] | ts_ms u64
//!      | op_kind u8 | payload
//! payload(insert) = pos u32 | utf8 text
//! payload(delete) = pos u32 | len u32
//! ```
//!
//! Records are written post-transform, so recovery replays them with a
//! plain buffer apply and never touches the OT engine. A scan stops at
//! the first bad record (short frame, bad crc, non-contiguous rev) and
//! reports the last good byte offset so the caller can truncate
//! trailing garbage from a torn write.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32c::crc32c;
use uuid::Uuid;

use crate::document::AppliedOp;
use crate::protocol::Op;

const FRAME_HEADER_LEN: usize = 8;
const BODY_FIXED_LEN: usize = 8 + 16 + 16 + 8 + 1;
const OP_KIND_INSERT: u8 = 1;
const OP_KIND_DELETE: u8 = 2;

/// Upper bound on a single record body; anything larger is corruption.
pub const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// WAL errors.
#[derive(Debug)]
pub enum WalError {
    Io(std::io::Error),
    RecordTooLarge { got: usize },
    Corrupt { offset: u64, reason: String },
}

impl std::fmt::Display for WalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "wal io error: {e}"),
            Self::RecordTooLarge { got } => {
                write!(f, "wal record too large: {got} bytes")
            }
            Self::Corrupt { offset, reason } => {
                write!(f, "wal corrupt at byte {offset}: {reason}")
            }
        }
    }
}

impl std::error::Error for WalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WalError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

fn encode_body(applied: &AppliedOp) -> Vec<u8> {
    let payload_len = match &applied.op {
        Op::Insert { text, .. } => 4 + text.len(),
        Op::Delete { .. } => 8,
    };
    let mut body = Vec::with_capacity(BODY_FIXED_LEN + payload_len);
    body.extend_from_slice(&applied.rev.to_le_bytes());
    body.extend_from_slice(applied.author_id.as_bytes());
    body.extend_from_slice(applied.op_id.as_bytes());
    body.extend_from_slice(&applied.ts_ms.to_le_bytes());
    match &applied.op {
        Op::Insert { pos, text } => {
            body.push(OP_KIND_INSERT);
            body.extend_from_slice(&pos.to_le_bytes());
            body.extend_from_slice(text.as_bytes());
        }
        Op::Delete { pos, len } => {
            body.push(OP_KIND_DELETE);
            body.extend_from_slice(&pos.to_le_bytes());
            body.extend_from_slice(&len.to_le_bytes());
        }
    }
    body
}

fn decode_body(body: &[u8], offset: u64) -> Result<AppliedOp, WalError> {
    let corrupt = |reason: &str| WalError::Corrupt {
        offset,
        reason: reason.to_string(),
    };
    if body.len() < BODY_FIXED_LEN {
        return Err(corrupt("body shorter than fixed header"));
    }
    let rev = u64::from_le_bytes(body[0..8].try_into().unwrap_or_default());
    let author_id = Uuid::from_slice(&body[8..24]).map_err(|_| corrupt("bad author id"))?;
    let op_id = Uuid::from_slice(&body[24..40]).map_err(|_| corrupt("bad op id"))?;
    let ts_ms = u64::from_le_bytes(body[40..48].try_into().unwrap_or_default());
    let kind = body[48];
    let payload = &body[BODY_FIXED_LEN..];

    let op = match kind {
        OP_KIND_INSERT => {
            if payload.len() < 4 {
                return Err(corrupt("insert payload too short"));
            }
            let pos = u32::from_le_bytes(payload[0..4].try_into().unwrap_or_default());
            let text = std::str::from_utf8(&payload[4..])
                .map_err(|_| corrupt("insert text not utf-8"))?
                .to_string();
            Op::Insert { pos, text }
        }
        OP_KIND_DELETE => {
            if payload.len() != 8 {
                return Err(corrupt("delete payload wrong size"));
            }
            let pos = u32::from_le_bytes(payload[0..4].try_into().unwrap_or_default());
            let len = u32::from_le_bytes(payload[4..8].try_into().unwrap_or_default());
            Op::Delete { pos, len }
        }
        other => {
            return Err(corrupt(&format!("unknown op kind {other}")));
        }
    };

    Ok(AppliedOp {
        rev,
        op,
        author_id,
        op_id,
        ts_ms,
    })
}

/// Append-only writer over `wal.v1`.
#[derive(Debug)]
pub struct WalWriter {
    file: File,
    path: PathBuf,
    bytes: u64,
}

impl WalWriter {
    /// Open (creating if absent) in append mode.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, WalError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let bytes = file.metadata()?.len();
        Ok(Self { file, path, bytes })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current on-disk size in bytes.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Append one record. Not durable until [`WalWriter::sync`].
    pub fn append(&mut self, applied: &AppliedOp) -> Result<(), WalError> {
        let body = encode_body(applied);
        if body.len() > MAX_RECORD_BYTES {
            return Err(WalError::RecordTooLarge { got: body.len() });
        }
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32c(&body).to_le_bytes());
        frame.extend_from_slice(&body);
        self.file.write_all(&frame)?;
        self.bytes += frame.len() as u64;
        Ok(())
    }

    /// fsync. Called once per apply batch, before the ack goes out.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Drop every record (after a snapshot made them redundant).
    pub fn reset(&mut self) -> Result<(), WalError> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_data()?;
        self.bytes = 0;
        Ok(())
    }
}

/// Result of scanning a WAL file.
#[derive(Debug)]
pub struct WalScan {
    /// Records with verified checksums and contiguous revs.
    pub records: Vec<AppliedOp>,
    /// Byte offset of the end of the last good record.
    pub valid_bytes: u64,
    /// Whether trailing garbage was found (and should be truncated).
    pub truncated: bool,
}

/// Scan `path`, accepting records while crc verifies and revs continue
/// from `after_rev` (+1 each). Stops at the first bad record.
pub fn scan(path: &Path, after_rev: u64) -> Result<WalScan, WalError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(WalScan {
                records: Vec::new(),
                valid_bytes: 0,
                truncated: false,
            });
        }
        Err(e) => return Err(e.into()),
    };
    let total = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut records = Vec::new();
    let mut offset = 0u64;
    let mut last_rev = after_rev;

    loop {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match read_exact_or_eof(&mut reader, &mut header) {
            ReadOutcome::Eof => break,
            ReadOutcome::Partial | ReadOutcome::Err => {
                return Ok(WalScan {
                    records,
                    valid_bytes: offset,
                    truncated: true,
                });
            }
            ReadOutcome::Full => {}
        }

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len == 0 || len > MAX_RECORD_BYTES {
            return Ok(WalScan {
                records,
                valid_bytes: offset,
                truncated: true,
            });
        }

        let mut body = vec![0u8; len];
        match read_exact_or_eof(&mut reader, &mut body) {
            ReadOutcome::Full => {}
            _ => {
                return Ok(WalScan {
                    records,
                    valid_bytes: offset,
                    truncated: true,
                });
            }
        }

        if crc32c(&body) != expected_crc {
            return Ok(WalScan {
                records,
                valid_bytes: offset,
                truncated: true,
            });
        }

        let applied = match decode_body(&body, offset) {
            Ok(a) => a,
            Err(_) => {
                return Ok(WalScan {
                    records,
                    valid_bytes: offset,
                    truncated: true,
                });
            }
        };

        if applied.rev != last_rev + 1 {
            return Ok(WalScan {
                records,
                valid_bytes: offset,
                truncated: true,
            });
        }

        last_rev = applied.rev;
        offset += (FRAME_HEADER_LEN + len) as u64;
        records.push(applied);
    }

    Ok(WalScan {
        records,
        valid_bytes: offset,
        truncated: offset < total,
    })
}

/// Cut trailing garbage found by [`scan`].
pub fn truncate_to(path: &Path, valid_bytes: u64) -> Result<(), WalError> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(valid_bytes)?;
    file.sync_data()?;
    Ok(())
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
    Err,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> ReadOutcome {
    let mut read = 0usize;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => {
                return if read == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                };
            }
            Ok(n) => read += n,
            Err(_) => return ReadOutcome::Err,
        }
    }
    ReadOutcome::Full
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn applied(rev: u64, op: Op) -> AppliedOp {
        AppliedOp {
            rev,
            op,
            author_id: uuid(1),
            op_id: uuid(2),
            ts_ms: 1000 + rev,
        }
    }

    fn ins(pos: u32, text: &str) -> Op {
        Op::Insert {
            pos,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_body_roundtrip() {
        let records = [
            applied(1, ins(0, "hello")),
            applied(2, Op::Delete { pos: 3, len: 9 }),
            applied(3, ins(7, "日本語")),
        ];
        for record in &records {
            let body = encode_body(record);
            let decoded = decode_body(&body, 0).unwrap();
            assert_eq!(&decoded, record);
        }
    }

    #[test]
    fn test_append_scan_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.v1");

        let mut writer = WalWriter::open(&path).unwrap();
        for rev in 1..=5 {
            writer.append(&applied(rev, ins(0, "x"))).unwrap();
        }
        writer.sync().unwrap();

        let result = scan(&path, 0).unwrap();
        assert_eq!(result.records.len(), 5);
        assert!(!result.truncated);
        assert_eq!(result.valid_bytes, writer.bytes());
        for (i, record) in result.records.iter().enumerate() {
            assert_eq!(record.rev, i as u64 + 1);
        }
    }

    #[test]
    fn test_scan_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let result = scan(&dir.path().join("nope.v1"), 0).unwrap();
        assert!(result.records.is_empty());
        assert!(!result.truncated);
    }

    #[test]
    fn test_scan_stops_at_torn_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.v1");

        let mut writer = WalWriter::open(&path).unwrap();
        writer.append(&applied(1, ins(0, "good"))).unwrap();
        writer.append(&applied(2, ins(4, "also"))).unwrap();
        writer.sync().unwrap();
        let good_bytes = writer.bytes();

        // Simulate a crash mid-write: half a frame of garbage.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xDE, 0xAD, 0xBE]).unwrap();
        }

        let result = scan(&path, 0).unwrap();
        assert_eq!(result.records.len(), 2);
        assert!(result.truncated);
        assert_eq!(result.valid_bytes, good_bytes);

        truncate_to(&path, result.valid_bytes).unwrap();
        let rescanned = scan(&path, 0).unwrap();
        assert_eq!(rescanned.records.len(), 2);
        assert!(!rescanned.truncated);
    }

    #[test]
    fn test_scan_rejects_corrupted_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.v1");

        let mut writer = WalWriter::open(&path).unwrap();
        writer.append(&applied(1, ins(0, "aaaa"))).unwrap();
        writer.append(&applied(2, ins(0, "bbbb"))).unwrap();
        writer.sync().unwrap();

        // Flip a byte inside the second record's body.
        {
            let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let len = f.metadata().unwrap().len();
            f.seek(SeekFrom::Start(len - 2)).unwrap();
            f.write_all(&[0xFF]).unwrap();
        }

        let result = scan(&path, 0).unwrap();
        assert_eq!(result.records.len(), 1);
        assert!(result.truncated);
    }

    #[test]
    fn test_scan_rejects_rev_gap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.v1");

        let mut writer = WalWriter::open(&path).unwrap();
        writer.append(&applied(1, ins(0, "a"))).unwrap();
        writer.append(&applied(5, ins(0, "b"))).unwrap();
        writer.sync().unwrap();

        let result = scan(&path, 0).unwrap();
        assert_eq!(result.records.len(), 1);
        assert!(result.truncated);
    }

    #[test]
    fn test_scan_respects_snapshot_base_rev() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.v1");

        let mut writer = WalWriter::open(&path).unwrap();
        writer.append(&applied(11, ins(0, "x"))).unwrap();
        writer.append(&applied(12, ins(1, "y"))).unwrap();
        writer.sync().unwrap();

        let result = scan(&path, 10).unwrap();
        assert_eq!(result.records.len(), 2);
        // From an older snapshot these records do not continue rev 0.
        let stale = scan(&path, 0).unwrap();
        assert!(stale.records.is_empty());
        assert!(stale.truncated);
    }

    #[test]
    fn test_reset_empties_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.v1");

        let mut writer = WalWriter::open(&path).unwrap();
        writer.append(&applied(1, ins(0, "x"))).unwrap();
        writer.sync().unwrap();
        assert!(writer.bytes() > 0);

        writer.reset().unwrap();
        assert_eq!(writer.bytes(), 0);
        let result = scan(&path, 0).unwrap();
        assert!(result.records.is_empty());
    }
}

//! Durable per-document storage under the vault directory.
//!
//! Layout, one directory per slug:
//! ```text
//! <vault>/<slug-as-path>/
//!   snapshot.v1   magic | rev u64 | full utf-8 text
//!   wal.v1        applied-op records (see `wal`)
//!   meta.v1       JSON { password_hash, created_ms }
//! ```
//!
//! Recovery loads the snapshot if present, then replays WAL records in
//! order (checksum + contiguous rev verified); the first bad record
//! stops the scan and trailing garbage is truncated. Records are
//! post-transform, so replay is a plain buffer apply.
//!
//! Snapshots are written to a temp file, fsynced, then renamed over
//! `snapshot.v1`; readers never observe a torn snapshot. After a
//! successful snapshot the WAL is reset.

pub mod wal;

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::document::AppliedOp;
use crate::text::TextBuffer;
use wal::{WalError, WalWriter};

const SNAPSHOT_MAGIC: &[u8; 8] = b"INKSNAP1";

/// Slug limits: bytes per segment and bytes total.
pub const MAX_SEGMENT_BYTES: usize = 255;
pub const MAX_SLUG_BYTES: usize = 1024;

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for all documents.
    pub vault_dir: PathBuf,
    /// Compact once the WAL grows past this many bytes.
    pub max_wal_bytes: u64,
    /// Compact once this many revs accumulate past the snapshot.
    pub max_wal_ops: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            vault_dir: PathBuf::from("/vault"),
            max_wal_bytes: 8 * 1024 * 1024,
            max_wal_ops: 10_000,
        }
    }
}

/// Storage errors.
#[derive(Debug)]
pub enum StoreError {
    /// Slug failed validation (shape or length).
    InvalidSlug(String),
    Io(std::io::Error),
    Wal(WalError),
    /// Snapshot unreadable and the WAL cannot reconstruct the doc.
    Poisoned(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSlug(s) => write!(f, "invalid slug: {s}"),
            Self::Io(e) => write!(f, "storage io error: {e}"),
            Self::Wal(e) => write!(f, "storage wal error: {e}"),
            Self::Poisoned(s) => write!(f, "document poisoned: {s}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Wal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WalError> for StoreError {
    fn from(e: WalError) -> Self {
        Self::Wal(e)
    }
}

/// Persistent metadata (`meta.v1`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    pub created_ms: u64,
}

/// State reconstructed from disk at open.
#[derive(Debug)]
pub struct RecoveredDoc {
    pub text: String,
    pub rev: u64,
    pub password_hash: Option<String>,
    pub created_ms: u64,
    /// Replayed WAL tail, oldest first, for seeding the op log.
    pub tail: Vec<AppliedOp>,
}

/// Validate a slug and map it to a relative path.
///
/// Accepts `/`-separated non-empty segments; rejects traversal,
/// absolute components, oversized segments, and oversized totals.
pub fn slug_to_rel_path(slug: &str) -> Result<PathBuf, StoreError> {
    let trimmed = slug.trim_matches('/');
    if trimmed.is_empty() {
        return Err(StoreError::InvalidSlug("empty".to_string()));
    }
    if trimmed.len() > MAX_SLUG_BYTES {
        return Err(StoreError::InvalidSlug(format!(
            "longer than {MAX_SLUG_BYTES} bytes"
        )));
    }
    let mut rel = PathBuf::new();
    for comp in Path::new(trimmed).components() {
        match comp {
            Component::Normal(part) => {
                if part.as_encoded_bytes().len() > MAX_SEGMENT_BYTES {
                    return Err(StoreError::InvalidSlug(format!(
                        "segment longer than {MAX_SEGMENT_BYTES} bytes"
                    )));
                }
                rel.push(part);
            }
            _ => {
                return Err(StoreError::InvalidSlug(
                    "path traversal segment".to_string(),
                ));
            }
        }
    }
    Ok(rel)
}

/// Handle to one document's on-disk files. Owned exclusively by the
/// document actor; no file descriptor is shared across documents.
#[derive(Debug)]
pub struct DocumentStore {
    dir: PathBuf,
    wal: WalWriter,
    config: StoreConfig,
    /// Rev covered by `snapshot.v1`.
    snapshot_rev: u64,
}

impl DocumentStore {
    /// Open (creating as needed) the files for `slug` and recover the
    /// document state they describe.
    pub fn open(config: StoreConfig, slug: &str) -> Result<(Self, RecoveredDoc), StoreError> {
        let rel = slug_to_rel_path(slug)?;
        let dir = config.vault_dir.join(rel);
        fs::create_dir_all(&dir)?;

        let meta = load_or_init_meta(&dir)?;

        let snapshot_path = dir.join("snapshot.v1");
        let (mut text, snapshot_rev) = match fs::read(&snapshot_path) {
            Ok(bytes) => parse_snapshot(&bytes)
                .map_err(|reason| StoreError::Poisoned(format!("snapshot.v1: {reason}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (TextBuffer::new(), 0),
            Err(e) => return Err(e.into()),
        };

        let wal_path = dir.join("wal.v1");
        let scanned = wal::scan(&wal_path, snapshot_rev)?;
        if scanned.truncated {
            warn!(
                "truncating wal tail for {:?} at byte {}",
                dir, scanned.valid_bytes
            );
            wal::truncate_to(&wal_path, scanned.valid_bytes)?;
        }

        let mut rev = snapshot_rev;
        for applied in &scanned.records {
            text.apply(&applied.op);
            rev = applied.rev;
        }
        if !scanned.records.is_empty() {
            info!("replayed {} wal records for {:?}", scanned.records.len(), dir);
        }

        let wal = WalWriter::open(&wal_path)?;
        let store = Self {
            dir,
            wal,
            config,
            snapshot_rev,
        };
        let recovered = RecoveredDoc {
            text: text.into_string(),
            rev,
            password_hash: meta.password_hash,
            created_ms: meta.created_ms,
            tail: scanned.records,
        };
        Ok((store, recovered))
    }

    /// Append the ops of one applied edit and make them durable.
    /// One fsync per batch; the ack must not be sent before this
    /// returns.
    pub fn append_batch(&mut self, batch: &[AppliedOp]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        for applied in batch {
            self.wal.append(applied)?;
        }
        self.wal.sync()?;
        Ok(())
    }

    /// Whether the compaction thresholds are exceeded.
    pub fn needs_compaction(&self, rev: u64) -> bool {
        self.wal.bytes() > self.config.max_wal_bytes
            || rev.saturating_sub(self.snapshot_rev) > self.config.max_wal_ops
    }

    /// Write a fresh snapshot (temp + fsync + rename) and reset the
    /// WAL. Callers decide when: threshold crossings, idle flushes,
    /// shutdown.
    pub fn write_snapshot(&mut self, rev: u64, text: &str) -> Result<(), StoreError> {
        let tmp = self.dir.join("snapshot.v1.tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(SNAPSHOT_MAGIC)?;
            f.write_all(&rev.to_le_bytes())?;
            f.write_all(text.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join("snapshot.v1"))?;
        self.snapshot_rev = rev;
        self.wal.reset()?;
        Ok(())
    }

    /// Compact when thresholds say so. Returns whether it ran.
    pub fn maybe_compact(&mut self, rev: u64, text: &str) -> Result<bool, StoreError> {
        if !self.needs_compaction(rev) {
            return Ok(false);
        }
        self.write_snapshot(rev, text)?;
        info!("compacted {:?} at rev {rev}", self.dir);
        Ok(true)
    }

    /// Persist a password change into `meta.v1`.
    pub fn set_password_hash(
        &mut self,
        hash: Option<&str>,
        created_ms: u64,
    ) -> Result<(), StoreError> {
        let meta = DocMeta {
            password_hash: hash.map(str::to_string),
            created_ms,
        };
        write_meta(&self.dir, &meta)
    }

    /// Probe after a write failure: reopen the WAL file descriptor.
    /// Success clears the degraded state at the caller.
    pub fn probe(&mut self) -> Result<(), StoreError> {
        self.wal = WalWriter::open(self.dir.join("wal.v1"))?;
        Ok(())
    }

    pub fn snapshot_rev(&self) -> u64 {
        self.snapshot_rev
    }

    pub fn wal_bytes(&self) -> u64 {
        self.wal.bytes()
    }
}

fn parse_snapshot(bytes: &[u8]) -> Result<(TextBuffer, u64), String> {
    if bytes.len() < SNAPSHOT_MAGIC.len() + 8 {
        return Err("too short".to_string());
    }
    if &bytes[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
        return Err("bad magic".to_string());
    }
    let rev_start = SNAPSHOT_MAGIC.len();
    let rev = u64::from_le_bytes(
        bytes[rev_start..rev_start + 8]
            .try_into()
            .map_err(|_| "bad rev".to_string())?,
    );
    let text = std::str::from_utf8(&bytes[rev_start + 8..])
        .map_err(|_| "text not utf-8".to_string())?;
    Ok((TextBuffer::from_text(text), rev))
}

fn load_or_init_meta(dir: &Path) -> Result<DocMeta, StoreError> {
    let path = dir.join("meta.v1");
    match fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str(&raw)
            .map_err(|e| StoreError::Poisoned(format!("meta.v1: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let meta = DocMeta {
                password_hash: None,
                created_ms: now_millis(),
            };
            write_meta(dir, &meta)?;
            Ok(meta)
        }
        Err(e) => Err(e.into()),
    }
}

fn write_meta(dir: &Path, meta: &DocMeta) -> Result<(), StoreError> {
    let raw = serde_json::to_string(meta)
        .map_err(|e| StoreError::Poisoned(format!("meta encode: {e}")))?;
    fs::write(dir.join("meta.v1"), raw)?;
    Ok(())
}

/// Wall-clock milliseconds since the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

//! Per-slug authoritative document state.
//!
//! One [`Document`] is the single writer for a slug: it owns the text,
//! the revision counter, the op-log tail used for transforms, the
//! password hash, and the duplicate-suppression window. All mutation
//! happens inside the owning actor's mailbox (see `hub`), which gives
//! the per-document total order the protocol relies on.
//!
//! Apply pipeline for one edit:
//! ```text
//! EditRequest ──► window check ──► dedup check ──► transform through
//! op_log tail ──► clamped apply per op (rev += 1 each) ──► AppliedOp
//! records for the WAL ──► Accepted { rev, ops }
//! ```

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::auth;
use crate::ot;
use crate::protocol::{EditRequest, Op};
use crate::text::TextBuffer;

/// Number of distinct `(author, op_id)` pairs remembered for duplicate
/// suppression.
pub const DEDUP_CAP: usize = 4096;

/// An operation committed to the document, as kept in the op log and
/// written to the WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOp {
    pub rev: u64,
    pub op: Op,
    pub author_id: Uuid,
    pub op_id: Uuid,
    pub ts_ms: u64,
}

/// Lifecycle of a loaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocStatus {
    /// Serving reads and writes.
    Ready,
    /// Storage failed; edits rejected until a retry succeeds.
    Degraded,
    /// Unrecoverable (or last subscriber gone and flushed).
    Closed,
}

/// Why an edit was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    BaseTooOld,
    Malformed,
    Unauthorised,
    StorageUnavailable,
}

/// Outcome of [`Document::apply_edit`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
    Accepted {
        /// Revision after the whole edit.
        rev: u64,
        op_id: Uuid,
        /// Transformed ops, in application order.
        ops: Vec<Op>,
        /// Log entries appended by this call. Empty on a duplicate;
        /// the caller must not re-persist a replayed ack.
        appended: Vec<AppliedOp>,
    },
    Rejected(RejectReason),
}

/// Bounded, insertion-ordered memory of recently applied edit ids with
/// their accepted results, so a resend after reconnect replays the ack
/// instead of double-applying.
#[derive(Debug, Default)]
struct DedupWindow {
    cached: HashMap<(Uuid, Uuid), (u64, Vec<Op>)>,
    order: VecDeque<(Uuid, Uuid)>,
}

impl DedupWindow {
    fn get(&self, author: Uuid, op_id: Uuid) -> Option<&(u64, Vec<Op>)> {
        self.cached.get(&(author, op_id))
    }

    fn insert(&mut self, author: Uuid, op_id: Uuid, rev: u64, ops: Vec<Op>) {
        let key = (author, op_id);
        if self.cached.insert(key, (rev, ops)).is_none() {
            self.order.push_back(key);
            while self.order.len() > DEDUP_CAP {
                match self.order.pop_front() {
                    Some(old) => {
                        self.cached.remove(&old);
                    }
                    None => break,
                }
            }
        }
    }
}

/// The authoritative per-slug state machine.
#[derive(Debug)]
pub struct Document {
    text: TextBuffer,
    rev: u64,
    op_log: VecDeque<AppliedOp>,
    /// Transform window W: max `rev - base_rev` accepted.
    window: u64,
    password_hash: Option<String>,
    dedup: DedupWindow,
    status: DocStatus,
}

impl Document {
    pub fn new(window: u64) -> Self {
        Self {
            text: TextBuffer::new(),
            rev: 0,
            op_log: VecDeque::new(),
            window,
            password_hash: None,
            dedup: DedupWindow::default(),
            status: DocStatus::Ready,
        }
    }

    /// Rebuild from recovered durable state. `tail` must be the most
    /// recent applied ops in rev order (already post-transform).
    pub fn from_recovered(
        window: u64,
        text: String,
        rev: u64,
        password_hash: Option<String>,
        tail: Vec<AppliedOp>,
    ) -> Self {
        let mut doc = Self::new(window);
        doc.text = TextBuffer::from_text(text);
        doc.rev = rev;
        for applied in tail {
            doc.dedup
                .insert(applied.author_id, applied.op_id, applied.rev, Vec::new());
            doc.op_log.push_back(applied);
        }
        doc.password_hash = password_hash;
        doc.trim_log();
        doc
    }

    pub fn rev(&self) -> u64 {
        self.rev
    }

    pub fn text(&self) -> &str {
        self.text.as_str()
    }

    pub fn status(&self) -> DocStatus {
        self.status
    }

    pub fn set_status(&mut self, status: DocStatus) {
        self.status = status;
    }

    pub fn password_hash(&self) -> Option<&str> {
        self.password_hash.as_deref()
    }

    /// Whether `provided` unlocks this document.
    pub fn is_authorized(&self, provided: Option<&str>) -> bool {
        auth::is_authorized(self.password_hash.as_deref(), provided)
    }

    /// Apply one edit request. The caller supplies the author id it
    /// authenticated for this session (a frame-level `client_id` is
    /// advisory only) and the server timestamp.
    pub fn apply_edit(&mut self, author: Uuid, req: &EditRequest, ts_ms: u64) -> ApplyResult {
        if self.status == DocStatus::Degraded {
            return ApplyResult::Rejected(RejectReason::StorageUnavailable);
        }
        if self.status == DocStatus::Closed {
            return ApplyResult::Rejected(RejectReason::StorageUnavailable);
        }

        // Replayed edit from a reconnect: return the first result.
        if let Some((rev, ops)) = self.dedup.get(author, req.op_id) {
            return ApplyResult::Accepted {
                rev: *rev,
                op_id: req.op_id,
                ops: ops.clone(),
                appended: Vec::new(),
            };
        }

        if req.base_rev > self.rev {
            return ApplyResult::Rejected(RejectReason::BaseTooOld);
        }
        if self.rev - req.base_rev > self.window {
            return ApplyResult::Rejected(RejectReason::BaseTooOld);
        }
        if let Some(first) = self.op_log.front() {
            // The tail must cover everything past base_rev.
            if req.base_rev + 1 < first.rev && req.base_rev < self.rev {
                return ApplyResult::Rejected(RejectReason::BaseTooOld);
            }
        } else if req.base_rev < self.rev {
            return ApplyResult::Rejected(RejectReason::BaseTooOld);
        }

        let transformed = ot::transform_through(
            &req.ops,
            author,
            self.op_log
                .iter()
                .filter(|a| a.rev > req.base_rev)
                .map(|a| (&a.op, a.author_id)),
        );

        let mut appended = Vec::with_capacity(transformed.len());
        let mut committed = Vec::with_capacity(transformed.len());
        for op in transformed {
            if op.is_noop() {
                continue;
            }
            self.text.apply(&op);
            self.rev += 1;
            let applied = AppliedOp {
                rev: self.rev,
                op: op.clone(),
                author_id: author,
                op_id: req.op_id,
                ts_ms,
            };
            self.op_log.push_back(applied.clone());
            appended.push(applied);
            committed.push(op);
        }
        self.trim_log();

        self.dedup
            .insert(author, req.op_id, self.rev, committed.clone());

        ApplyResult::Accepted {
            rev: self.rev,
            op_id: req.op_id,
            ops: committed,
            appended,
        }
    }

    /// Change or clear the password. `current` must match the stored
    /// hash when one exists (and must be absent/empty when none does);
    /// an empty or missing `new` removes the password. Returns the new
    /// hash for the caller to persist.
    pub fn set_password(
        &mut self,
        current: Option<&str>,
        new: Option<&str>,
    ) -> Result<Option<String>, RejectReason> {
        match &self.password_hash {
            Some(expected) => {
                let supplied = current.unwrap_or("");
                if !auth::verify_password(supplied, expected) {
                    return Err(RejectReason::Unauthorised);
                }
            }
            None => {
                if current.is_some_and(|c| !c.is_empty()) {
                    return Err(RejectReason::Unauthorised);
                }
            }
        }
        let new_hash = new
            .filter(|p| !p.is_empty())
            .map(auth::hash_password);
        self.password_hash = new_hash.clone();
        Ok(new_hash)
    }

    fn trim_log(&mut self) {
        while self.op_log.len() as u64 > self.window {
            self.op_log.pop_front();
        }
    }
}

//! Session router: one actor per document, fan-out to sessions.
//!
//! ```text
//! ws session A ──┐                       ┌── session queue A (256)
//! ws session B ──┼── mailbox ── DocActor ┼── session queue B
//! http handlers ─┘   (mpsc)      │       └── session queue C
//!                                │
//!                     Document + PresenceRegistry + DocumentStore
//! ```
//!
//! Every mutation of a document's state is a message into its actor's
//! mailbox, which yields the per-slug total order the protocol needs:
//! subscribers observe strictly increasing revs, and the author's
//! `applied` frame (its ack) is enqueued in the same fan-out pass as
//! everyone else's. Fan-out never blocks the actor: session queues are
//! bounded and a full queue disconnects that session (close 1013).
//!
//! The WAL is fsynced before the `applied` frame is enqueued. If a
//! write fails, the in-memory ops are parked, the document degrades
//! (new edits rejected with `storage_unavailable`), and a background
//! retry with exponential backoff replays the parked records; their
//! acks go out only once durable.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::Config;
use crate::document::{AppliedOp, ApplyResult, DocStatus, Document, RejectReason};
use crate::presence::PresenceRegistry;
use crate::protocol::{
    CursorState, EditRequest, ErrorCode, ImeEvent, PresenceEntry, ServerFrame,
};
use crate::storage::{now_millis, DocumentStore, StoreError};

const RETRY_INITIAL: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(30);

/// WebSocket close code for a session dropped over backpressure
/// ("try again later").
pub const CLOSE_TRY_AGAIN: u16 = 1013;

/// What a session's writer task consumes.
#[derive(Debug)]
pub enum SessionMsg {
    /// A pre-encoded JSON frame.
    Frame(Arc<String>),
    /// Close the socket with this code.
    Close { code: u16, reason: String },
}

pub type SessionTx = mpsc::Sender<SessionMsg>;

/// Successful join.
#[derive(Debug)]
pub struct JoinOk {
    pub client_id: Uuid,
}

/// Snapshot for the HTTP surface.
#[derive(Debug)]
pub struct SnapshotInfo {
    pub rev: u64,
    pub content: String,
}

/// Commands a document actor accepts.
pub enum DocCommand {
    Join {
        proposed_id: Option<Uuid>,
        label: Option<String>,
        color: Option<String>,
        password: Option<String>,
        outbound: SessionTx,
        respond: oneshot::Sender<Result<JoinOk, ErrorCode>>,
    },
    CheckAuth {
        password: Option<String>,
        respond: oneshot::Sender<bool>,
    },
    Edit {
        client_id: Uuid,
        edit: EditRequest,
    },
    Cursor {
        client_id: Uuid,
        cursor: CursorState,
        op_id: Option<Uuid>,
        ts: Option<u64>,
    },
    Ime {
        client_id: Uuid,
        ime: ImeEvent,
        op_id: Option<Uuid>,
        ts: Option<u64>,
    },
    Profile {
        client_id: Uuid,
        label: Option<String>,
        color: Option<String>,
    },
    Touch {
        client_id: Uuid,
    },
    Leave {
        client_id: Uuid,
    },
    Snapshot {
        password: Option<String>,
        respond: oneshot::Sender<Result<SnapshotInfo, ErrorCode>>,
    },
    SetPassword {
        current: Option<String>,
        new: Option<String>,
        respond: oneshot::Sender<Result<(), ErrorCode>>,
    },
    Flush {
        respond: oneshot::Sender<()>,
    },
}

/// Routing errors surfaced to the HTTP/WS layer.
#[derive(Debug)]
pub enum HubError {
    InvalidSlug(String),
    /// Document cannot be loaded (corrupt snapshot, storage down).
    Unavailable(String),
    /// The actor went away mid-request.
    Gone,
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSlug(s) => write!(f, "invalid slug: {s}"),
            Self::Unavailable(s) => write!(f, "document unavailable: {s}"),
            Self::Gone => write!(f, "document actor stopped"),
        }
    }
}

impl std::error::Error for HubError {}

impl From<StoreError> for HubError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidSlug(s) => Self::InvalidSlug(s),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Maps slugs to live document actors.
pub struct Hub {
    docs: tokio::sync::Mutex<HashMap<String, mpsc::Sender<DocCommand>>>,
    config: Arc<Config>,
}

impl Hub {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            docs: tokio::sync::Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Send a command to the document actor for `slug`, spawning it
    /// (and recovering the document from disk) on first touch. An
    /// actor that stopped after its last subscriber left is respawned.
    pub async fn send(&self, slug: &str, cmd: DocCommand) -> Result<(), HubError> {
        let tx = self.handle_for(slug).await?;
        match tx.send(cmd).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(cmd)) => {
                self.docs.lock().await.remove(slug);
                let tx = self.handle_for(slug).await?;
                tx.send(cmd).await.map_err(|_| HubError::Gone)
            }
        }
    }

    async fn handle_for(&self, slug: &str) -> Result<mpsc::Sender<DocCommand>, HubError> {
        let mut docs = self.docs.lock().await;
        if let Some(tx) = docs.get(slug) {
            return Ok(tx.clone());
        }
        let (tx, rx) = mpsc::channel(256);
        let actor = DocActor::load(slug, rx, self.config.clone())?;
        tokio::spawn(actor.run());
        docs.insert(slug.to_string(), tx.clone());
        Ok(tx)
    }

    /// Flush every loaded document (shutdown path).
    pub async fn flush_all(&self) {
        let handles: Vec<(String, mpsc::Sender<DocCommand>)> = {
            let docs = self.docs.lock().await;
            docs.iter().map(|(s, tx)| (s.clone(), tx.clone())).collect()
        };
        for (slug, tx) in handles {
            let (respond, done) = oneshot::channel();
            if tx.send(DocCommand::Flush { respond }).await.is_ok() {
                let _ = done.await;
            } else {
                debug!("flush: actor for '{slug}' already stopped");
            }
        }
    }

    /// Auth probe used before a WebSocket upgrade.
    pub async fn check_auth(&self, slug: &str, password: Option<String>) -> Result<bool, HubError> {
        let (respond, rx) = oneshot::channel();
        self.send(slug, DocCommand::CheckAuth { password, respond })
            .await?;
        rx.await.map_err(|_| HubError::Gone)
    }

    pub async fn snapshot(
        &self,
        slug: &str,
        password: Option<String>,
    ) -> Result<Result<SnapshotInfo, ErrorCode>, HubError> {
        let (respond, rx) = oneshot::channel();
        self.send(slug, DocCommand::Snapshot { password, respond })
            .await?;
        rx.await.map_err(|_| HubError::Gone)
    }

    pub async fn set_password(
        &self,
        slug: &str,
        current: Option<String>,
        new: Option<String>,
    ) -> Result<Result<(), ErrorCode>, HubError> {
        let (respond, rx) = oneshot::channel();
        self.send(slug, DocCommand::SetPassword { current, new, respond })
            .await?;
        rx.await.map_err(|_| HubError::Gone)
    }
}

/// The per-document actor: exclusive owner of document, presence, and
/// storage for one slug.
struct DocActor {
    slug: String,
    rx: mpsc::Receiver<DocCommand>,
    config: Arc<Config>,
    doc: Document,
    presence: PresenceRegistry,
    store: DocumentStore,
    created_ms: u64,
    sessions: HashMap<Uuid, SessionTx>,
    /// Applied-but-not-yet-durable ops parked by a storage failure,
    /// with the frames whose acks are being withheld.
    parked: Vec<(Vec<AppliedOp>, ServerFrame)>,
    retry_at: Option<Instant>,
    retry_backoff: Duration,
}

impl DocActor {
    fn load(
        slug: &str,
        rx: mpsc::Receiver<DocCommand>,
        config: Arc<Config>,
    ) -> Result<Self, StoreError> {
        let (store, recovered) = DocumentStore::open(config.store_config(), slug)?;
        info!(
            "document '{slug}' loaded at rev {} ({} wal records replayed)",
            recovered.rev,
            recovered.tail.len()
        );
        let doc = Document::from_recovered(
            config.transform_window,
            recovered.text,
            recovered.rev,
            recovered.password_hash,
            recovered.tail,
        );
        Ok(Self {
            slug: slug.to_string(),
            rx,
            config,
            doc,
            presence: PresenceRegistry::new(),
            store,
            created_ms: recovered.created_ms,
            sessions: HashMap::new(),
            parked: Vec::new(),
            retry_at: None,
            retry_backoff: RETRY_INITIAL,
        })
    }

    async fn run(mut self) {
        let mut sweep =
            tokio::time::interval(Duration::from_secs(self.config.evict_sweep_secs.max(1)));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Time-based snapshot flush, independent of the byte/op-count
        // compaction thresholds: an edited-then-idle document still
        // gets its snapshot written within one flush interval.
        let mut flush =
            tokio::time::interval(Duration::from_secs(self.config.snapshot_flush_secs.max(1)));
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            let stop = self.handle(cmd);
                            if stop {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.sweep();
                }
                _ = flush.tick() => {
                    if self.doc.status() == DocStatus::Ready {
                        self.flush_snapshot();
                    }
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)),
                    if retry_at.is_some() =>
                {
                    self.retry_storage();
                }
            }
        }

        self.final_flush();
        info!("document '{}' closed", self.slug);
    }

    /// Returns true when the actor should stop (last session gone).
    fn handle(&mut self, cmd: DocCommand) -> bool {
        match cmd {
            DocCommand::Join {
                proposed_id,
                label,
                color,
                password,
                outbound,
                respond,
            } => {
                self.handle_join(proposed_id, label, color, password, outbound, respond);
            }
            DocCommand::CheckAuth { password, respond } => {
                let _ = respond.send(self.doc.is_authorized(password.as_deref()));
            }
            DocCommand::Edit { client_id, edit } => self.handle_edit(client_id, edit),
            DocCommand::Cursor {
                client_id,
                cursor,
                op_id,
                ts,
            } => self.handle_cursor(client_id, cursor, op_id, ts),
            DocCommand::Ime {
                client_id,
                ime,
                op_id,
                ts,
            } => self.handle_ime(client_id, ime, op_id, ts),
            DocCommand::Profile {
                client_id,
                label,
                color,
            } => {
                let now = now_millis();
                if let Some(updated) = self.presence.update_profile(client_id, label, color, now) {
                    self.fanout(self.diff_updated(updated));
                }
            }
            DocCommand::Touch { client_id } => {
                self.presence.touch(&client_id, now_millis());
            }
            DocCommand::Leave { client_id } => {
                self.sessions.remove(&client_id);
                if let Some(removed) = self.presence.remove(&client_id) {
                    self.fanout(self.diff_removed(vec![removed.client_id]));
                }
                if self.sessions.is_empty() {
                    return true;
                }
            }
            DocCommand::Snapshot { password, respond } => {
                let result = if self.doc.is_authorized(password.as_deref()) {
                    Ok(SnapshotInfo {
                        rev: self.doc.rev(),
                        content: self.doc.text().to_string(),
                    })
                } else {
                    Err(ErrorCode::Unauthorised)
                };
                let _ = respond.send(result);
            }
            DocCommand::SetPassword {
                current,
                new,
                respond,
            } => {
                let result = match self.doc.set_password(current.as_deref(), new.as_deref()) {
                    Ok(hash) => {
                        match self.store.set_password_hash(hash.as_deref(), self.created_ms) {
                            Ok(()) => Ok(()),
                            Err(e) => {
                                error!("persisting password for '{}': {e}", self.slug);
                                Err(ErrorCode::StorageUnavailable)
                            }
                        }
                    }
                    Err(_) => Err(ErrorCode::Unauthorised),
                };
                let _ = respond.send(result);
            }
            DocCommand::Flush { respond } => {
                self.flush_snapshot();
                let _ = respond.send(());
            }
        }
        false
    }

    fn handle_join(
        &mut self,
        proposed_id: Option<Uuid>,
        label: Option<String>,
        color: Option<String>,
        password: Option<String>,
        outbound: SessionTx,
        respond: oneshot::Sender<Result<JoinOk, ErrorCode>>,
    ) {
        if !self.doc.is_authorized(password.as_deref()) {
            let _ = respond.send(Err(ErrorCode::Unauthorised));
            return;
        }

        // Server-assigned id; a client proposal is honored when free.
        let client_id = proposed_id
            .filter(|id| !self.sessions.contains_key(id) && !self.presence.contains(id))
            .unwrap_or_else(Uuid::new_v4);

        let now = now_millis();
        let added = self.presence.register(client_id, label, color, now);

        // The snapshot pair goes through the session queue so the
        // writer task stays the only socket writer and frame order is
        // join-reply first, broadcasts after.
        let snapshot = ServerFrame::Snapshot {
            slug: self.slug.clone(),
            rev: self.doc.rev(),
            content: self.doc.text().to_string(),
            client_id,
            presence: self.presence.snapshot(),
        };
        let presence_snapshot = ServerFrame::PresenceSnapshot {
            slug: self.slug.clone(),
            clients: self.presence.snapshot(),
        };
        if enqueue(&outbound, &snapshot).is_err()
            || enqueue(&outbound, &presence_snapshot).is_err()
        {
            // Session died before finishing the handshake.
            self.presence.remove(&client_id);
            let _ = respond.send(Err(ErrorCode::Backpressure));
            return;
        }

        self.sessions.insert(client_id, outbound);
        let _ = respond.send(Ok(JoinOk { client_id }));

        self.fanout(self.diff_added(added));
        debug!("client {client_id} joined '{}'", self.slug);
    }

    fn handle_edit(&mut self, client_id: Uuid, edit: EditRequest) {
        let ts = edit.ts.unwrap_or_else(now_millis);
        match self.doc.apply_edit(client_id, &edit, ts) {
            ApplyResult::Accepted {
                rev,
                op_id,
                ops,
                appended,
            } => {
                let frame = ServerFrame::Applied {
                    slug: self.slug.clone(),
                    rev,
                    ops,
                    client_id: Some(client_id),
                    op_id: Some(op_id),
                    ts,
                };
                if appended.is_empty() {
                    // Duplicate replay or fully transformed away:
                    // nothing new for other subscribers, ack the
                    // author only.
                    self.send_to(&client_id, &frame);
                    return;
                }
                if let Err(e) = self.store.append_batch(&appended) {
                    self.enter_degraded(appended, frame, e);
                    return;
                }
                if let Err(e) = self.store.maybe_compact(self.doc.rev(), self.doc.text()) {
                    // Compaction failure is not fatal to the edit: the
                    // WAL record is already durable.
                    warn!("compaction failed for '{}': {e}", self.slug);
                }
                self.fanout(frame);
                self.propagate_cursor_after(client_id, &edit, ts);
            }
            ApplyResult::Rejected(reason) => {
                let code = match reason {
                    RejectReason::BaseTooOld => ErrorCode::BaseTooOld,
                    RejectReason::Malformed => ErrorCode::MalformedFrame,
                    RejectReason::Unauthorised => ErrorCode::Unauthorised,
                    RejectReason::StorageUnavailable => ErrorCode::StorageUnavailable,
                };
                debug!("edit rejected for '{}': {reason:?}", self.slug);
                self.send_to(
                    &client_id,
                    &ServerFrame::error(code, format!("edit rejected: {reason:?}")),
                );
            }
        }
    }

    /// An edit carrying `cursor_after` also refreshes presence.
    fn propagate_cursor_after(&mut self, client_id: Uuid, edit: &EditRequest, ts: u64) {
        let cursor = match &edit.cursor_after {
            Some(c) => c.clone(),
            None => return,
        };
        let now = now_millis();
        if let Some(updated) = self.presence.update_cursor(client_id, cursor.clone(), now) {
            self.fanout(ServerFrame::Cursor {
                slug: self.slug.clone(),
                client_id,
                cursor,
                op_id: Some(edit.op_id),
                ts,
            });
            self.fanout(self.diff_updated(updated));
        }
    }

    fn handle_cursor(
        &mut self,
        client_id: Uuid,
        cursor: CursorState,
        op_id: Option<Uuid>,
        ts: Option<u64>,
    ) {
        let now = now_millis();
        if let Some(updated) = self.presence.update_cursor(client_id, cursor.clone(), now) {
            self.fanout(ServerFrame::Cursor {
                slug: self.slug.clone(),
                client_id,
                cursor,
                op_id,
                ts: ts.unwrap_or(now),
            });
            self.fanout(self.diff_updated(updated));
        }
    }

    fn handle_ime(
        &mut self,
        client_id: Uuid,
        ime: ImeEvent,
        op_id: Option<Uuid>,
        ts: Option<u64>,
    ) {
        let now = now_millis();
        if let Some(updated) = self.presence.update_ime(client_id, &ime, now) {
            self.fanout(ServerFrame::Ime {
                slug: self.slug.clone(),
                client_id,
                ime,
                op_id,
                ts: ts.unwrap_or(now),
            });
            self.fanout(self.diff_updated(updated));
        }
    }

    /// Periodic tick: evict idle presence.
    fn sweep(&mut self) {
        let now = now_millis();
        let removed = self
            .presence
            .evict_idle(now, self.config.idle_evict_secs * 1000);
        if !removed.is_empty() {
            info!(
                "evicted {} idle client(s) from '{}'",
                removed.len(),
                self.slug
            );
            self.fanout(self.diff_removed(removed));
        }
    }

    fn enter_degraded(&mut self, appended: Vec<AppliedOp>, frame: ServerFrame, err: StoreError) {
        error!(
            "storage failure for '{}', degrading: {err}",
            self.slug
        );
        self.parked.push((appended, frame));
        self.doc.set_status(DocStatus::Degraded);
        self.retry_at = Some(Instant::now() + self.retry_backoff);
    }

    /// Background storage retry. On success, replay parked records and
    /// release the withheld acks in order.
    fn retry_storage(&mut self) {
        self.retry_at = None;
        let attempt = (|| -> Result<(), StoreError> {
            self.store.probe()?;
            for (batch, _) in &self.parked {
                self.store.append_batch(batch)?;
            }
            Ok(())
        })();
        match attempt {
            Ok(()) => {
                info!("storage recovered for '{}'", self.slug);
                self.doc.set_status(DocStatus::Ready);
                self.retry_backoff = RETRY_INITIAL;
                for (_, frame) in std::mem::take(&mut self.parked) {
                    self.fanout(frame);
                }
            }
            Err(e) => {
                self.retry_backoff = (self.retry_backoff * 2).min(RETRY_MAX);
                self.retry_at = Some(Instant::now() + self.retry_backoff);
                warn!(
                    "storage retry failed for '{}' (next in {:?}): {e}",
                    self.slug, self.retry_backoff
                );
            }
        }
    }

    fn flush_snapshot(&mut self) {
        if self.doc.rev() > self.store.snapshot_rev() {
            if let Err(e) = self.store.write_snapshot(self.doc.rev(), self.doc.text()) {
                error!("snapshot flush failed for '{}': {e}", self.slug);
            }
        }
    }

    fn final_flush(&mut self) {
        self.flush_snapshot();
        self.doc.set_status(DocStatus::Closed);
    }

    fn diff_added(&self, entry: PresenceEntry) -> ServerFrame {
        ServerFrame::PresenceDiff {
            slug: self.slug.clone(),
            added: vec![entry],
            updated: Vec::new(),
            removed: Vec::new(),
        }
    }

    fn diff_updated(&self, entry: PresenceEntry) -> ServerFrame {
        ServerFrame::PresenceDiff {
            slug: self.slug.clone(),
            added: Vec::new(),
            updated: vec![entry],
            removed: Vec::new(),
        }
    }

    fn diff_removed(&self, removed: Vec<Uuid>) -> ServerFrame {
        ServerFrame::PresenceDiff {
            slug: self.slug.clone(),
            added: Vec::new(),
            updated: Vec::new(),
            removed,
        }
    }

    /// Enqueue a frame to one session; a dead or full queue drops the
    /// session.
    fn send_to(&mut self, client_id: &Uuid, frame: &ServerFrame) {
        let dead = match self.sessions.get(client_id) {
            Some(tx) => enqueue(tx, frame).is_err(),
            None => false,
        };
        if dead {
            self.drop_slow_session(*client_id);
        }
    }

    /// Broadcast to every session, including the author of the change.
    /// Sessions that cannot keep up are dropped and reported as
    /// presence removals; the cascade runs until the session set is
    /// stable.
    fn fanout(&mut self, frame: ServerFrame) {
        let mut queue = VecDeque::from([frame]);
        while let Some(frame) = queue.pop_front() {
            let encoded = match frame.encode() {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    error!("frame encode failed for '{}': {e}", self.slug);
                    continue;
                }
            };
            let mut dead = Vec::new();
            for (id, tx) in &self.sessions {
                match tx.try_send(SessionMsg::Frame(encoded.clone())) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "session {id} on '{}' overflowed its queue, disconnecting",
                            self.slug
                        );
                        dead.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => dead.push(*id),
                }
            }
            for id in dead {
                if let Some(tx) = self.sessions.remove(&id) {
                    close_session(tx);
                }
                if let Some(removed) = self.presence.remove(&id) {
                    queue.push_back(self.diff_removed(vec![removed.client_id]));
                }
            }
        }
    }

    fn drop_slow_session(&mut self, client_id: Uuid) {
        if let Some(tx) = self.sessions.remove(&client_id) {
            close_session(tx);
        }
        if let Some(removed) = self.presence.remove(&client_id) {
            self.fanout(self.diff_removed(vec![removed.client_id]));
        }
    }
}

/// Deliver the 1013 close to a session dropped from fan-out. Its
/// queue may still be full, so this waits (off the actor task) for
/// the writer to drain before the close goes through; the writer
/// relays it as a WebSocket close frame and stops.
fn close_session(tx: SessionTx) {
    tokio::spawn(async move {
        let _ = tx
            .send(SessionMsg::Close {
                code: CLOSE_TRY_AGAIN,
                reason: "try again later".to_string(),
            })
            .await;
    });
}

fn enqueue(tx: &SessionTx, frame: &ServerFrame) -> Result<(), ()> {
    let encoded = frame.encode().map_err(|_| ())?;
    tx.try_send(SessionMsg::Frame(Arc::new(encoded)))
        .map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Op;
    use std::path::Path;

    fn test_config(vault: &Path) -> Arc<Config> {
        Arc::new(Config {
            vault_dir: vault.to_path_buf(),
            ..Config::default()
        })
    }

    fn edit(base_rev: u64, ops: Vec<Op>) -> EditRequest {
        EditRequest {
            base_rev,
            ops,
            client_id: None,
            op_id: Uuid::new_v4(),
            cursor_before: None,
            cursor_after: None,
            ts: None,
        }
    }

    async fn join(
        hub: &Hub,
        slug: &str,
        queue: usize,
    ) -> (Uuid, mpsc::Receiver<SessionMsg>) {
        let (outbound, rx) = mpsc::channel(queue);
        let (respond, done) = oneshot::channel();
        hub.send(
            slug,
            DocCommand::Join {
                proposed_id: None,
                label: None,
                color: None,
                password: None,
                outbound,
                respond,
            },
        )
        .await
        .unwrap();
        let ok = done.await.unwrap().unwrap();
        (ok.client_id, rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<SessionMsg>) -> ServerFrame {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within timeout")
            .expect("channel open")
        {
            SessionMsg::Frame(encoded) => ServerFrame::decode(&encoded).unwrap(),
            SessionMsg::Close { code, .. } => panic!("unexpected close {code}"),
        }
    }

    #[tokio::test]
    async fn test_join_receives_snapshot_then_presence() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(test_config(dir.path()));
        let (client_id, mut rx) = join(&hub, "doc", 16).await;

        match next_frame(&mut rx).await {
            ServerFrame::Snapshot {
                rev,
                content,
                client_id: assigned,
                ..
            } => {
                assert_eq!(rev, 0);
                assert_eq!(content, "");
                assert_eq!(assigned, client_id);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
        match next_frame(&mut rx).await {
            ServerFrame::PresenceSnapshot { clients, .. } => {
                assert_eq!(clients.len(), 1);
                assert_eq!(clients[0].client_id, client_id);
            }
            other => panic!("expected presence snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_edit_acked_and_broadcast_in_rev_order() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(test_config(dir.path()));

        // Each joiner sees its own handshake (snapshot +
        // presence_snapshot) plus the broadcast diff for its join.
        let (c1, mut rx1) = join(&hub, "doc", 64).await;
        for _ in 0..3 {
            let _ = next_frame(&mut rx1).await;
        }

        let (_c2, mut rx2) = join(&hub, "doc", 64).await;
        for _ in 0..3 {
            let _ = next_frame(&mut rx2).await;
        }
        // c1 sees c2's join diff.
        let _ = next_frame(&mut rx1).await;

        for (i, text) in ["a", "b", "c"].iter().enumerate() {
            hub.send(
                "doc",
                DocCommand::Edit {
                    client_id: c1,
                    edit: edit(
                        i as u64,
                        vec![Op::Insert {
                            pos: i as u32,
                            text: text.to_string(),
                        }],
                    ),
                },
            )
            .await
            .unwrap();
        }

        let mut last_rev = 0;
        for _ in 0..3 {
            match next_frame(&mut rx2).await {
                ServerFrame::Applied { rev, .. } => {
                    assert!(rev > last_rev, "revs must be strictly increasing");
                    last_rev = rev;
                }
                other => panic!("expected applied, got {other:?}"),
            }
        }
        assert_eq!(last_rev, 3);

        // The author got its acks too.
        match next_frame(&mut rx1).await {
            ServerFrame::Applied { rev, client_id, .. } => {
                assert_eq!(rev, 1);
                assert_eq!(client_id, Some(c1));
            }
            other => panic!("expected applied ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_session_dropped_not_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(test_config(dir.path()));

        // Tiny queue that the handshake already half-fills.
        let (slow, mut slow_rx) = join(&hub, "doc", 3).await;
        let (fast, mut fast_rx) = join(&hub, "doc", 64).await;
        let _ = next_frame(&mut fast_rx).await;
        let _ = next_frame(&mut fast_rx).await;

        // Never read from slow_rx; spam edits until it overflows.
        for i in 0..10u64 {
            hub.send(
                "doc",
                DocCommand::Edit {
                    client_id: fast,
                    edit: edit(
                        i,
                        vec![Op::Insert {
                            pos: 0,
                            text: "x".to_string(),
                        }],
                    ),
                },
            )
            .await
            .unwrap();
        }

        // The fast session eventually observes the slow one's removal.
        let mut saw_removal = false;
        for _ in 0..20 {
            match tokio::time::timeout(Duration::from_secs(2), fast_rx.recv()).await {
                Ok(Some(SessionMsg::Frame(encoded))) => {
                    if let Ok(ServerFrame::PresenceDiff { removed, .. }) =
                        ServerFrame::decode(&encoded)
                    {
                        if removed.contains(&slow) {
                            saw_removal = true;
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
        assert!(saw_removal, "slow session should be evicted from presence");

        // The slow session itself is told to go away: after its
        // buffered frames drain, the writer must see a 1013 close.
        let mut saw_close = false;
        for _ in 0..20 {
            match tokio::time::timeout(Duration::from_secs(2), slow_rx.recv()).await {
                Ok(Some(SessionMsg::Close { code, .. })) => {
                    assert_eq!(code, CLOSE_TRY_AGAIN);
                    saw_close = true;
                    break;
                }
                Ok(Some(SessionMsg::Frame(_))) => continue,
                _ => break,
            }
        }
        assert!(saw_close, "slow session must receive the 1013 close");
    }

    #[tokio::test]
    async fn test_password_guards_join_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(test_config(dir.path()));

        // Bootstrap the doc and set a password.
        let result = hub
            .set_password("secret-doc", None, Some("pw".to_string()))
            .await
            .unwrap();
        assert!(result.is_ok());

        // Snapshot without the password is unauthorised.
        let snap = hub.snapshot("secret-doc", None).await.unwrap();
        assert_eq!(snap.err(), Some(ErrorCode::Unauthorised));

        // With it, fine.
        let snap = hub
            .snapshot("secret-doc", Some("pw".to_string()))
            .await
            .unwrap();
        assert!(snap.is_ok());

        // Join without password is refused.
        let (outbound, _rx) = mpsc::channel(16);
        let (respond, done) = oneshot::channel();
        hub.send(
            "secret-doc",
            DocCommand::Join {
                proposed_id: None,
                label: None,
                color: None,
                password: None,
                outbound,
                respond,
            },
        )
        .await
        .unwrap();
        assert_eq!(done.await.unwrap().err(), Some(ErrorCode::Unauthorised));
    }

    #[tokio::test]
    async fn test_proposed_client_id_honored_when_free() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(test_config(dir.path()));
        let wanted = Uuid::new_v4();

        let (outbound, _rx) = mpsc::channel(16);
        let (respond, done) = oneshot::channel();
        hub.send(
            "doc",
            DocCommand::Join {
                proposed_id: Some(wanted),
                label: None,
                color: None,
                password: None,
                outbound,
                respond,
            },
        )
        .await
        .unwrap();
        assert_eq!(done.await.unwrap().unwrap().client_id, wanted);

        // Second join proposing the same id gets a fresh one.
        let (outbound, _rx2) = mpsc::channel(16);
        let (respond, done) = oneshot::channel();
        hub.send(
            "doc",
            DocCommand::Join {
                proposed_id: Some(wanted),
                label: None,
                color: None,
                password: None,
                outbound,
                respond,
            },
        )
        .await
        .unwrap();
        let assigned = done.await.unwrap().unwrap().client_id;
        assert_ne!(assigned, wanted);
    }

    #[tokio::test]
    async fn test_invalid_slug_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(test_config(dir.path()));
        match hub.snapshot("../escape", None).await {
            Err(HubError::InvalidSlug(_)) => {}
            other => panic!("expected InvalidSlug, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_actor_stops_after_last_leave_and_respawns() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(test_config(dir.path()));

        let (c1, mut rx) = join(&hub, "doc", 64).await;
        for _ in 0..3 {
            let _ = next_frame(&mut rx).await;
        }

        hub.send(
            "doc",
            DocCommand::Edit {
                client_id: c1,
                edit: edit(
                    0,
                    vec![Op::Insert {
                        pos: 0,
                        text: "persist me".to_string(),
                    }],
                ),
            },
        )
        .await
        .unwrap();
        let _ = next_frame(&mut rx).await; // ack

        hub.send("doc", DocCommand::Leave { client_id: c1 })
            .await
            .unwrap();
        // Give the actor a moment to flush and stop.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // A new subscriber reaches a respawned actor with the same state.
        let (_c2, mut rx2) = join(&hub, "doc", 64).await;
        match next_frame(&mut rx2).await {
            ServerFrame::Snapshot { rev, content, .. } => {
                assert_eq!(rev, 1);
                assert_eq!(content, "persist me");
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }
}

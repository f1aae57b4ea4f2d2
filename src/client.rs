//! Client-side reconciliation: optimistic local edits, ack handling,
//! transforms against remote ops, and drift repair after reconnects.
//!
//! ```text
//! keystroke ──► diff(old, new) ──► apply locally ──► pending queue
//!                                                        │ persist
//!                                                        ▼
//!                                                   edit frame
//!
//! applied(own op_id)   ──► drop pending entry, advance server rev
//! applied(remote)      ──► transform pending ⇄ remote, apply remote
//! reconnect            ──► resend pending (server dedups), then
//!                          drift-repair against a fresh snapshot
//! ```
//!
//! [`Reconciler`] is pure state (no I/O beyond its [`PendingStore`])
//! so the protocol invariants are testable without a socket;
//! [`CollabClient`] wraps it in a tokio-tungstenite transport.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ot;
use crate::protocol::{
    ClientFrame, CursorState, EditRequest, Op, PresenceEntry, ProtocolError, ServerFrame,
};
use crate::text::{diff_ops, TextBuffer};

/// Client ping cadence; the server treats prolonged silence as a dead
/// transport.
const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// One locally applied, not-yet-acknowledged edit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingEdit {
    pub op_id: Uuid,
    pub base_rev: u64,
    pub ops: Vec<Op>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_before: Option<CursorState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_after: Option<CursorState>,
    pub ts: u64,
}

impl PendingEdit {
    pub fn to_request(&self, client_id: Option<Uuid>) -> EditRequest {
        EditRequest {
            base_rev: self.base_rev,
            ops: self.ops.clone(),
            client_id,
            op_id: self.op_id,
            cursor_before: self.cursor_before.clone(),
            cursor_after: self.cursor_after.clone(),
            ts: Some(self.ts),
        }
    }
}

/// Where the pending queue survives page reloads / process restarts.
pub trait PendingStore: Send {
    fn load(&self) -> io::Result<Vec<PendingEdit>>;
    fn save(&self, pending: &[PendingEdit]) -> io::Result<()>;
    fn clear(&self) -> io::Result<()>;
}

/// In-memory store for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Vec<PendingEdit>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PendingStore for MemoryStore {
    fn load(&self) -> io::Result<Vec<PendingEdit>> {
        Ok(self.inner.lock().map(|v| v.clone()).unwrap_or_default())
    }

    fn save(&self, pending: &[PendingEdit]) -> io::Result<()> {
        if let Ok(mut inner) = self.inner.lock() {
            *inner = pending.to_vec();
        }
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        self.save(&[])
    }
}

/// JSON-file-backed store, the filesystem analogue of browser local
/// storage.
#[derive(Debug)]
pub struct FilePendingStore {
    path: PathBuf,
}

impl FilePendingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PendingStore for FilePendingStore {
    fn load(&self) -> io::Result<Vec<PendingEdit>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn save(&self, pending: &[PendingEdit]) -> io::Result<()> {
        let raw = serde_json::to_string(pending)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, raw)
    }

    fn clear(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// The reconciliation state machine for one document replica.
pub struct Reconciler<S: PendingStore> {
    client_id: Uuid,
    text: TextBuffer,
    server_rev: u64,
    pending: VecDeque<PendingEdit>,
    store: S,
    /// Whether a snapshot has ever been adopted; before that the local
    /// text is not a replica and drift repair must not run.
    synced: bool,
}

impl<S: PendingStore> Reconciler<S> {
    pub fn new(client_id: Uuid, store: S) -> Self {
        let pending = store.load().unwrap_or_default();
        Self {
            client_id,
            text: TextBuffer::new(),
            server_rev: 0,
            pending: pending.into(),
            store,
            synced: false,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// The server assigned us a different id (join handshake).
    pub fn adopt_client_id(&mut self, id: Uuid) {
        self.client_id = id;
    }

    pub fn text(&self) -> &str {
        self.text.as_str()
    }

    pub fn server_rev(&self) -> u64 {
        self.server_rev
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether a snapshot has ever been adopted.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Adopt the authoritative snapshot from a join handshake, then
    /// re-apply whatever is still pending on top of it.
    pub fn load_snapshot(&mut self, rev: u64, content: &str) {
        self.text = TextBuffer::from_text(content);
        self.server_rev = rev;
        self.synced = true;
        for entry in &mut self.pending {
            entry.base_rev = rev;
            self.text.apply_all(&entry.ops);
        }
    }

    /// The user changed the text. Diffs, applies optimistically, and
    /// returns the edit to put on the wire (None when nothing
    /// changed).
    pub fn local_edit(
        &mut self,
        new_text: &str,
        cursor_before: Option<CursorState>,
        cursor_after: Option<CursorState>,
        ts: u64,
    ) -> Option<PendingEdit> {
        let ops = diff_ops(self.text.as_str(), new_text);
        if ops.is_empty() {
            return None;
        }
        self.text = TextBuffer::from_text(new_text);
        let entry = PendingEdit {
            op_id: Uuid::new_v4(),
            base_rev: self.server_rev,
            ops,
            cursor_before,
            cursor_after,
            ts,
        };
        self.pending.push_back(entry.clone());
        self.persist();
        Some(entry)
    }

    /// Handle an `applied` frame. Returns true when it acknowledged
    /// one of our own pending edits.
    pub fn handle_applied(
        &mut self,
        rev: u64,
        ops: &[Op],
        author: Option<Uuid>,
        op_id: Option<Uuid>,
    ) -> bool {
        if author == Some(self.client_id) {
            if let Some(op_id) = op_id {
                let before = self.pending.len();
                self.pending.retain(|p| p.op_id != op_id);
                if self.pending.len() != before {
                    self.server_rev = self.server_rev.max(rev);
                    self.persist();
                    return true;
                }
            }
            self.server_rev = self.server_rev.max(rev);
            return false;
        }

        // Remote edit: transform it against our pending ops so it can
        // be applied to the optimistic local text, and transform the
        // pending ops against it so resends stay correct.
        let remote_author = author.unwrap_or(Uuid::nil());
        let mut remote_ops = ops.to_vec();
        for entry in &mut self.pending {
            let pending_before = entry.ops.clone();
            entry.ops = remote_ops.iter().fold(entry.ops.clone(), |acc, r| {
                ot::transform_ops(&acc, self.client_id, r, remote_author)
            });
            remote_ops = pending_before.iter().fold(remote_ops, |acc, p| {
                ot::transform_ops(&acc, remote_author, p, self.client_id)
            });
            entry.base_rev = rev;
        }
        self.text.apply_all(&remote_ops);
        self.server_rev = self.server_rev.max(rev);
        self.persist();
        false
    }

    /// Everything to resend, in order, after a reconnect. The server's
    /// dedup window makes the replay idempotent.
    pub fn resend_queue(&self) -> Vec<PendingEdit> {
        self.pending.iter().cloned().collect()
    }

    /// Compare a fresh authoritative snapshot against local state once
    /// the pending queue has drained. A difference means an op was
    /// lost (or the server truncated its transform window): emit one
    /// repair edit that turns the server text into ours.
    pub fn drift_repair(&mut self, snapshot_rev: u64, snapshot_text: &str, ts: u64) -> Option<PendingEdit> {
        if !self.pending.is_empty() {
            return None;
        }
        self.server_rev = snapshot_rev;
        let ops = diff_ops(snapshot_text, self.text.as_str());
        if ops.is_empty() {
            return None;
        }
        info!("drift repair: {} op(s) to reconcile", ops.len());
        let entry = PendingEdit {
            op_id: Uuid::new_v4(),
            base_rev: snapshot_rev,
            ops,
            cursor_before: None,
            cursor_after: None,
            ts,
        };
        self.pending.push_back(entry.clone());
        self.persist();
        Some(entry)
    }

    fn persist(&mut self) {
        let pending: Vec<PendingEdit> = self.pending.iter().cloned().collect();
        if let Err(e) = self.store.save(&pending) {
            warn!("failed to persist pending queue: {e}");
        }
    }
}

/// Connection lifecycle of a [`CollabClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected { client_id: Uuid, rev: u64 },
    Disconnected,
    /// Local text changed because of a remote edit.
    RemoteApplied { rev: u64, text: String },
    /// One of our edits was acknowledged.
    Acked { op_id: Uuid, rev: u64 },
    PresenceSnapshot(Vec<PresenceEntry>),
    PresenceChanged {
        added: Vec<PresenceEntry>,
        updated: Vec<PresenceEntry>,
        removed: Vec<Uuid>,
    },
    Pong { ts: Option<u64> },
    ServerError { message: String },
}

/// WebSocket client driving a [`Reconciler`].
pub struct CollabClient {
    slug: String,
    url: String,
    reconciler: Arc<Mutex<Reconciler<MemoryStore>>>,
    state: Arc<Mutex<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl CollabClient {
    /// `url` is the full WebSocket endpoint including the slug query,
    /// e.g. `ws://host:port/api/ws?slug=notes`.
    pub fn new(slug: impl Into<String>, url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            slug: slug.into(),
            url: url.into(),
            reconciler: Arc::new(Mutex::new(Reconciler::new(
                Uuid::new_v4(),
                MemoryStore::new(),
            ))),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn text(&self) -> String {
        self.reconciler
            .lock()
            .map(|r| r.text().to_string())
            .unwrap_or_default()
    }

    pub fn pending_len(&self) -> usize {
        self.reconciler.lock().map(|r| r.pending_len()).unwrap_or(0)
    }

    /// Connect, join, and spawn the reader/writer tasks. Pending edits
    /// from a previous connection are resent after the snapshot
    /// arrives.
    pub async fn connect(&mut self, password: Option<String>) -> Result<(), ProtocolError> {
        set_state(&self.state, ConnectionState::Connecting);

        let (ws, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| ProtocolError::Decode(format!("connect: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx.clone());

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if sink
                    .send(tokio_tungstenite::tungstenite::Message::text(text))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let join = ClientFrame::Join {
            slug: self.slug.clone(),
            client_id: Some(self.reconciler.lock().map(|r| r.client_id()).unwrap_or_else(|_| Uuid::new_v4())),
            label: None,
            color: None,
            password,
            token: None,
        };
        let _ = out_tx.send(join.encode()?).await;

        // Heartbeat: ping every HEARTBEAT_INTERVAL so the server's
        // silence timeout never fires on a healthy connection.
        let ping_tx = out_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let frame = ClientFrame::Ping {
                    ts: Some(crate::storage::now_millis()),
                };
                let encoded = match frame.encode() {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                if ping_tx.send(encoded).await.is_err() {
                    break;
                }
            }
        });

        let slug = self.slug.clone();
        let reconciler = self.reconciler.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let resend_tx = out_tx.clone();

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        debug!("client socket error on '{slug}': {e}");
                        break;
                    }
                };
                let text = match msg {
                    tokio_tungstenite::tungstenite::Message::Text(t) => t.to_string(),
                    tokio_tungstenite::tungstenite::Message::Close(_) => break,
                    _ => continue,
                };
                let frame = match ServerFrame::decode(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!("undecodable server frame: {e}");
                        continue;
                    }
                };
                if handle_server_frame(
                    frame,
                    &reconciler,
                    &state,
                    &event_tx,
                    &resend_tx,
                )
                .await
                .is_err()
                {
                    break;
                }
            }
            set_state(&state, ConnectionState::Disconnected);
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Replace the local text; diffs and ships the edit.
    pub async fn edit_text(&self, new_text: &str, cursor_after: Option<CursorState>) {
        let (frame, client_id) = {
            let mut rec = match self.reconciler.lock() {
                Ok(r) => r,
                Err(_) => return,
            };
            let ts = crate::storage::now_millis();
            let client_id = rec.client_id();
            (rec.local_edit(new_text, None, cursor_after, ts), client_id)
        };
        if let (Some(entry), Some(tx)) = (frame, &self.outgoing_tx) {
            let frame = ClientFrame::Edit {
                slug: self.slug.clone(),
                edit: entry.to_request(Some(client_id)),
            };
            if let Ok(encoded) = frame.encode() {
                let _ = tx.send(encoded).await;
            }
        }
    }

    pub async fn send_cursor(&self, cursor: CursorState) {
        if let Some(tx) = &self.outgoing_tx {
            let frame = ClientFrame::Cursor {
                slug: self.slug.clone(),
                cursor,
                op_id: None,
                ts: Some(crate::storage::now_millis()),
            };
            if let Ok(encoded) = frame.encode() {
                let _ = tx.send(encoded).await;
            }
        }
    }

    pub async fn send_ping(&self) {
        if let Some(tx) = &self.outgoing_tx {
            let frame = ClientFrame::Ping {
                ts: Some(crate::storage::now_millis()),
            };
            if let Ok(encoded) = frame.encode() {
                let _ = tx.send(encoded).await;
            }
        }
    }
}

fn set_state(state: &Arc<Mutex<ConnectionState>>, value: ConnectionState) {
    if let Ok(mut s) = state.lock() {
        *s = value;
    }
}

async fn handle_server_frame(
    frame: ServerFrame,
    reconciler: &Arc<Mutex<Reconciler<MemoryStore>>>,
    state: &Arc<Mutex<ConnectionState>>,
    event_tx: &mpsc::Sender<ClientEvent>,
    resend_tx: &mpsc::Sender<String>,
) -> Result<(), ()> {
    match frame {
        ServerFrame::Snapshot {
            slug,
            rev,
            content,
            client_id,
            ..
        } => {
            // Join handshake: adopt the assigned id, then either
            // drift-repair (established replica, nothing pending) or
            // adopt the snapshot and resend whatever is still queued.
            let resend = {
                let mut rec = reconciler.lock().map_err(|_| ())?;
                rec.adopt_client_id(client_id);
                if rec.is_synced() && rec.pending_len() == 0 {
                    let ts = crate::storage::now_millis();
                    match rec.drift_repair(rev, &content, ts) {
                        Some(repair) => vec![repair],
                        None => Vec::new(),
                    }
                } else {
                    rec.load_snapshot(rev, &content);
                    rec.resend_queue()
                }
            };
            set_state(state, ConnectionState::Connected);
            let _ = event_tx
                .send(ClientEvent::Connected { client_id, rev })
                .await;
            if !resend.is_empty() {
                info!("replaying {} pending edit(s)", resend.len());
            }
            for entry in resend {
                let frame = ClientFrame::Edit {
                    slug: slug.clone(),
                    edit: entry.to_request(Some(client_id)),
                };
                if let Ok(encoded) = frame.encode() {
                    resend_tx.send(encoded).await.map_err(|_| ())?;
                }
            }
        }
        ServerFrame::Applied {
            rev,
            ops,
            client_id,
            op_id,
            ..
        } => {
            let (acked, text) = {
                let mut rec = reconciler.lock().map_err(|_| ())?;
                let acked = rec.handle_applied(rev, &ops, client_id, op_id);
                (acked, rec.text().to_string())
            };
            if acked {
                if let Some(op_id) = op_id {
                    let _ = event_tx.send(ClientEvent::Acked { op_id, rev }).await;
                }
            } else if client_id
                != Some(reconciler.lock().map(|r| r.client_id()).map_err(|_| ())?)
            {
                let _ = event_tx
                    .send(ClientEvent::RemoteApplied { rev, text })
                    .await;
            }
        }
        ServerFrame::PresenceSnapshot { clients, .. } => {
            let _ = event_tx.send(ClientEvent::PresenceSnapshot(clients)).await;
        }
        ServerFrame::PresenceDiff {
            added,
            updated,
            removed,
            ..
        } => {
            let _ = event_tx
                .send(ClientEvent::PresenceChanged {
                    added,
                    updated,
                    removed,
                })
                .await;
        }
        ServerFrame::Pong { ts } => {
            let _ = event_tx.send(ClientEvent::Pong { ts }).await;
        }
        ServerFrame::Error { message, .. } => {
            let _ = event_tx.send(ClientEvent::ServerError { message }).await;
        }
        ServerFrame::Cursor { .. } | ServerFrame::Ime { .. } => {
            // Presence detail is carried in the diffs for now.
        }
    }
    Ok(())
}

//! JSON wire protocol for collaborative editing.
//!
//! Every frame is a JSON text message tagged by `type`:
//! ```text
//! ┌─────────────── inbound ───────────────┐  ┌────────────── outbound ──────────────┐
//! │ join  edit  cursor  ime  profile  ping │  │ snapshot  applied  presence_snapshot │
//! └────────────────────────────────────────┘  │ presence_diff  cursor  ime  pong     │
//!                                             │ error                                │
//!                                             └──────────────────────────────────────┘
//! ```
//!
//! Positions and lengths are counted in Unicode code points on both
//! sides of the wire. Unknown inbound frame types decode to
//! [`ClientFrame::Unknown`] and are ignored, so newer clients can talk
//! to older servers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single position-based text operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    /// Insert `text` at code-point offset `pos`.
    Insert { pos: u32, text: String },
    /// Delete `len` code points starting at `pos`.
    Delete { pos: u32, len: u32 },
}

impl Op {
    /// Whether the op changes nothing when applied.
    pub fn is_noop(&self) -> bool {
        match self {
            Op::Insert { text, .. } => text.is_empty(),
            Op::Delete { len, .. } => *len == 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionDirection {
    Forward,
    Backward,
}

/// Caret plus optional selection anchor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorState {
    pub position: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_direction: Option<SelectionDirection>,
}

/// Half-open code-point range `[start, end)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextRange {
    pub start: u32,
    pub end: u32,
}

/// IME composition lifecycle events shared for presence awareness.
///
/// Intermediate composition text is broadcast but never applied to the
/// document; only the client's eventual edit mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ImeEvent {
    Start { range: TextRange },
    Update { range: TextRange, text: String },
    Commit { replace_range: TextRange, text: String },
    Cancel { range: TextRange },
}

/// Last observed IME state of a client, as stored in presence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImeSnapshot {
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<TextRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ImeSnapshot {
    /// Collapse an event into the state it leaves the composition in.
    pub fn from_event(event: &ImeEvent) -> Self {
        match event {
            ImeEvent::Start { range } => Self {
                phase: "start".to_string(),
                range: Some(range.clone()),
                text: None,
            },
            ImeEvent::Update { range, text } => Self {
                phase: "update".to_string(),
                range: Some(range.clone()),
                text: Some(text.clone()),
            },
            ImeEvent::Commit { replace_range, text } => Self {
                phase: "commit".to_string(),
                range: Some(replace_range.clone()),
                text: Some(text.clone()),
            },
            ImeEvent::Cancel { range } => Self {
                phase: "cancel".to_string(),
                range: Some(range.clone()),
                text: None,
            },
        }
    }
}

/// A client edit against a declared base revision.
///
/// `op_id` is chosen by the client, unique per author for the life of
/// a connection; the server uses it for ack correlation and duplicate
/// suppression across reconnects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditRequest {
    pub base_rev: u64,
    pub ops: Vec<Op>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Uuid>,
    pub op_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_before: Option<CursorState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_after: Option<CursorState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
}

/// Awareness state of one connected client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceEntry {
    pub client_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ime: Option<ImeSnapshot>,
    pub last_seen_ms: u64,
}

/// Machine-readable error codes surfaced in `error` frames and mapped
/// onto HTTP statuses by the handlers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorised,
    BaseTooOld,
    MalformedFrame,
    StorageUnavailable,
    RateLimited,
    Backpressure,
    NotFound,
    Unavailable,
}

/// Frames sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        slug: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Edit {
        slug: String,
        edit: EditRequest,
    },
    Cursor {
        slug: String,
        cursor: CursorState,
        #[serde(skip_serializing_if = "Option::is_none")]
        op_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ts: Option<u64>,
    },
    Ime {
        slug: String,
        ime: ImeEvent,
        #[serde(skip_serializing_if = "Option::is_none")]
        op_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ts: Option<u64>,
    },
    Profile {
        slug: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        ts: Option<u64>,
    },
    /// Any frame type this server does not know. Ignored.
    #[serde(other)]
    Unknown,
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Full document state, sent once after a successful join and on
    /// demand for drift repair. Echoes the client id the server
    /// assigned to this session.
    Snapshot {
        slug: String,
        rev: u64,
        content: String,
        client_id: Uuid,
        presence: Vec<PresenceEntry>,
    },
    /// A committed edit. Sent to every subscriber including the
    /// author; for the author it doubles as the ack (`op_id` matches).
    Applied {
        slug: String,
        rev: u64,
        ops: Vec<Op>,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        op_id: Option<Uuid>,
        ts: u64,
    },
    PresenceSnapshot {
        slug: String,
        clients: Vec<PresenceEntry>,
    },
    PresenceDiff {
        slug: String,
        added: Vec<PresenceEntry>,
        updated: Vec<PresenceEntry>,
        removed: Vec<Uuid>,
    },
    Cursor {
        slug: String,
        client_id: Uuid,
        cursor: CursorState,
        #[serde(skip_serializing_if = "Option::is_none")]
        op_id: Option<Uuid>,
        ts: u64,
    },
    Ime {
        slug: String,
        client_id: Uuid,
        ime: ImeEvent,
        #[serde(skip_serializing_if = "Option::is_none")]
        op_id: Option<Uuid>,
        ts: u64,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        ts: Option<u64>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ClientFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "frame encode error: {e}"),
            Self::Decode(e) => write!(f, "frame decode error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_frame_roundtrip() {
        let frame = ClientFrame::Edit {
            slug: "notes/today".to_string(),
            edit: EditRequest {
                base_rev: 7,
                ops: vec![
                    Op::Insert {
                        pos: 3,
                        text: "hi".to_string(),
                    },
                    Op::Delete { pos: 9, len: 2 },
                ],
                client_id: Some(Uuid::new_v4()),
                op_id: Uuid::new_v4(),
                cursor_before: None,
                cursor_after: Some(CursorState {
                    position: 5,
                    anchor: None,
                    selection_direction: None,
                }),
                ts: Some(1234),
            },
        };
        let encoded = frame.encode().unwrap();
        let decoded = ClientFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_unknown_inbound_type_is_ignored_not_fatal() {
        let decoded =
            ClientFrame::decode(r#"{"type":"hologram","payload":{"x":1}}"#).unwrap();
        assert_eq!(decoded, ClientFrame::Unknown);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(ClientFrame::decode("{not json").is_err());
    }

    #[test]
    fn test_op_tagging_matches_wire_shape() {
        let op = Op::Insert {
            pos: 1,
            text: "X".to_string(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "insert");
        assert_eq!(json["pos"], 1);

        let op: Op = serde_json::from_str(r#"{"type":"delete","pos":4,"len":2}"#).unwrap();
        assert_eq!(op, Op::Delete { pos: 4, len: 2 });
    }

    #[test]
    fn test_ime_event_phases() {
        let commit: ImeEvent = serde_json::from_str(
            r#"{"phase":"commit","replace_range":{"start":2,"end":5},"text":"猫"}"#,
        )
        .unwrap();
        let snap = ImeSnapshot::from_event(&commit);
        assert_eq!(snap.phase, "commit");
        assert_eq!(snap.text.as_deref(), Some("猫"));
        assert_eq!(snap.range, Some(TextRange { start: 2, end: 5 }));
    }

    #[test]
    fn test_server_frame_applied_roundtrip() {
        let frame = ServerFrame::Applied {
            slug: "a/b".to_string(),
            rev: 42,
            ops: vec![Op::Delete { pos: 0, len: 1 }],
            client_id: Some(Uuid::new_v4()),
            op_id: Some(Uuid::new_v4()),
            ts: 99,
        };
        let decoded = ServerFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_error_code_wire_names() {
        let json = serde_json::to_string(&ErrorCode::BaseTooOld).unwrap();
        assert_eq!(json, r#""base_too_old""#);
        let json = serde_json::to_string(&ErrorCode::StorageUnavailable).unwrap();
        assert_eq!(json, r#""storage_unavailable""#);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let frame = ServerFrame::Pong { ts: None };
        assert_eq!(frame.encode().unwrap(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_noop_detection() {
        assert!(Op::Insert {
            pos: 0,
            text: String::new()
        }
        .is_noop());
        assert!(Op::Delete { pos: 3, len: 0 }.is_noop());
        assert!(!Op::Delete { pos: 3, len: 1 }.is_noop());
    }
}

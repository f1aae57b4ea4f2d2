//! # inkpad-collab — real-time collaborative Markdown engine
//!
//! Multiple clients edit a shared document identified by a
//! hierarchical slug. Edits are position-based insert/delete
//! operations against a declared base revision; the server transforms
//! them against everything applied since, commits them in a per-slug
//! total order, makes them durable, and fans the result out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON frames    ┌──────────────┐
//! │ CollabClient│ ◄──────────────► │  axum /api   │
//! │ (reconciler)│    WebSocket     │  ws + http   │
//! └──────┬──────┘                  └──────┬───────┘
//!        │                                │ mailbox per slug
//!        ▼                                ▼
//! ┌─────────────┐                  ┌──────────────┐
//! │ pending     │                  │  DocActor    │
//! │ queue       │                  │  Document+OT │
//! └─────────────┘                  └──────┬───────┘
//!                                         │
//!                              ┌──────────┼──────────┐
//!                              ▼          ▼          ▼
//!                         snapshot.v1   wal.v1    meta.v1
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire frames and shared types
//! - [`text`] — code-point text buffer and minimal diff
//! - [`ot`] — operational transform engine
//! - [`document`] — per-slug authoritative state machine
//! - [`presence`] — cursor/IME/profile awareness with idle eviction
//! - [`storage`] — vault layout, crc32c WAL, snapshots, compaction
//! - [`hub`] — one actor per document, bounded fan-out
//! - [`server`] — axum HTTP + WebSocket surface
//! - [`client`] — reconciler and WebSocket client
//! - [`auth`] — Basic credentials and salted password hashes

pub mod auth;
pub mod client;
pub mod config;
pub mod document;
pub mod hub;
pub mod ot;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod text;

pub use client::{ClientEvent, CollabClient, ConnectionState, PendingStore, Reconciler};
pub use config::Config;
pub use document::{AppliedOp, ApplyResult, DocStatus, Document, RejectReason};
pub use hub::{DocCommand, Hub, HubError};
pub use presence::PresenceRegistry;
pub use protocol::{
    ClientFrame, CursorState, EditRequest, ErrorCode, ImeEvent, Op, PresenceEntry, ServerFrame,
};
pub use server::build_router;
pub use storage::{DocumentStore, StoreConfig, StoreError};
pub use text::{diff_ops, TextBuffer};

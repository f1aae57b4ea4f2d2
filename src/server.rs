//! HTTP and WebSocket surface.
//!
//! Routes:
//! ```text
//! GET  /api/snapshot   document text + rev (Basic auth when locked)
//! POST /api/password   set / change / clear the document password
//! GET  /api/health     liveness probe
//! GET  /api/ws         collaborative editing socket
//! ```
//!
//! The socket speaks the JSON frames in `protocol`. One writer task
//! per connection drains the session's bounded queue; the read loop
//! parses frames into hub commands. Malformed JSON closes the socket
//! with 1007; a session whose queue overflowed is closed with 1013
//! ("try again later"). Silence beyond the configured client timeout
//! closes the transport.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use crate::auth;
use crate::hub::{DocCommand, Hub, HubError, SessionMsg, CLOSE_TRY_AGAIN};
use crate::protocol::{ClientFrame, ErrorCode, ServerFrame};

const CLOSE_MALFORMED: u16 = 1007;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
}

/// Build the router. Kept separate from `serve` so tests can drive it
/// directly.
pub fn build_router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/api/snapshot", get(get_snapshot))
        .route("/api/password", post(update_password))
        .route("/api/health", get(health))
        .route("/api/ws", get(ws_handler))
        .with_state(AppState { hub })
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct SnapshotQuery {
    slug: String,
    password: Option<String>,
}

#[derive(Debug, Serialize)]
struct SnapshotResp {
    slug: String,
    rev: u64,
    content: String,
}

async fn get_snapshot(
    State(state): State<AppState>,
    Query(q): Query<SnapshotQuery>,
    headers: HeaderMap,
) -> Response {
    let provided = q
        .password
        .or_else(|| password_from_headers(&headers, &q.slug));
    match state.hub.snapshot(&q.slug, provided).await {
        Ok(Ok(info)) => (
            [(header::CACHE_CONTROL, "no-store")],
            Json(SnapshotResp {
                slug: q.slug,
                rev: info.rev,
                content: info.content,
            }),
        )
            .into_response(),
        Ok(Err(_)) => (StatusCode::UNAUTHORIZED, "unauthorized").into_response(),
        Err(e) => hub_error_response(&q.slug, e),
    }
}

#[derive(Debug, Deserialize)]
struct PasswordUpdateReq {
    slug: String,
    current_password: Option<String>,
    new_password: Option<String>,
}

async fn update_password(
    State(state): State<AppState>,
    Json(req): Json<PasswordUpdateReq>,
) -> Response {
    match state
        .hub
        .set_password(&req.slug, req.current_password, req.new_password)
        .await
    {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(ErrorCode::Unauthorised)) => {
            (StatusCode::UNAUTHORIZED, "invalid current password").into_response()
        }
        Ok(Err(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable").into_response()
        }
        Err(e) => hub_error_response(&req.slug, e),
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    slug: String,
    token: Option<String>,
    password: Option<String>,
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let config = state.hub.config().clone();
    if !config.app_env_dev && !config.allowed_origins.is_empty() {
        let origin = headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !config
            .allowed_origins
            .iter()
            .any(|allowed| origin.starts_with(allowed))
        {
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    let WsQuery {
        slug,
        token,
        password,
    } = q;
    let mut provided = password;
    if provided.is_none() {
        provided = password_from_headers(&headers, &slug);
    }
    if provided.is_none() {
        provided = token
            .as_deref()
            .and_then(|t| auth::password_from_token(t, &slug));
    }

    // Authenticate before the upgrade; the join frame re-checks since
    // the password may also arrive in-frame.
    match state.hub.check_auth(&slug, provided.clone()).await {
        Ok(true) => {}
        Ok(false) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(e) => return hub_error_response(&slug, e),
    }

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(hub, slug, provided, socket))
}

async fn handle_socket(
    hub: Arc<Hub>,
    slug: String,
    upgrade_password: Option<String>,
    socket: WebSocket,
) {
    let config = hub.config().clone();
    let (mut sink, mut stream) = socket.split();

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<SessionMsg>(config.session_queue_frames);

    // Single socket writer: drains the session queue. A dropped
    // sender without an explicit close means the document actor cut
    // us off for falling behind.
    let mut writer = tokio::spawn(async move {
        loop {
            match outbound_rx.recv().await {
                Some(SessionMsg::Frame(frame)) => {
                    if sink.send(Message::Text(frame.as_str().into())).await.is_err() {
                        break;
                    }
                }
                Some(SessionMsg::Close { code, reason }) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                None => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_TRY_AGAIN,
                            reason: "try again later".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let client_timeout = Duration::from_secs(config.client_timeout_secs.max(1));
    let mut client_id: Option<Uuid> = None;
    // Set when we enqueued an explicit close frame that must flush
    // before the writer goes away.
    let mut close_requested = false;

    loop {
        let msg = match timeout(client_timeout, stream.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!("socket error on '{slug}': {e}");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!("client on '{slug}' timed out after {client_timeout:?}");
                break;
            }
        };

        let text = match msg {
            Message::Text(t) => t,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
            Message::Binary(_) => continue,
        };

        let frame = match ClientFrame::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("malformed frame on '{slug}': {e}");
                let _ = outbound_tx
                    .send(SessionMsg::Close {
                        code: CLOSE_MALFORMED,
                        reason: "malformed frame".to_string(),
                    })
                    .await;
                close_requested = true;
                break;
            }
        };

        match frame {
            ClientFrame::Join {
                slug: join_slug,
                client_id: proposed,
                label,
                color,
                password,
                token,
            } => {
                if client_id.is_some() {
                    continue; // Already joined.
                }
                if join_slug != slug {
                    warn!("join slug mismatch: expected '{slug}', got '{join_slug}'");
                    continue;
                }
                let mut join_password = password;
                if join_password.is_none() {
                    join_password = token
                        .as_deref()
                        .and_then(|t| auth::password_from_token(t, &slug));
                }
                if join_password.is_none() {
                    join_password = upgrade_password.clone();
                }

                let (respond, done) = oneshot::channel();
                let sent = hub
                    .send(
                        &slug,
                        DocCommand::Join {
                            proposed_id: proposed,
                            label,
                            color,
                            password: join_password,
                            outbound: outbound_tx.clone(),
                            respond,
                        },
                    )
                    .await;
                if sent.is_err() {
                    break;
                }
                match done.await {
                    Ok(Ok(ok)) => {
                        client_id = Some(ok.client_id);
                    }
                    Ok(Err(code)) => {
                        let _ = send_error(&outbound_tx, code, "join refused").await;
                        let _ = outbound_tx
                            .send(SessionMsg::Close {
                                code: 1000,
                                reason: "join refused".to_string(),
                            })
                            .await;
                        close_requested = true;
                        break;
                    }
                    Err(_) => break,
                }
            }
            ClientFrame::Edit { edit, .. } => {
                let Some(client_id) = client_id else { continue };
                if hub
                    .send(&slug, DocCommand::Edit { client_id, edit })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            ClientFrame::Cursor { cursor, op_id, ts, .. } => {
                let Some(client_id) = client_id else { continue };
                if hub
                    .send(
                        &slug,
                        DocCommand::Cursor {
                            client_id,
                            cursor,
                            op_id,
                            ts,
                        },
                    )
                    .await
                    .is_err()
                {
                    break;
                }
            }
            ClientFrame::Ime { ime, op_id, ts, .. } => {
                let Some(client_id) = client_id else { continue };
                if hub
                    .send(
                        &slug,
                        DocCommand::Ime {
                            client_id,
                            ime,
                            op_id,
                            ts,
                        },
                    )
                    .await
                    .is_err()
                {
                    break;
                }
            }
            ClientFrame::Profile { label, color, .. } => {
                let Some(client_id) = client_id else { continue };
                if hub
                    .send(
                        &slug,
                        DocCommand::Profile {
                            client_id,
                            label,
                            color,
                        },
                    )
                    .await
                    .is_err()
                {
                    break;
                }
            }
            ClientFrame::Ping { ts } => {
                // Pong straight from the session queue; the actor only
                // sees the liveness bump.
                if let Ok(encoded) = (ServerFrame::Pong { ts }).encode() {
                    let _ = outbound_tx
                        .try_send(SessionMsg::Frame(Arc::new(encoded)));
                }
                if let Some(client_id) = client_id {
                    let _ = hub.send(&slug, DocCommand::Touch { client_id }).await;
                }
            }
            ClientFrame::Unknown => {
                debug!("ignoring unknown frame type on '{slug}'");
            }
        }
    }

    if let Some(client_id) = client_id {
        if let Err(e) = hub.send(&slug, DocCommand::Leave { client_id }).await {
            debug!("leave for {client_id} on '{slug}' failed: {e}");
        }
    }
    if close_requested {
        // Give the writer a moment to flush the close frame.
        if timeout(Duration::from_secs(1), &mut writer).await.is_err() {
            writer.abort();
        }
    } else {
        writer.abort();
    }
}

async fn send_error(
    outbound: &mpsc::Sender<SessionMsg>,
    code: ErrorCode,
    message: &str,
) -> Result<(), ()> {
    let encoded = ServerFrame::error(code, message).encode().map_err(|_| ())?;
    outbound
        .send(SessionMsg::Frame(Arc::new(encoded)))
        .await
        .map_err(|_| ())
}

fn password_from_headers(headers: &HeaderMap, slug: &str) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| auth::password_from_authorization(v, slug))
}

fn hub_error_response(slug: &str, e: HubError) -> Response {
    match e {
        HubError::InvalidSlug(_) => {
            (StatusCode::BAD_REQUEST, "invalid slug").into_response()
        }
        HubError::Unavailable(reason) => {
            error!("document '{slug}' unavailable: {reason}");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response()
        }
        HubError::Gone => {
            error!("document actor for '{slug}' went away");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response()
        }
    }
}

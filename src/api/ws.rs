//! WebSocket connections and the flat messages endpoint.
//!
//! A single `tokio::select!` loop over inbound frames and a broadcast-style
//! receiver, split sender/receiver halves, a periodic ping. This hub carries
//! arbitrary JSON records rather than terminal byte streams, but the
//! connection lifecycle follows the same shape as other streaming consoles
//! in this codebase.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::access::{self, AccessCheck};
use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::errors::AuthError;
use crate::identity;
use crate::messaging::{self, MessageRecord, Outbound};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// `GET .../sessions/:id/ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, session_id)): Path<(String, String)>,
    Query(query): Query<WsQuery>,
) -> Result<Response, ApiError> {
    authorize_connection(&state, &headers, query.token.as_deref(), &tenant, &session_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, session_id)))
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    token: Option<String>,
    #[serde(default)]
    include_partial_messages: bool,
}

/// `GET .../sessions/:id/messages`
pub async fn get_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, session_id)): Path<(String, String)>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<MessageRecord>>, ApiError> {
    authorize_connection(&state, &headers, query.token.as_deref(), &tenant, &session_id).await?;
    let records = messaging::replay(&state.config.state_root, &session_id, query.include_partial_messages)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(records))
}

/// `POST .../sessions/:id/messages`: broadcast an arbitrary JSON body to the
/// session's connected clients (and the worker, if it is one of them).
pub async fn post_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, session_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    authorize_connection(&state, &headers, None, &tenant, &session_id).await?;
    let kind = body
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("message")
        .to_owned();
    state.hub.broadcast(session_id, kind, body, None);
    Ok(StatusCode::ACCEPTED)
}

/// A connection (websocket or messages call) is accepted only when the
/// caller presents either a forwarded user identity, or a per-session
/// subject token whose subject encodes `<tenant>:<session-subject-name>` —
/// the worker's own service account for this exact session, recognized from
/// the standard `system:serviceaccount:<namespace>:<name>` username a
/// self-subject review reports.
async fn authorize_connection(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
    tenant: &str,
    session_id: &str,
) -> Result<(), ApiError> {
    let forwarded = identity::extract_forwarded_identity(headers);
    let token = identity::extract_caller_token(headers, query_token, true)?;
    let client = state.substrate.per_request_client(&token)?;

    if forwarded.user.is_some() {
        access::require(&client, tenant, AccessCheck::LIST_SESSIONS).await?;
        return Ok(());
    }

    let subject = access::whoami(&client).await?;
    let expected_name = crate::crd::subject_name(session_id);
    let encoded = subject
        .strip_prefix("system:serviceaccount:")
        .unwrap_or(&subject);

    match messaging::parse_worker_subject(encoded) {
        Some((subject_tenant, subject_name)) if subject_tenant == tenant && subject_name == expected_name => Ok(()),
        _ => Err(AuthError::AccessDenied {
            verb: "connect".to_owned(),
            resource: "messages".to_owned(),
            tenant: tenant.to_owned(),
        }
        .into()),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String) {
    let connection_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    state.hub.register(session_id.clone(), connection_id, tx);
    let mut ping_interval = tokio::time::interval(Duration::from_secs(state.config.hub_ping_interval_secs));
    ping_interval.tick().await;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(Outbound::Record(record)) => {
                        let payload = match serde_json::to_string(&record) {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::warn!(session = %session_id, error = %e, "failed to serialize outbound message record");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Pong { timestamp }) => {
                        let payload = serde_json::json!({ "type": "pong", "timestamp": timestamp }).to_string();
                        if sender.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Value>(&text) {
                            Ok(value) => {
                                let kind = value
                                    .get("type")
                                    .and_then(Value::as_str)
                                    .unwrap_or("message")
                                    .to_owned();
                                // A JSON-level ping is answered directly to the
                                // sender, not broadcast to the rest of the
                                // session (unlike every other message kind).
                                if kind == "ping" {
                                    let pong = serde_json::json!({ "type": "pong", "timestamp": chrono::Utc::now().timestamp() }).to_string();
                                    if sender.send(Message::Text(pong.into())).await.is_err() {
                                        break;
                                    }
                                } else {
                                    state.hub.broadcast(session_id.clone(), kind, value, None);
                                }
                            }
                            Err(e) => {
                                tracing::debug!(session = %session_id, error = %e, "dropped unparseable inbound websocket frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(e)) => {
                        tracing::debug!(session = %session_id, error = %e, "websocket error");
                        break;
                    }
                }
            }
        }
    }

    state.hub.unregister(session_id, connection_id);
}

//! Session messaging hub and append-only persistence.
//!
//! A single in-process hub multiplexes bidirectional messages between
//! interactive clients and a session's worker. Internally it mirrors the
//! classic register/unregister/broadcast hub shape: three channels feeding a
//! single cooperative dispatcher, so broadcast order is exactly dispatch
//! order and persistence never reorders relative to delivery. Per-connection
//! writes are serialized by a per-connection mutex, since both the forwarder
//! task and the periodic pinger may write to the same socket.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, mpsc};
use uuid::Uuid;

/// A partial (fragmented) message's framing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartialFrame {
    /// Identifier shared by all fragments of the same logical message.
    pub id: String,
    /// This fragment's index within the total.
    pub index: u32,
    /// Total number of fragments expected.
    pub total: u32,
    /// This fragment's data (cumulative or incremental is worker-defined;
    /// the hub treats it as opaque and simply keeps the latest fragment).
    pub data: String,
}

/// One record in a session's append-only message log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// The session this message belongs to.
    pub session_id: String,
    /// Message type; `"message.partial"` is handled specially on replay.
    #[serde(rename = "type")]
    pub kind: String,
    /// When the hub's dispatcher accepted this message for broadcast.
    pub timestamp: DateTime<Utc>,
    /// Opaque message body.
    pub payload: serde_json::Value,
    /// Present only for `kind == "message.partial"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialFrame>,
}

impl MessageRecord {
    const PARTIAL_KIND: &'static str = "message.partial";

    fn is_partial(&self) -> bool {
        self.kind == Self::PARTIAL_KIND && self.partial.is_some()
    }
}

/// A control-plane or relayed message delivered to a single connection.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A JSON-serializable application message.
    Record(MessageRecord),
    /// A bare ping/pong control frame.
    Pong { timestamp: i64 },
}

type ConnectionId = Uuid;

enum HubEvent {
    Register {
        session_id: String,
        connection_id: ConnectionId,
        sender: mpsc::UnboundedSender<Outbound>,
    },
    Unregister {
        session_id: String,
        connection_id: ConnectionId,
    },
    Broadcast {
        session_id: String,
        kind: String,
        payload: serde_json::Value,
        partial: Option<PartialFrame>,
    },
}

/// The messaging hub: one per process, shared across all tenants and sessions.
pub struct Hub {
    events_tx: mpsc::UnboundedSender<HubEvent>,
    sessions: Arc<RwLock<HashMap<String, HashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>>>>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub").finish_non_exhaustive()
    }
}

impl Hub {
    /// Construct a hub and spawn its dispatcher and persister tasks.
    ///
    /// `state_root` is the directory under which `sessions/<id>/messages.jsonl`
    /// is appended to, mirroring the worker's own view of persisted state.
    #[must_use]
    pub fn new(state_root: PathBuf) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let sessions = Arc::new(RwLock::new(HashMap::new()));

        tokio::spawn(dispatch_loop(events_rx, Arc::clone(&sessions), persist_tx));
        tokio::spawn(persist_loop(persist_rx, state_root));

        Arc::new(Self { events_tx, sessions })
    }

    /// Register a connection's outbound sender under `session_id`. Hub
    /// channels are unbounded by design: backpressure must never silently
    /// drop a message, so registration and broadcast never block or
    /// discard.
    pub fn register(&self, session_id: String, connection_id: ConnectionId, sender: mpsc::UnboundedSender<Outbound>) {
        let _ = self.events_tx.send(HubEvent::Register {
            session_id,
            connection_id,
            sender,
        });
    }

    /// Remove a connection. Idempotent; unregistering an already-removed
    /// connection is a no-op.
    pub fn unregister(&self, session_id: String, connection_id: ConnectionId) {
        let _ = self.events_tx.send(HubEvent::Unregister {
            session_id,
            connection_id,
        });
    }

    /// Broadcast a message to every connection registered for `session_id`,
    /// and hand it to the persister. Returns immediately; ordering is
    /// established by dispatcher acceptance, not by caller arrival.
    pub fn broadcast(&self, session_id: String, kind: String, payload: serde_json::Value, partial: Option<PartialFrame>) {
        let _ = self.events_tx.send(HubEvent::Broadcast {
            session_id,
            kind,
            payload,
            partial,
        });
    }

    /// Number of live connections for a session, for diagnostics only.
    pub async fn connection_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map_or(0, HashMap::len)
    }
}

async fn dispatch_loop(
    mut events_rx: mpsc::UnboundedReceiver<HubEvent>,
    sessions: Arc<RwLock<HashMap<String, HashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>>>>,
    persist_tx: mpsc::UnboundedSender<MessageRecord>,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            HubEvent::Register {
                session_id,
                connection_id,
                sender,
            } => {
                sessions
                    .write()
                    .await
                    .entry(session_id)
                    .or_default()
                    .insert(connection_id, sender);
            }
            HubEvent::Unregister {
                session_id,
                connection_id,
            } => {
                let mut guard = sessions.write().await;
                if let Some(conns) = guard.get_mut(&session_id) {
                    conns.remove(&connection_id);
                    if conns.is_empty() {
                        guard.remove(&session_id);
                    }
                }
            }
            HubEvent::Broadcast {
                session_id,
                kind,
                payload,
                partial,
            } => {
                let record = MessageRecord {
                    session_id: session_id.clone(),
                    kind,
                    timestamp: Utc::now(),
                    payload,
                    partial,
                };

                // Persistence is handed off to a detached task so a slow
                // disk never blocks delivery; the single persister task
                // still drains its queue strictly in arrival order, so
                // persisted order matches broadcast-acceptance order.
                let _ = persist_tx.send(record.clone());

                let guard = sessions.read().await;
                if let Some(conns) = guard.get(&session_id) {
                    for sender in conns.values() {
                        let _ = sender.send(Outbound::Record(record.clone()));
                    }
                }
            }
        }
    }
}

async fn persist_loop(mut rx: mpsc::UnboundedReceiver<MessageRecord>, state_root: PathBuf) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = append_record(&state_root, &record).await {
            tracing::warn!(
                session = %record.session_id,
                error = %e,
                "failed to persist message record; message was still delivered live"
            );
        }
    }
}

/// Path to a session's message log.
#[must_use]
pub fn log_path(state_root: &Path, session_id: &str) -> PathBuf {
    state_root.join("sessions").join(session_id).join("messages.jsonl")
}

async fn append_record(state_root: &Path, record: &MessageRecord) -> anyhow::Result<()> {
    let path = log_path(state_root, &record.session_id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(record)?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Replay a session's persisted message log.
///
/// When `include_partial` is `false`, every `message.partial` record is
/// dropped entirely (not coalesced, simply absent). When `true`, consecutive
/// partial fragments sharing an `id` collapse to the most recently seen
/// fragment; any non-partial record closes whatever partial was active.
///
/// # Errors
///
/// Returns an error if the log file exists but cannot be read, or if a line
/// fails to parse as a [`MessageRecord`]. A missing log file replays as an
/// empty sequence (a session that has not yet emitted anything).
pub async fn replay(state_root: &Path, session_id: &str, include_partial: bool) -> anyhow::Result<Vec<MessageRecord>> {
    let path = log_path(state_root, session_id);
    let contents = match tokio::fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str::<MessageRecord>(line)?);
    }

    Ok(coalesce(records, include_partial))
}

/// Pure coalescing logic, split out from [`replay`] so it is testable
/// without touching the filesystem.
#[must_use]
pub fn coalesce(records: Vec<MessageRecord>, include_partial: bool) -> Vec<MessageRecord> {
    let mut out = Vec::with_capacity(records.len());

    if !include_partial {
        out.extend(records.into_iter().filter(|r| !r.is_partial()));
        return out;
    }

    let mut pending: Option<MessageRecord> = None;
    for record in records {
        if record.is_partial() {
            let same_id = pending
                .as_ref()
                .and_then(|p| p.partial.as_ref())
                .is_some_and(|p| p.id == record.partial.as_ref().expect("checked by is_partial").id);
            if !same_id {
                if let Some(flushed) = pending.take() {
                    out.push(flushed);
                }
            }
            pending = Some(record);
        } else {
            if let Some(flushed) = pending.take() {
                out.push(flushed);
            }
            out.push(record);
        }
    }
    if let Some(flushed) = pending.take() {
        out.push(flushed);
    }

    out
}

/// Subject-name encoding accepted from a per-session worker token:
/// `<tenant>:<session-subject-name>`.
#[must_use]
pub fn parse_worker_subject(subject: &str) -> Option<(&str, &str)> {
    subject.split_once(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: &str, partial: Option<PartialFrame>, payload: serde_json::Value) -> MessageRecord {
        MessageRecord {
            session_id: "s1".to_owned(),
            kind: kind.to_owned(),
            timestamp: Utc::now(),
            payload,
            partial,
        }
    }

    fn partial_frame(id: &str, index: u32, total: u32, data: &str) -> PartialFrame {
        PartialFrame {
            id: id.to_owned(),
            index,
            total,
            data: data.to_owned(),
        }
    }

    #[test]
    fn coalesces_consecutive_partials_with_same_id() {
        let records = vec![
            record("message.partial", Some(partial_frame("A", 0, 3, "x")), serde_json::Value::Null),
            record("message.partial", Some(partial_frame("A", 1, 3, "xy")), serde_json::Value::Null),
            record("message.partial", Some(partial_frame("A", 2, 3, "xyz")), serde_json::Value::Null),
            record("result", None, serde_json::json!({"ok": true})),
        ];

        let out = coalesce(records, true);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].partial.as_ref().unwrap().data, "xyz");
        assert_eq!(out[1].kind, "result");
    }

    #[test]
    fn excluding_partials_drops_them_entirely() {
        let records = vec![
            record("message.partial", Some(partial_frame("A", 0, 3, "x")), serde_json::Value::Null),
            record("message.partial", Some(partial_frame("A", 1, 3, "xy")), serde_json::Value::Null),
            record("result", None, serde_json::json!({"ok": true})),
        ];

        let out = coalesce(records, false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, "result");
    }

    #[test]
    fn non_partial_closes_active_partial_even_without_a_trailing_one() {
        let records = vec![
            record("message.partial", Some(partial_frame("A", 0, 1, "x")), serde_json::Value::Null),
            record("status", None, serde_json::json!({"phase": "Running"})),
        ];
        let out = coalesce(records, true);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, "message.partial");
        assert_eq!(out[1].kind, "status");
    }

    #[test]
    fn different_partial_id_flushes_the_previous_one() {
        let records = vec![
            record("message.partial", Some(partial_frame("A", 0, 1, "a-data")), serde_json::Value::Null),
            record("message.partial", Some(partial_frame("B", 0, 1, "b-data")), serde_json::Value::Null),
        ];
        let out = coalesce(records, true);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].partial.as_ref().unwrap().id, "A");
        assert_eq!(out[1].partial.as_ref().unwrap().id, "B");
    }

    #[tokio::test]
    async fn replay_round_trips_through_persisted_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let record = record("status", None, serde_json::json!({"phase": "Running"}));
        append_record(dir.path(), &record).await.expect("append");

        let replayed = replay(dir.path(), "s1", true).await.expect("replay");
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].payload, record.payload);
    }

    #[tokio::test]
    async fn replay_of_missing_log_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let replayed = replay(dir.path(), "does-not-exist", true).await.expect("replay");
        assert!(replayed.is_empty());
    }

    #[test]
    fn worker_subject_parses_tenant_and_name() {
        let (tenant, name) = parse_worker_subject("team-a:sess-1-session-sa").expect("parses");
        assert_eq!(tenant, "team-a");
        assert_eq!(name, "sess-1-session-sa");
    }

    #[tokio::test]
    async fn hub_delivers_broadcast_to_registered_connection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let hub = Hub::new(dir.path().to_path_buf());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn_id = Uuid::new_v4();
        hub.register("s1".to_owned(), conn_id, tx);

        // give the dispatcher a tick to process the registration
        tokio::task::yield_now().await;
        hub.broadcast("s1".to_owned(), "status".to_owned(), serde_json::json!({"ok": true}), None);

        let received = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("did not time out")
            .expect("channel open");
        match received {
            Outbound::Record(r) => assert_eq!(r.kind, "status"),
            Outbound::Pong { .. } => panic!("expected a record"),
        }
    }
}

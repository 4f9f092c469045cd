//! Per-case change notifications.
//!
//! The [`Broadcaster`] owns the registry `case → connection → sink`. It is built once at
//! startup, shared behind an `Arc`, and cleared with [`Broadcaster::shutdown`]. Delivery
//! never waits on a client: a sink that cannot take a frame right now is treated as dead
//! and dropped once the delivery pass is over.
//!
//! Wire format is server-sent events: `event: <type>\ndata: <json>\n\n`, with
//! `: heartbeat\n\n` comment frames keeping idle streams open.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{LibError, Result};
use crate::models::{CaseId, ConnectionId, UserId};

pub const HEARTBEAT_FRAME: &str = ": heartbeat\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseEventType {
    CaseUpdated,
    CommentCreated,
    CommentUpdated,
    CommentDeleted,
    ElementCreated,
    ElementUpdated,
    ElementDeleted,
    ElementAttached,
    ElementDetached,
    PermissionChanged,
    LockAcquired,
    LockReleased,
}

pub const ALL_CASE_EVENT_TYPES: &[CaseEventType] = &[
    CaseEventType::CaseUpdated,
    CaseEventType::CommentCreated,
    CaseEventType::CommentUpdated,
    CaseEventType::CommentDeleted,
    CaseEventType::ElementCreated,
    CaseEventType::ElementUpdated,
    CaseEventType::ElementDeleted,
    CaseEventType::ElementAttached,
    CaseEventType::ElementDetached,
    CaseEventType::PermissionChanged,
    CaseEventType::LockAcquired,
    CaseEventType::LockReleased,
];

impl CaseEventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            CaseEventType::CaseUpdated => "case_updated",
            CaseEventType::CommentCreated => "comment_created",
            CaseEventType::CommentUpdated => "comment_updated",
            CaseEventType::CommentDeleted => "comment_deleted",
            CaseEventType::ElementCreated => "element_created",
            CaseEventType::ElementUpdated => "element_updated",
            CaseEventType::ElementDeleted => "element_deleted",
            CaseEventType::ElementAttached => "element_attached",
            CaseEventType::ElementDetached => "element_detached",
            CaseEventType::PermissionChanged => "permission_changed",
            CaseEventType::LockAcquired => "lock_acquired",
            CaseEventType::LockReleased => "lock_released",
        }
    }
}

impl fmt::Display for CaseEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseEventType {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        ALL_CASE_EVENT_TYPES
            .iter()
            .copied()
            .find(|event_type| event_type.as_str() == value)
            .ok_or_else(|| format!("unknown case event type '{value}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseEvent {
    #[serde(rename = "type")]
    pub event_type: CaseEventType,
    pub case_id: CaseId,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl CaseEvent {
    pub fn new(
        event_type: CaseEventType,
        case_id: CaseId,
        payload: Value,
        user_id: Option<UserId>,
    ) -> Self {
        Self {
            event_type,
            case_id,
            payload,
            timestamp: Utc::now(),
            user_id,
        }
    }
}

pub fn encode_event_frame(event: &CaseEvent) -> Result<Bytes> {
    let data = serde_json::to_string(event).map_err(|err| {
        LibError::unknown("Failed to encode case event", anyhow!(err))
    })?;
    Ok(Bytes::from(format!(
        "event: {}\ndata: {}\n\n",
        event.event_type.as_str(),
        data
    )))
}

/// One decoded server-sent-events block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Event { event: String, data: String },
    Comment(String),
}

/// Incremental decoder for the push stream. Chunks may split frames (or UTF-8
/// sequences) anywhere.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));
        let mut frames = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|pair| pair == b"\n\n") {
            let block = self.buffer.drain(..end + 2).collect::<Vec<_>>();
            if let Some(frame) = parse_block(&String::from_utf8_lossy(&block[..end])) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    let mut comment = None;
    for line in block.lines() {
        if let Some(text) = line.strip_prefix(':') {
            comment.get_or_insert_with(|| text.trim().to_string());
        } else if let Some(value) = field_value(line, "event") {
            event = Some(value.to_string());
        } else if let Some(value) = field_value(line, "data") {
            data.push(value);
        }
    }

    if event.is_some() || !data.is_empty() {
        Some(SseFrame::Event {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: data.join("\n"),
        })
    } else {
        comment.map(SseFrame::Comment)
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Per-connection stream limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Frames a connection may have queued before it is considered dead.
    pub buffer: usize,
    /// Server-side cap on one stream's lifetime; clients reconnect afterwards.
    pub max_lifetime: Option<Duration>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            buffer: 64,
            max_lifetime: Some(Duration::from_secs(30 * 60)),
        }
    }
}

#[derive(Debug)]
struct Connection {
    sink: mpsc::Sender<Bytes>,
    user_id: UserId,
    created_at: DateTime<Utc>,
}

type Registry = HashMap<CaseId, HashMap<ConnectionId, Connection>>;

#[derive(Debug, Default)]
pub struct Broadcaster {
    registry: Mutex<Registry>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_connection(
        &self,
        case_id: CaseId,
        user_id: UserId,
        sink: mpsc::Sender<Bytes>,
    ) -> ConnectionId {
        let connection_id = ConnectionId::new_v4();
        self.registry().entry(case_id).or_default().insert(
            connection_id,
            Connection {
                sink,
                user_id,
                created_at: Utc::now(),
            },
        );
        tracing::info!(%case_id, %connection_id, %user_id, "push connection opened");
        connection_id
    }

    /// Drops one connection; the case entry goes with its last connection.
    pub fn remove_connection(&self, case_id: CaseId, connection_id: ConnectionId) -> bool {
        let mut registry = self.registry();
        let Some(connections) = registry.get_mut(&case_id) else {
            return false;
        };
        let removed = connections.remove(&connection_id).is_some();
        if connections.is_empty() {
            registry.remove(&case_id);
        }
        if removed {
            tracing::info!(%case_id, %connection_id, "push connection closed");
        }
        removed
    }

    /// Registers a new connection backed by a bounded channel of `buffer` frames.
    pub fn subscribe(self: &Arc<Self>, case_id: CaseId, user_id: UserId, buffer: usize) -> Subscription {
        let (sink, receiver) = mpsc::channel(buffer.max(1));
        let connection_id = self.add_connection(case_id, user_id, sink);
        Subscription {
            receiver,
            guard: ConnectionGuard {
                broadcaster: Arc::clone(self),
                case_id,
                connection_id,
            },
        }
    }

    /// Sends `event` to every connection on its case except those of `exclude_user`.
    /// Returns how many connections took the frame.
    pub fn broadcast(&self, event: &CaseEvent, exclude_user: Option<UserId>) -> Result<usize> {
        let frame = encode_event_frame(event)?;
        let delivered = self.deliver(event.case_id, &frame, exclude_user);
        tracing::debug!(
            case_id = %event.case_id,
            event_type = event.event_type.as_str(),
            delivered,
            "case event broadcast"
        );
        Ok(delivered)
    }

    /// Builds and broadcasts an event; the originating user gets no echo.
    pub fn emit_event(
        &self,
        event_type: CaseEventType,
        case_id: CaseId,
        payload: Value,
        originating_user: Option<UserId>,
    ) -> usize {
        let event = CaseEvent::new(event_type, case_id, payload, originating_user);
        match self.broadcast(&event, originating_user) {
            Ok(delivered) => delivered,
            Err(err) => {
                tracing::error!(%case_id, error = %err, "failed to broadcast case event");
                0
            }
        }
    }

    pub fn heartbeat(&self, case_id: CaseId) -> usize {
        self.deliver(case_id, &Bytes::from_static(HEARTBEAT_FRAME.as_bytes()), None)
    }

    pub fn heartbeat_all(&self) {
        let case_ids = self.registry().keys().copied().collect::<Vec<_>>();
        for case_id in case_ids {
            self.heartbeat(case_id);
        }
    }

    /// Heartbeats every case on `interval` until the handle is aborted.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                broadcaster.heartbeat_all();
            }
        })
    }

    fn deliver(&self, case_id: CaseId, frame: &Bytes, exclude_user: Option<UserId>) -> usize {
        let mut registry = self.registry();
        let Some(connections) = registry.get_mut(&case_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (connection_id, connection) in connections.iter() {
            if exclude_user.is_some_and(|user_id| user_id == connection.user_id) {
                continue;
            }
            match connection.sink.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(
                        %case_id,
                        %connection_id,
                        user_id = %connection.user_id,
                        error = %err,
                        "dropping dead push connection"
                    );
                    dead.push(*connection_id);
                }
            }
        }

        for connection_id in dead {
            connections.remove(&connection_id);
        }
        if connections.is_empty() {
            registry.remove(&case_id);
        }
        delivered
    }

    pub fn connection_count(&self, case_id: CaseId) -> usize {
        self.registry().get(&case_id).map_or(0, HashMap::len)
    }

    /// Distinct users with an open connection, oldest connection first.
    pub fn connected_users(&self, case_id: CaseId) -> Vec<UserId> {
        let registry = self.registry();
        let Some(connections) = registry.get(&case_id) else {
            return Vec::new();
        };
        let mut by_age = connections.values().collect::<Vec<_>>();
        by_age.sort_by_key(|connection| connection.created_at);
        let mut users = Vec::with_capacity(by_age.len());
        for connection in by_age {
            if !users.contains(&connection.user_id) {
                users.push(connection.user_id);
            }
        }
        users
    }

    pub fn case_count(&self) -> usize {
        self.registry().len()
    }

    /// Closes every stream by dropping all sinks.
    pub fn shutdown(&self) {
        let mut registry = self.registry();
        let connections: usize = registry.values().map(HashMap::len).sum();
        registry.clear();
        tracing::info!(connections, "broadcaster shut down");
    }
}

/// Removes its connection from the registry when dropped.
#[derive(Debug)]
struct ConnectionGuard {
    broadcaster: Arc<Broadcaster>,
    case_id: CaseId,
    connection_id: ConnectionId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.broadcaster
            .remove_connection(self.case_id, self.connection_id);
    }
}

/// Receiving half of one push connection.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<Bytes>,
    guard: ConnectionGuard,
}

impl Subscription {
    pub fn connection_id(&self) -> ConnectionId {
        self.guard.connection_id
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Frames until the connection is dropped by the broadcaster or `max_lifetime`
    /// passes. The connection is unregistered when the stream is dropped.
    pub fn into_stream(
        self,
        max_lifetime: Option<Duration>,
    ) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send + 'static {
        let deadline = max_lifetime.map(|lifetime| Instant::now() + lifetime);
        futures::stream::unfold(self, move |mut subscription| async move {
            let next = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, subscription.receiver.recv()).await {
                        Ok(frame) => frame,
                        Err(_) => {
                            tracing::info!(
                                case_id = %subscription.guard.case_id,
                                connection_id = %subscription.guard.connection_id,
                                "push connection reached max lifetime"
                            );
                            None
                        }
                    }
                }
                None => subscription.receiver.recv().await,
            };
            next.map(|frame| (Ok(frame), subscription))
        })
    }
}

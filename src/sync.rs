//! Client side of the push stream: keeps one case subscription alive, reconnecting
//! with exponential backoff, and hands every subscribed event to a single callback.
//!
//! ```text
//! disconnected -> connecting -> connected -> (error | disconnected)
//! ```
//!
//! A transport failure (including the server ending the stream) schedules a reconnect
//! after `base_delay * 2^attempts` while `attempts < max_reconnect_attempts`; past that
//! the consumer parks in [`ConnectionState::Error`] until [`SyncConsumer::reconnect`].
//! Authentication and permission failures go straight to `Error`.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{ErrorKind, Result};
use crate::events::{ALL_CASE_EVENT_TYPES, CaseEvent, CaseEventType, SseFrame};
use crate::models::CaseId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub base_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Event types handed to the callback; everything else is dropped on receipt.
    pub event_types: Vec<CaseEventType>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            event_types: ALL_CASE_EVENT_TYPES.to_vec(),
        }
    }
}

impl SyncConfig {
    pub fn backoff(&self, attempts: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempts))
    }
}

pub type FrameStream = BoxStream<'static, Result<SseFrame>>;

/// Opens one push stream for a case.
pub trait EventTransport: Send + Sync + 'static {
    fn open(&self, case_id: CaseId) -> impl Future<Output = Result<FrameStream>> + Send;
}

pub type EventCallback = Arc<dyn Fn(&CaseEvent) + Send + Sync>;

#[derive(Debug, Default)]
struct Progress {
    attempts: u32,
    last_event: Option<CaseEvent>,
    /// Bumped on every connect/disconnect so a cancelled task cannot publish state.
    generation: u64,
}

struct Shared<T> {
    case_id: CaseId,
    transport: Arc<T>,
    config: SyncConfig,
    subscribed: HashSet<CaseEventType>,
    callback: EventCallback,
    state: watch::Sender<ConnectionState>,
    progress: Mutex<Progress>,
}

impl<T> Shared<T> {
    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes `state` unless `generation` was superseded. Returns whether it is current.
    fn publish(&self, generation: u64, state: ConnectionState) -> bool {
        let progress = self.progress();
        if progress.generation != generation {
            return false;
        }
        self.state.send_replace(state);
        true
    }
}

pub struct SyncConsumer<T: EventTransport> {
    shared: Arc<Shared<T>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: EventTransport> SyncConsumer<T> {
    pub fn new(case_id: CaseId, transport: Arc<T>, config: SyncConfig, callback: EventCallback) -> Self {
        let subscribed = config.event_types.iter().copied().collect();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                case_id,
                transport,
                config,
                subscribed,
                callback,
                state,
                progress: Mutex::new(Progress::default()),
            }),
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the connection loop. A no-op while a connection is open or in flight,
    /// including while a reconnect is pending. Must be called inside a tokio runtime.
    pub fn connect(&self) {
        let mut task = self.task();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let generation = {
            let mut progress = self.shared.progress();
            progress.generation += 1;
            progress.generation
        };
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(run(shared, generation)));
    }

    /// Tears the connection down and cancels any pending reconnect.
    pub fn disconnect(&self) {
        if let Some(handle) = self.task().take() {
            handle.abort();
        }
        let mut progress = self.shared.progress();
        progress.generation += 1;
        self.shared.state.send_replace(ConnectionState::Disconnected);
        tracing::debug!(case_id = %self.shared.case_id, "sync consumer disconnected");
    }

    /// Manual retry: resets the attempt counter and connects again.
    pub fn reconnect(&self) {
        self.disconnect();
        self.shared.progress().attempts = 0;
        self.connect();
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn last_event(&self) -> Option<CaseEvent> {
        self.shared.progress().last_event.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.progress().attempts
    }

    pub fn case_id(&self) -> CaseId {
        self.shared.case_id
    }
}

impl<T: EventTransport> Drop for SyncConsumer<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.task().take() {
            handle.abort();
        }
    }
}

async fn run<T: EventTransport>(shared: Arc<Shared<T>>, generation: u64) {
    let case_id = shared.case_id;
    loop {
        if !shared.publish(generation, ConnectionState::Connecting) {
            return;
        }

        match shared.transport.open(case_id).await {
            Ok(stream) => {
                if !shared.publish(generation, ConnectionState::Connected) {
                    return;
                }
                shared.progress().attempts = 0;
                tracing::info!(%case_id, "event stream connected");
                consume(&shared, stream).await;
            }
            Err(err) if is_terminal(err.kind) => {
                tracing::error!(%case_id, error = %err, "event stream rejected");
                shared.publish(generation, ConnectionState::Error);
                return;
            }
            Err(err) => {
                tracing::warn!(%case_id, error = %err, "failed to open event stream");
            }
        }

        let attempts = {
            let mut progress = shared.progress();
            if progress.generation != generation {
                return;
            }
            if progress.attempts >= shared.config.max_reconnect_attempts {
                drop(progress);
                tracing::error!(%case_id, "event stream reconnect attempts exhausted");
                shared.publish(generation, ConnectionState::Error);
                return;
            }
            let attempts = progress.attempts;
            progress.attempts += 1;
            attempts
        };
        let delay = shared.config.backoff(attempts);
        if !shared.publish(generation, ConnectionState::Disconnected) {
            return;
        }
        tracing::info!(%case_id, attempt = attempts + 1, ?delay, "scheduling event stream reconnect");
        tokio::time::sleep(delay).await;
    }
}

/// Reads frames until the stream fails or ends.
async fn consume<T>(shared: &Shared<T>, mut stream: FrameStream) {
    let case_id = shared.case_id;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(SseFrame::Comment(comment)) => {
                tracing::trace!(%case_id, comment = %comment, "event stream comment");
            }
            Ok(SseFrame::Event { event, data }) => dispatch(shared, &event, &data),
            Err(err) => {
                tracing::warn!(%case_id, error = %err, "event stream failed");
                return;
            }
        }
    }
    tracing::info!(%case_id, "event stream ended");
}

fn dispatch<T>(shared: &Shared<T>, event: &str, data: &str) {
    let Ok(event_type) = event.parse::<CaseEventType>() else {
        tracing::debug!(event, "ignoring unknown event type");
        return;
    };
    if !shared.subscribed.contains(&event_type) {
        return;
    }
    let event = match serde_json::from_str::<CaseEvent>(data) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(event_type = event_type.as_str(), error = %err, "dropping malformed event");
            return;
        }
    };

    shared.progress().last_event = Some(event.clone());
    (shared.callback)(&event);
}

fn is_terminal(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Unauthenticated | ErrorKind::Forbidden | ErrorKind::NotFound
    )
}

#[cfg(feature = "client")]
pub use http::HttpTransport;

#[cfg(feature = "client")]
mod http {
    use anyhow::anyhow;
    use futures::StreamExt;
    use reqwest::StatusCode;
    use reqwest::header::ACCEPT;

    use super::{EventTransport, FrameStream};
    use crate::error::{LibError, Result};
    use crate::events::FrameDecoder;
    use crate::models::{CaseId, UserId};

    /// Streams `GET {base_url}/case/{case_id}/events` over HTTP.
    #[derive(Debug, Clone)]
    pub struct HttpTransport {
        client: reqwest::Client,
        base_url: String,
        bearer_token: Option<String>,
        claimed_user: Option<UserId>,
    }

    impl HttpTransport {
        pub fn new(base_url: impl Into<String>) -> Self {
            Self {
                client: reqwest::Client::new(),
                base_url: base_url.into().trim_end_matches('/').to_string(),
                bearer_token: None,
                claimed_user: None,
            }
        }

        pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
            self.bearer_token = Some(token.into());
            self
        }

        /// Only honored by servers running the trusted-header session strategy.
        pub fn with_claimed_user(mut self, user_id: UserId) -> Self {
            self.claimed_user = Some(user_id);
            self
        }
    }

    impl EventTransport for HttpTransport {
        async fn open(&self, case_id: CaseId) -> Result<FrameStream> {
            let url = format!("{}/case/{}/events", self.base_url, case_id);
            let mut request = self.client.get(&url).header(ACCEPT, "text/event-stream");
            if let Some(token) = &self.bearer_token {
                request = request.bearer_auth(token);
            }
            if let Some(user_id) = self.claimed_user {
                request = request.header("x-user-id", user_id.to_string());
            }

            let response = request.send().await.map_err(|err| {
                LibError::transport("Failed to open event stream", anyhow!(err))
            })?;
            match response.status() {
                status if status.is_success() => {}
                StatusCode::UNAUTHORIZED => {
                    return Err(LibError::unauthenticated(
                        "Event stream requires a valid session",
                        anyhow!("GET {} returned 401", url),
                    ));
                }
                StatusCode::FORBIDDEN => {
                    return Err(LibError::forbidden(
                        "You do not have access to this case",
                        anyhow!("GET {} returned 403", url),
                    ));
                }
                StatusCode::NOT_FOUND => {
                    return Err(LibError::not_found(
                        "Case not found",
                        anyhow!("GET {} returned 404", url),
                    ));
                }
                status => {
                    return Err(LibError::transport(
                        "Event stream request failed",
                        anyhow!("GET {} returned {}", url, status),
                    ));
                }
            }

            let mut decoder = FrameDecoder::new();
            let frames = response
                .bytes_stream()
                .map(move |chunk| match chunk {
                    Ok(bytes) => decoder.push(&bytes).into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(err) => vec![Err(LibError::transport(
                        "Event stream connection lost",
                        anyhow!(err),
                    ))],
                })
                .flat_map(futures::stream::iter);
            Ok(frames.boxed())
        }
    }
}

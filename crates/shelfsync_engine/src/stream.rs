//! Live event stream client.
//!
//! One [`EventStreamClient`] owns one connection to the server's event
//! endpoint. A background task opens the connection, frames the byte stream
//! into records, decodes each record into a [`DomainEvent`] and publishes it
//! to every current [`Subscription`]. When the connection fails or the
//! server closes it, the task waits out an exponential backoff and reconnects.
//!
//! ```text
//! Disconnected → Connecting → Streaming → Disconnected → (backoff) → Connecting …
//! ```
//!
//! Delivery is hot: an event published while nobody is subscribed is
//! dropped, and a new subscriber only sees events published after it
//! subscribed.
//!
//! Each subscription buffers at most [`DEFAULT_SUBSCRIBER_CAPACITY`] events
//! (see [`EventStreamClient::with_subscriber_capacity`]). Publishing never
//! waits on a subscriber: when its buffer is full the event is dropped for
//! that subscriber alone and counted in [`StreamStats::events_lagged`].

use crate::backoff::Backoff;
use crate::config::{BackoffConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;
use shelfsync_protocol::{
    DomainEvent, EventDecoder, ProtocolResult, RecordFramer, DEFAULT_MAX_RECORD_LEN,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Raw bytes of one stream session.
pub type ByteStream = BoxStream<'static, SyncResult<Bytes>>;

/// Connection state, observable for a connectivity indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected; possibly waiting to reconnect.
    Disconnected,
    /// Opening the connection.
    Connecting,
    /// Connected and reading records.
    Streaming,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
        })
    }
}

/// Something the client can open a byte stream from.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Whether an endpoint and credentials are available.
    fn is_configured(&self) -> bool;

    /// Opens one session.
    async fn open(&self) -> SyncResult<ByteStream>;
}

/// Events buffered per subscription before new ones are dropped for it.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

struct Subscribers {
    next_id: u64,
    capacity: usize,
    senders: HashMap<u64, mpsc::Sender<DomainEvent>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Published {
    delivered: usize,
    lagged: usize,
}

impl Subscribers {
    fn new(capacity: usize) -> Self {
        Self {
            next_id: 0,
            capacity,
            senders: HashMap::new(),
        }
    }

    /// Offers the event to every live subscriber without waiting.
    fn publish(&mut self, event: &DomainEvent) -> Published {
        let mut published = Published {
            delivered: 0,
            lagged: 0,
        };
        self.senders.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                published.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = id, event = %event.tag(), "subscriber is full, event dropped for it");
                published.lagged += 1;
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        published
    }
}

/// Handle to the events published after it was created.
///
/// Dropping the handle (or calling [`cancel`](Self::cancel)) unregisters it.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<DomainEvent>,
    registry: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    /// Waits for the next event. Returns `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        self.rx.recv().await
    }

    /// Returns an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<DomainEvent> {
        self.rx.try_recv().ok()
    }

    /// Unregisters the subscription.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().senders.remove(&self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Counters of one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Sessions opened successfully.
    pub sessions: u64,
    /// Records decoded into events, heartbeats included.
    pub records: u64,
    /// Events handed to at least one subscriber.
    pub events_published: u64,
    /// Events published while nobody was subscribed.
    pub events_dropped: u64,
    /// Deliveries skipped because a subscriber's buffer was full, counted
    /// once per subscriber and event.
    pub events_lagged: u64,
}

#[derive(Default)]
struct Counters {
    sessions: AtomicU64,
    records: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    lagged: AtomicU64,
}

struct Shared {
    source: Arc<dyn EventSource>,
    backoff: BackoffConfig,
    heartbeat_timeout: Option<Duration>,
    max_record_len: usize,
    decoder: EventDecoder,
    state: watch::Sender<ConnectionState>,
    subscribers: Arc<Mutex<Subscribers>>,
    counters: Counters,
}

enum SessionEnd {
    Cancelled,
    Closed,
    Failed(SyncError),
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "event stream state changed");
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.source.is_configured() {
            info!("event stream endpoint or credentials missing, not connecting");
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let mut backoff = Backoff::new(self.backoff.clone());
        loop {
            self.set_state(ConnectionState::Connecting);
            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                opened = self.source.open() => opened,
            };

            let delivered = match opened {
                Ok(stream) => {
                    self.counters.sessions.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnectionState::Streaming);
                    info!("event stream connected");
                    let (delivered, end) = self.read_session(stream, &cancel).await;
                    match end {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Closed => {
                            info!(records = delivered, "event stream closed by server")
                        }
                        SessionEnd::Failed(e) => {
                            warn!(error = %e, records = delivered, "event stream failed")
                        }
                    }
                    delivered
                }
                Err(SyncError::NotConfigured(reason)) => {
                    info!(%reason, "event stream not configured, stopping");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "failed to open event stream");
                    0
                }
            };

            self.set_state(ConnectionState::Disconnected);
            if delivered > 0 {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            debug!(?delay, attempt = backoff.attempt(), "waiting before reconnect");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Reads one session to its end. Returns the number of records that
    /// decoded into events.
    async fn read_session(
        &self,
        mut stream: ByteStream,
        cancel: &CancellationToken,
    ) -> (u64, SessionEnd) {
        let mut framer = RecordFramer::with_max_len(self.max_record_len);
        let mut delivered = 0u64;
        let mut deadline = self.heartbeat_timeout.map(|limit| Instant::now() + limit);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return (delivered, SessionEnd::Cancelled),
                next = Self::next_chunk(&mut stream, deadline) => next,
            };
            let records = match next {
                Ok(Some(chunk)) => framer.push(&chunk),
                Ok(None) => {
                    if let Some(record) = framer.finish() {
                        delivered += u64::from(self.handle_record(record));
                    }
                    return (delivered, SessionEnd::Closed);
                }
                Err(e) => return (delivered, SessionEnd::Failed(e)),
            };
            for record in records {
                if self.handle_record(record) {
                    delivered += 1;
                    if let Some(limit) = self.heartbeat_timeout {
                        deadline = Some(Instant::now() + limit);
                    }
                }
            }
        }
    }

    async fn next_chunk(
        stream: &mut ByteStream,
        deadline: Option<Instant>,
    ) -> SyncResult<Option<Bytes>> {
        match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(next) => next.transpose(),
                Err(_) => Err(SyncError::transport_retryable("heartbeat timeout")),
            },
            None => stream.next().await.transpose(),
        }
    }

    /// Decodes and publishes one record. Returns true if it decoded.
    fn handle_record(&self, record: ProtocolResult<String>) -> bool {
        let line = match record {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "skipping unreadable record");
                return false;
            }
        };
        let Some(event) = self.decoder.decode_record(&line) else {
            return false;
        };
        self.counters.records.fetch_add(1, Ordering::Relaxed);
        if event.is_heartbeat() {
            trace!("heartbeat");
            return true;
        }

        let published = self.subscribers.lock().publish(&event);
        if published.lagged > 0 {
            self.counters
                .lagged
                .fetch_add(published.lagged as u64, Ordering::Relaxed);
        }
        if published.delivered > 0 {
            self.counters.published.fetch_add(1, Ordering::Relaxed);
            debug!(event = %event.tag(), receivers = published.delivered, "event published");
        } else if published.lagged == 0 {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(event = %event.tag(), "no subscribers, event dropped");
        }
        true
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Client of the server's live event stream.
pub struct EventStreamClient {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl EventStreamClient {
    /// Creates a disconnected client.
    pub fn new(source: Arc<dyn EventSource>, backoff: BackoffConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                source,
                backoff,
                heartbeat_timeout: None,
                max_record_len: DEFAULT_MAX_RECORD_LEN,
                decoder: EventDecoder::new(),
                state,
                subscribers: Arc::new(Mutex::new(Subscribers::new(DEFAULT_SUBSCRIBER_CAPACITY))),
                counters: Counters::default(),
            }),
            running: Mutex::new(None),
        }
    }

    /// Creates a client using the backoff and heartbeat settings of `config`.
    pub fn from_config(source: Arc<dyn EventSource>, config: &SyncConfig) -> Self {
        Self::new(source, config.backoff.clone()).with_heartbeat_timeout(config.heartbeat_timeout)
    }

    /// Sets the heartbeat timeout. Must be called before [`connect`](Self::connect).
    pub fn with_heartbeat_timeout(mut self, timeout: Option<Duration>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.heartbeat_timeout = timeout;
        }
        self
    }

    /// Sets the largest accepted record.
    pub fn with_max_record_len(mut self, max_len: usize) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.max_record_len = max_len;
        }
        self
    }

    /// Sets how many events each later subscription buffers.
    pub fn with_subscriber_capacity(self, capacity: usize) -> Self {
        self.shared.subscribers.lock().capacity = capacity.max(1);
        self
    }

    /// Starts the connection loop on the current Tokio runtime.
    ///
    /// A no-op while the loop is already running (connecting, streaming or
    /// waiting to reconnect).
    pub fn connect(&self) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&self.shared).run(cancel.clone()));
        *running = Some(Running { cancel, handle });
    }

    /// Stops the loop, cancelling any open attempt, read or backoff wait.
    ///
    /// The client stays disconnected until [`connect`](Self::connect) is
    /// called again.
    pub async fn disconnect(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                warn!(error = %e, "event stream task ended abnormally");
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Returns true while the connection loop is alive.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watches connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Registers a subscriber for events published from now on.
    pub fn subscribe(&self) -> Subscription {
        let mut subscribers = self.shared.subscribers.lock();
        let (tx, rx) = mpsc::channel(subscribers.capacity);
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.senders.insert(id, tx);
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.shared.subscribers),
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().senders.len()
    }

    /// Counters since the client was created.
    pub fn stats(&self) -> StreamStats {
        let c = &self.shared.counters;
        StreamStats {
            sessions: c.sessions.load(Ordering::Relaxed),
            records: c.records.load(Ordering::Relaxed),
            events_published: c.published.load(Ordering::Relaxed),
            events_dropped: c.dropped.load(Ordering::Relaxed),
            events_lagged: c.lagged.load(Ordering::Relaxed),
        }
    }
}

impl Drop for EventStreamClient {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

impl fmt::Debug for EventStreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStreamClient")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

/// How a scripted session ends once its chunks are delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnding {
    /// The server closes the connection.
    Close,
    /// The read fails.
    Error(String),
    /// The connection stays open and silent.
    Hang,
}

/// One scripted session of a [`ScriptedEventSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedSession {
    /// Opening fails.
    Refuse(String),
    /// Opening succeeds and delivers these chunks.
    Deliver {
        /// Raw chunks, delivered in order.
        chunks: Vec<Bytes>,
        /// What happens afterwards.
        then: SessionEnding,
    },
}

impl ScriptedSession {
    /// A session refused with `reason`.
    pub fn refuse(reason: impl Into<String>) -> Self {
        Self::Refuse(reason.into())
    }

    /// A session delivering each record as one newline-terminated chunk,
    /// then closing.
    pub fn records<I, S>(records: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chunks = records
            .into_iter()
            .map(|r| {
                let mut line = r.into();
                line.push('\n');
                Bytes::from(line)
            })
            .collect();
        Self::Deliver {
            chunks,
            then: SessionEnding::Close,
        }
    }

    /// A session delivering raw chunks, then closing.
    pub fn chunks(chunks: impl IntoIterator<Item = Bytes>) -> Self {
        Self::Deliver {
            chunks: chunks.into_iter().collect(),
            then: SessionEnding::Close,
        }
    }

    /// Replaces how the session ends.
    pub fn then(self, ending: SessionEnding) -> Self {
        match self {
            Self::Deliver { chunks, .. } => Self::Deliver {
                chunks,
                then: ending,
            },
            refused => refused,
        }
    }
}

/// An [`EventSource`] replaying scripted sessions, for tests.
///
/// Once the script is exhausted every open yields a silent session.
#[derive(Debug)]
pub struct ScriptedEventSource {
    configured: bool,
    sessions: Mutex<VecDeque<ScriptedSession>>,
    opens: Mutex<Vec<Instant>>,
}

impl ScriptedEventSource {
    /// Creates a configured source playing `sessions` in order.
    pub fn new(sessions: impl IntoIterator<Item = ScriptedSession>) -> Self {
        Self {
            configured: true,
            sessions: Mutex::new(sessions.into_iter().collect()),
            opens: Mutex::new(Vec::new()),
        }
    }

    /// Creates a source with no endpoint.
    pub fn unconfigured() -> Self {
        Self {
            configured: false,
            ..Self::new([])
        }
    }

    /// Appends a session to the script.
    pub fn push(&self, session: ScriptedSession) {
        self.sessions.lock().push_back(session);
    }

    /// Number of open attempts so far.
    pub fn open_count(&self) -> usize {
        self.opens.lock().len()
    }

    /// Instants of every open attempt.
    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().clone()
    }
}

#[async_trait]
impl EventSource for ScriptedEventSource {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn open(&self) -> SyncResult<ByteStream> {
        if !self.configured {
            return Err(SyncError::NotConfigured("no stream endpoint".into()));
        }
        self.opens.lock().push(Instant::now());
        let session = self.sessions.lock().pop_front();
        let (chunks, then) = match session {
            None => return Ok(stream::pending().boxed()),
            Some(ScriptedSession::Refuse(reason)) => {
                return Err(SyncError::transport_retryable(reason))
            }
            Some(ScriptedSession::Deliver { chunks, then }) => (chunks, then),
        };
        let body = stream::iter(chunks.into_iter().map(Ok));
        Ok(match then {
            SessionEnding::Close => body.boxed(),
            SessionEnding::Error(message) => body
                .chain(stream::once(async move {
                    Err(SyncError::transport_retryable(message))
                }))
                .boxed(),
            SessionEnding::Hang => body.chain(stream::pending()).boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shelfsync_protocol::{EntityRef, EntitySnapshot, EventEnvelope};

    fn updated(id: &str, version: u64) -> String {
        let event = DomainEvent::EntityUpdated(
            EntitySnapshot::new(EntityRef::book(id), version).with_field("title", json!("T")),
        );
        EventEnvelope::from_event(&event).to_record()
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_events_to_subscribers() {
        let source = Arc::new(ScriptedEventSource::new([ScriptedSession::records([
            updated("b1", 2),
            r#"{"type":"heartbeat"}"#.to_string(),
            "not json".to_string(),
            r#"{"type":"audiobook.updated","data":{}}"#.to_string(),
            updated("b2", 3),
        ])
        .then(SessionEnding::Hang)]));
        let client = EventStreamClient::new(source, BackoffConfig::default());
        let mut first = client.subscribe();
        let mut second = client.subscribe();
        client.connect();

        for sub in [&mut first, &mut second] {
            let a = sub.recv().await.unwrap();
            let b = sub.recv().await.unwrap();
            assert_eq!(a.entity(), Some(&EntityRef::book("b1")));
            assert_eq!(b.entity(), Some(&EntityRef::book("b2")));
        }
        assert_eq!(client.state(), ConnectionState::Streaming);

        let stats = client.stats();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.events_published, 2);
        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn full_subscriber_does_not_block_publishing() {
        let records = (1..=5).map(|n| updated(&format!("b{n}"), 2)).collect::<Vec<_>>();
        let source = Arc::new(ScriptedEventSource::new([
            ScriptedSession::records(records).then(SessionEnding::Hang)
        ]));
        let client =
            EventStreamClient::new(source, BackoffConfig::default()).with_subscriber_capacity(2);
        let mut idle = client.subscribe();
        client.connect();

        while client.stats().records < 5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let stats = client.stats();
        assert_eq!(stats.events_published, 2);
        assert_eq!(stats.events_lagged, 3);
        assert_eq!(stats.events_dropped, 0);
        assert_eq!(client.subscriber_count(), 1);

        assert_eq!(idle.try_recv().unwrap().entity(), Some(&EntityRef::book("b1")));
        assert_eq!(idle.try_recv().unwrap().entity(), Some(&EntityRef::book("b2")));
        assert!(idle.try_recv().is_none());
        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_subscription_unregisters() {
        let client = EventStreamClient::new(
            Arc::new(ScriptedEventSource::unconfigured()),
            BackoffConfig::default(),
        );
        let sub = client.subscribe();
        let other = client.subscribe();
        assert_eq!(client.subscriber_count(), 2);
        drop(sub);
        other.cancel();
        assert_eq!(client.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let source = Arc::new(ScriptedEventSource::new([]));
        let client = EventStreamClient::new(source.clone(), BackoffConfig::default());
        client.connect();
        client.connect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.connect();
        assert_eq!(source.open_count(), 1);
        assert!(client.is_running());

        client.disconnect().await;
        assert!(!client.is_running());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_source_never_opens() {
        let source = Arc::new(ScriptedEventSource::unconfigured());
        let client = EventStreamClient::new(source.clone(), BackoffConfig::default());
        client.connect();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.open_count(), 0);
        assert!(!client.is_running());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}

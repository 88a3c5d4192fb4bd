//! Remote service abstraction.
//!
//! Handlers describe each operation as a [`RemoteRequest`]; a
//! [`RemoteService`] delivers it and returns the server's [`RemoteAck`].
//! Every endpoint is expected to be idempotent, since a request whose
//! response was lost is sent again.

use crate::error::RemoteError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use shelfsync_protocol::{EntityId, EntityRef, EntityType, FieldMap};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// HTTP verbs used by the REST endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// GET.
    Get,
    /// POST.
    Post,
    /// PUT.
    Put,
    /// PATCH.
    Patch,
    /// DELETE.
    Delete,
}

impl HttpMethod {
    /// Returns the verb in upper case.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request to the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    /// Verb.
    pub method: HttpMethod,
    /// Path relative to the API base URL, starting with `/`.
    pub path: String,
    /// JSON body.
    pub body: Option<serde_json::Value>,
}

impl RemoteRequest {
    /// Creates a request.
    pub fn new(method: HttpMethod, path: impl Into<String>, body: Option<serde_json::Value>) -> Self {
        Self {
            method,
            path: path.into(),
            body,
        }
    }

    /// `METHOD path`, used for logging and mock routing.
    pub fn route(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Successful response of the remote service.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RemoteAck {
    /// Server id of the entity, if the request created it.
    #[serde(default)]
    pub id: Option<EntityId>,
    /// Server version of the entity after the request.
    #[serde(default)]
    pub version: Option<u64>,
    /// Fields the server normalized or filled in.
    #[serde(default)]
    pub fields: FieldMap,
    /// Temporary ids the server replaced, mapped to their real ids.
    #[serde(default)]
    pub id_map: BTreeMap<EntityId, EntityId>,
}

impl RemoteAck {
    /// An ack carrying only a version.
    pub fn with_version(version: u64) -> Self {
        Self {
            version: Some(version),
            ..Self::default()
        }
    }

    /// Sets the assigned id.
    pub fn assigned(mut self, id: impl Into<EntityId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Adds a temporary → real id mapping.
    pub fn mapping(mut self, temporary: EntityId, real: impl Into<EntityId>) -> Self {
        self.id_map.insert(temporary, real.into());
        self
    }

    /// Adds a field correction.
    pub fn field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Collection endpoint of an entity type.
pub fn collection_path(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Book => "/books",
        EntityType::Contributor => "/contributors",
        EntityType::Series => "/series",
        EntityType::Tag => "/tags",
        EntityType::Genre => "/genres",
    }
}

/// Endpoint of a single entity.
pub fn entity_path(entity: &EntityRef) -> String {
    format!("{}/{}", collection_path(entity.entity_type), entity.id)
}

/// The remote service the queue drains into.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Sends one request.
    async fn send(&self, request: RemoteRequest) -> Result<RemoteAck, RemoteError>;
}

/// A scripted [`RemoteService`] for tests.
///
/// Responses are queued per route (`"PATCH /books/b1"`); a route with no
/// queued response gets an empty successful ack.
#[derive(Debug, Default)]
pub struct MockRemote {
    responses: Mutex<HashMap<String, VecDeque<Result<RemoteAck, RemoteError>>>>,
    requests: Mutex<Vec<RemoteRequest>>,
    latency: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockRemote {
    /// Creates a mock that acknowledges everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response for a route.
    pub fn respond(
        &self,
        method: HttpMethod,
        path: impl Into<String>,
        response: Result<RemoteAck, RemoteError>,
    ) {
        let route = format!("{method} {}", path.into());
        self.responses
            .lock()
            .entry(route)
            .or_default()
            .push_back(response);
    }

    /// Delays every response.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// All requests received, in arrival order.
    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.requests.lock().clone()
    }

    /// Requests received for one path.
    pub fn requests_to(&self, path: &str) -> Vec<RemoteRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    /// Number of requests received.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Highest number of requests that were in progress at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteService for MockRemote {
    async fn send(&self, request: RemoteRequest) -> Result<RemoteAck, RemoteError> {
        let route = request.route();
        self.requests.lock().push(request);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.responses
            .lock()
            .get_mut(&route)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(RemoteAck::default()))
    }
}

//! The sync engine facade.
//!
//! [`SyncEngine`] wires the queue, the handlers, the push orchestrator, the
//! event stream and the event applier together, and owns the two
//! background tasks:
//!
//! - the event pump, applying stream events in received order;
//! - the flusher, draining the queue on explicit triggers and on the
//!   configured interval while online.

use crate::applier::{ApplyOutcome, EventApplier};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::handler::HandlerRegistry;
use crate::http::{HttpEventSource, HttpRemote, ReqwestClient};
use crate::locks::EntityLocks;
use crate::orchestrator::{FlushReport, PushSyncOrchestrator, SyncNotice, SyncStats};
use crate::queue::{EnqueueOutcome, JournalQueueStore, PendingOperationQueue, QueueStore};
use crate::remote::RemoteService;
use crate::store::{EntityStore, SyncState};
use crate::stream::{ConnectionState, EventSource, EventStreamClient, StreamStats, Subscription};
use parking_lot::Mutex;
use shelfsync_protocol::{
    DomainEvent, EntityRef, OperationId, OperationKind, OperationPayload, PendingOperation,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Collaborators of a [`SyncEngine`].
pub struct EngineComponents {
    /// The local entity store.
    pub store: Arc<dyn EntityStore>,
    /// Persistence of the operation queue.
    pub queue_store: Arc<dyn QueueStore>,
    /// The request/response side of the server.
    pub remote: Arc<dyn RemoteService>,
    /// The live event stream.
    pub events: Arc<dyn EventSource>,
    /// Operation handlers.
    pub handlers: HandlerRegistry,
}

impl EngineComponents {
    /// Bundles the collaborators with the default handlers.
    pub fn new(
        store: Arc<dyn EntityStore>,
        queue_store: Arc<dyn QueueStore>,
        remote: Arc<dyn RemoteService>,
        events: Arc<dyn EventSource>,
    ) -> Self {
        Self {
            store,
            queue_store,
            remote,
            events,
            handlers: HandlerRegistry::with_defaults(),
        }
    }

    /// Replaces the handler registry.
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }
}

struct Background {
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    flusher: JoinHandle<()>,
}

/// Offline-first sync engine.
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn EntityStore>,
    queue: Arc<PendingOperationQueue>,
    handlers: Arc<HandlerRegistry>,
    locks: Arc<EntityLocks>,
    orchestrator: Arc<PushSyncOrchestrator>,
    applier: Arc<EventApplier>,
    stream: EventStreamClient,
    online: Arc<AtomicBool>,
    wake: Arc<Notify>,
    background: Mutex<Option<Background>>,
}

impl SyncEngine {
    /// Loads the queue and builds an engine. Nothing runs until
    /// [`start`](Self::start).
    ///
    /// The engine starts out online.
    pub async fn open(config: SyncConfig, components: EngineComponents) -> SyncResult<Self> {
        let EngineComponents {
            store,
            queue_store,
            remote,
            events,
            handlers,
        } = components;

        let queue = Arc::new(PendingOperationQueue::open(queue_store, config.max_retries).await?);
        let handlers = Arc::new(handlers);
        let locks = Arc::new(EntityLocks::new());
        let orchestrator = Arc::new(
            PushSyncOrchestrator::new(
                Arc::clone(&queue),
                Arc::clone(&store),
                remote,
                Arc::clone(&handlers),
                Arc::clone(&locks),
            )
            .with_config(&config),
        );
        let applier = Arc::new(EventApplier::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&handlers),
            Arc::clone(&locks),
        ));
        let stream = EventStreamClient::from_config(events, &config);

        info!(
            api = %config.api_base_url,
            queued = queue.len(),
            handlers = handlers.len(),
            "sync engine opened"
        );
        Ok(Self {
            config,
            store,
            queue,
            handlers,
            locks,
            orchestrator,
            applier,
            stream,
            online: Arc::new(AtomicBool::new(true)),
            wake: Arc::new(Notify::new()),
            background: Mutex::new(None),
        })
    }

    /// Builds an engine talking REST and a streaming GET through `reqwest`,
    /// with the queue journaled at `journal_path`.
    pub async fn open_http(
        config: SyncConfig,
        store: Arc<dyn EntityStore>,
        journal_path: impl AsRef<Path>,
    ) -> SyncResult<Self> {
        let client = ReqwestClient::from_config(&config)?;
        let queue_store = JournalQueueStore::open_file(journal_path, config.journal.clone())?;
        let components = EngineComponents::new(
            store,
            Arc::new(queue_store),
            Arc::new(HttpRemote::from_config(&config, client.clone())),
            Arc::new(HttpEventSource::from_config(&config, client)),
        );
        Self::open(config, components).await
    }

    /// Spawns the background tasks on the current Tokio runtime and, if
    /// online, connects the stream and schedules a flush.
    ///
    /// A no-op if already started.
    pub fn start(&self) {
        let mut background = self.background.lock();
        if background.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_events(
            self.stream.subscribe(),
            Arc::clone(&self.applier),
            cancel.clone(),
        ));
        let flusher = tokio::spawn(flush_loop(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.online),
            Arc::clone(&self.wake),
            self.config.flush_interval.map(flush_ticker),
            cancel.clone(),
        ));
        *background = Some(Background {
            cancel,
            pump,
            flusher,
        });
        drop(background);

        if self.is_online() {
            self.stream.connect();
            self.wake.notify_one();
        }
        info!(online = self.is_online(), "sync engine started");
    }

    /// Stops the background tasks and disconnects the stream. Queued
    /// operations stay durable.
    pub async fn shutdown(&self) {
        let background = self.background.lock().take();
        if let Some(background) = background {
            background.cancel.cancel();
            for (name, handle) in [("event pump", background.pump), ("flusher", background.flusher)] {
                if let Err(e) = handle.await {
                    warn!(task = name, error = %e, "background task ended abnormally");
                }
            }
        }
        self.stream.disconnect().await;
        info!("sync engine stopped");
    }

    /// Returns true once [`start`](Self::start) ran and until
    /// [`shutdown`](Self::shutdown).
    pub fn is_started(&self) -> bool {
        self.background.lock().is_some()
    }

    /// Connectivity signal.
    ///
    /// Going online connects the stream and triggers a flush; going offline
    /// disconnects the stream. Edits keep queueing either way.
    pub async fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::AcqRel);
        if was == online {
            return;
        }
        info!(online, "connectivity changed");
        if !self.is_started() {
            return;
        }
        if online {
            self.stream.connect();
            self.wake.notify_one();
        } else {
            self.stream.disconnect().await;
        }
    }

    /// Returns the last connectivity signal.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Applies an edit locally and queues it for delivery.
    ///
    /// `base` is the server version the edit was made against; when `None`
    /// the cached version is used. Creates carry no baseline.
    pub async fn submit(
        &self,
        entity: EntityRef,
        payload: OperationPayload,
        base: Option<u64>,
    ) -> SyncResult<EnqueueOutcome> {
        let kind = payload.kind();
        let handler = self.handlers.for_kind(kind)?;

        let outcome = {
            let _guard = self.locks.lock(&entity).await;
            let base = match (kind, base) {
                (OperationKind::CreateEntity, _) => None,
                (_, Some(base)) => Some(base),
                (_, None) => self.store.get(&entity)?.map(|row| row.server_version),
            };
            handler.apply_local(&entity, &payload, self.store.as_ref())?;
            let bytes = handler.serialize(&payload)?;
            if handler.coalesces() {
                self.queue
                    .enqueue_or_coalesce_with(kind, entity.clone(), bytes, base, |older, newer| {
                        handler.coalesce(kind, older, newer)
                    })
                    .await?
            } else {
                EnqueueOutcome::Inserted(self.queue.enqueue(kind, entity.clone(), bytes, base).await?)
            }
        };

        debug!(id = %outcome.id(), %kind, %entity, coalesced = outcome.is_coalesced(), "edit submitted");
        self.trigger_flush();
        Ok(outcome)
    }

    /// Drains the queue now.
    pub async fn flush(&self) -> SyncResult<FlushReport> {
        if !self.is_online() {
            debug!("offline, flush skipped");
            return Ok(FlushReport::default());
        }
        self.orchestrator.flush().await
    }

    /// Wakes the background flusher, if running and online.
    pub fn trigger_flush(&self) {
        if self.is_online() && self.is_started() {
            self.wake.notify_one();
        }
    }

    /// Puts a failed operation back in the queue, rebased on the entity's
    /// current server version so the next attempt overwrites the server.
    pub async fn retry_operation(&self, id: OperationId) -> SyncResult<()> {
        let op = self.queue.get(id).ok_or(SyncError::OperationNotFound(id))?;
        {
            let _guard = self.locks.lock(&op.entity).await;
            let base = match op.kind {
                OperationKind::CreateEntity => None,
                _ => self.store.get(&op.entity)?.map(|row| row.server_version),
            };
            self.queue.retry(id, base).await?;
        }
        self.trigger_flush();
        Ok(())
    }

    /// Drops a queued operation. The local edit stays in the store; if
    /// nothing else is outstanding the entity is marked synced and a
    /// refresh notice is sent so the caller can reload it from the server.
    pub async fn discard_operation(&self, id: OperationId) -> SyncResult<PendingOperation> {
        let op = self.queue.get(id).ok_or(SyncError::OperationNotFound(id))?;
        let _guard = self.locks.lock(&op.entity).await;
        let op = self.queue.discard(id).await?;
        if !self.queue.has_outstanding(&op.entity) {
            self.store.set_sync_state(&op.entity, SyncState::Synced)?;
            self.orchestrator.notify(SyncNotice::RefreshRequired {
                entity: op.entity.clone(),
            });
        }
        Ok(op)
    }

    /// Applies one event directly, bypassing the stream.
    pub async fn apply_event(&self, event: &DomainEvent) -> SyncResult<ApplyOutcome> {
        self.applier.apply(event).await
    }

    /// Subscribes to decoded stream events.
    pub fn subscribe(&self) -> Subscription {
        self.stream.subscribe()
    }

    /// Subscribes to sync notices.
    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.orchestrator.notices()
    }

    /// Current stream connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.stream.state()
    }

    /// Push counters.
    pub fn stats(&self) -> SyncStats {
        self.orchestrator.stats()
    }

    /// Stream counters.
    pub fn stream_stats(&self) -> StreamStats {
        self.stream.stats()
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The local entity store.
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// The operation queue.
    pub fn queue(&self) -> &Arc<PendingOperationQueue> {
        &self.queue
    }

    /// The stream client.
    pub fn stream(&self) -> &EventStreamClient {
        &self.stream
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(background) = self.background.get_mut().take() {
            background.cancel.cancel();
        }
    }
}

fn flush_ticker(period: std::time::Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn pump_events(
    mut events: Subscription,
    applier: Arc<EventApplier>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        match applier.apply(&event).await {
            Ok(outcome) => debug!(event = %event.tag(), ?outcome, "event applied"),
            Err(e) => warn!(event = %event.tag(), error = %e, "event could not be applied"),
        }
    }
    debug!("event pump stopped");
}

async fn flush_loop(
    orchestrator: Arc<PushSyncOrchestrator>,
    online: Arc<AtomicBool>,
    wake: Arc<Notify>,
    mut ticker: Option<Interval>,
    cancel: CancellationToken,
) {
    loop {
        let tick = async {
            match ticker.as_mut() {
                Some(ticker) => {
                    ticker.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
            _ = tick => {}
        }
        if !online.load(Ordering::Acquire) {
            continue;
        }
        if let Err(e) = orchestrator.flush().await {
            warn!(error = %e, "background flush failed");
        }
    }
    debug!("flusher stopped");
}

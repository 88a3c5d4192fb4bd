//! Push synchronization.
//!
//! The [`PushSyncOrchestrator`] drains the pending operation queue into the
//! remote service. Each pass claims batches of rows (one per entity) and
//! processes them concurrently up to the configured limit. Per row:
//!
//! 1. Conflict check under the entity lock: a server version newer than the
//!    row's baseline, or a vanished entity, fails the row without sending.
//! 2. The handler executes the remote call.
//! 3. On success the outcome is applied: temporary ids are reconciled
//!    across store and queue, field corrections and the server version are
//!    stored, remaining rows are rebased and the row is completed.
//! 4. Failures are recorded as retryable or permanent.
//!
//! Every row is attempted at most once per pass.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::handler::{apply_fields, ExecuteOutcome, HandlerRegistry, IdMapping, OperationHandler};
use crate::locks::EntityLocks;
use crate::queue::PendingOperationQueue;
use crate::remote::RemoteService;
use crate::store::{EntityStore, SyncState};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use shelfsync_protocol::{
    EntityId, EntityRef, EntityType, OperationId, OperationKind, OperationPayload, OperationStatus,
    PendingOperation,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the notice channel.
const NOTICE_CAPACITY: usize = 256;

/// Something the user may need to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    /// An operation stopped because the server changed the entity first.
    Conflict {
        /// The failed operation.
        operation: OperationId,
        /// Its entity.
        entity: EntityRef,
        /// Why.
        reason: String,
    },
    /// An operation stopped after a permanent error or too many retries.
    OperationFailed {
        /// The failed operation.
        operation: OperationId,
        /// Its entity.
        entity: EntityRef,
        /// Why.
        reason: String,
        /// Whether the credentials were refused.
        auth: bool,
    },
    /// The server replaced a temporary id.
    IdReconciled {
        /// Type of the entity.
        entity_type: EntityType,
        /// The temporary id.
        temporary: EntityId,
        /// The real id.
        assigned: EntityId,
    },
    /// Local state of the entity may be behind the server.
    RefreshRequired {
        /// The entity.
        entity: EntityRef,
    },
}

/// Result of one [`flush`](PushSyncOrchestrator::flush).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Rows confirmed by the server.
    pub completed: usize,
    /// Rows that failed transiently and went back to `Pending`.
    pub retried: usize,
    /// Rows that ended in `Failed` for reasons other than a conflict.
    pub failed: usize,
    /// Rows that ended in `Failed` because of a conflict.
    pub conflicts: usize,
    /// Draining passes run.
    pub passes: usize,
    /// True if another flush was already running.
    pub skipped: bool,
}

impl FlushReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Rows attempted.
    pub fn attempted(&self) -> usize {
        self.completed + self.retried + self.failed + self.conflicts
    }

    fn record(&mut self, attempt: Attempt) {
        match attempt {
            Attempt::Completed => self.completed += 1,
            Attempt::Retried => self.retried += 1,
            Attempt::Failed => self.failed += 1,
            Attempt::Conflict => self.conflicts += 1,
        }
    }
}

/// Cumulative counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Flushes that ran.
    pub flushes: u64,
    /// Rows confirmed.
    pub operations_completed: u64,
    /// Transient failures.
    pub operations_retried: u64,
    /// Rows that ended in `Failed`, conflicts excluded.
    pub operations_failed: u64,
    /// Conflicts detected.
    pub conflicts: u64,
    /// Temporary ids replaced.
    pub id_reconciliations: u64,
    /// End of the last flush.
    pub last_flush_at: Option<DateTime<Utc>>,
    /// Error that aborted the last failed flush.
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Completed,
    Retried,
    Failed,
    Conflict,
}

enum Precheck {
    Clear,
    AlreadyApplied,
    Conflict(String),
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drains the queue into the remote service.
pub struct PushSyncOrchestrator {
    queue: Arc<PendingOperationQueue>,
    store: Arc<dyn EntityStore>,
    remote: Arc<dyn RemoteService>,
    handlers: Arc<HandlerRegistry>,
    locks: Arc<EntityLocks>,
    batch_size: usize,
    max_concurrent: usize,
    running: AtomicBool,
    rerun: AtomicBool,
    notices: broadcast::Sender<SyncNotice>,
    stats: Mutex<SyncStats>,
}

impl PushSyncOrchestrator {
    /// Creates an orchestrator with a batch size of 32 and 4 workers.
    pub fn new(
        queue: Arc<PendingOperationQueue>,
        store: Arc<dyn EntityStore>,
        remote: Arc<dyn RemoteService>,
        handlers: Arc<HandlerRegistry>,
        locks: Arc<EntityLocks>,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            queue,
            store,
            remote,
            handlers,
            locks,
            batch_size: 32,
            max_concurrent: 4,
            running: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            notices,
            stats: Mutex::new(SyncStats::default()),
        }
    }

    /// Applies the batch size and worker count of `config`.
    pub fn with_config(mut self, config: &SyncConfig) -> Self {
        self.batch_size = config.batch_size.max(1);
        self.max_concurrent = config.max_concurrent_operations.max(1);
        self
    }

    /// Sets the number of operations executing at once.
    pub fn with_max_concurrent_operations(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    /// Subscribes to notices.
    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    /// Cumulative counters.
    pub fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }

    /// Returns true while a flush is running.
    pub fn is_flushing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn notify(&self, notice: SyncNotice) {
        // No receivers is fine.
        let _ = self.notices.send(notice);
    }

    /// Drains the queue.
    ///
    /// A call made while another flush runs returns a skipped report at once
    /// and makes the running flush do one more pass when it is done.
    pub async fn flush(&self) -> SyncResult<FlushReport> {
        if !self.try_acquire() {
            debug!("flush already running, scheduling a re-check pass");
            return Ok(FlushReport::skipped());
        }
        self.flush_held().await
    }

    /// Claims the flush slot, leaving a rerun request when it is taken.
    ///
    /// The holder may release between the failed claim and the request, so
    /// the claim is retried until either it succeeds or the slot is seen
    /// held after the request was stored.
    fn try_acquire(&self) -> bool {
        loop {
            if !self.running.swap(true, Ordering::SeqCst) {
                return true;
            }
            self.rerun.store(true, Ordering::SeqCst);
            if self.running.load(Ordering::SeqCst) {
                return false;
            }
        }
    }

    /// Runs passes while holding the slot. A rerun request that arrives
    /// while the slot is being released is picked up by reclaiming it.
    async fn flush_held(&self) -> SyncResult<FlushReport> {
        let mut report = FlushReport::default();
        let result = loop {
            let drained = {
                let _guard = RunningGuard(&self.running);
                self.drain_until_quiet(&mut report).await
            };
            if drained.is_err() || !(self.rerun.load(Ordering::SeqCst) && self.try_acquire()) {
                break drained;
            }
            debug!("rerun requested while releasing, draining again");
        };

        let mut stats = self.stats.lock();
        stats.flushes += 1;
        stats.operations_completed += report.completed as u64;
        stats.operations_retried += report.retried as u64;
        stats.operations_failed += report.failed as u64;
        stats.conflicts += report.conflicts as u64;
        stats.last_flush_at = Some(Utc::now());
        match result {
            Ok(()) => {
                stats.last_error = None;
                if report.attempted() > 0 {
                    info!(
                        completed = report.completed,
                        retried = report.retried,
                        failed = report.failed,
                        conflicts = report.conflicts,
                        passes = report.passes,
                        "flush finished"
                    );
                }
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "flush aborted");
                stats.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn drain_until_quiet(&self, report: &mut FlushReport) -> SyncResult<()> {
        loop {
            self.rerun.store(false, Ordering::SeqCst);
            report.passes += 1;
            self.drain_pass(report).await?;
            if !self.rerun.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    async fn drain_pass(&self, report: &mut FlushReport) -> SyncResult<()> {
        let mut attempted = HashSet::new();
        loop {
            let batch = self
                .queue
                .next_batch_excluding(self.batch_size, &attempted)
                .await?;
            if batch.is_empty() {
                return Ok(());
            }
            attempted.extend(batch.iter().map(|op| op.id));
            let attempts: Vec<Attempt> = stream::iter(batch)
                .map(|op| self.process(op))
                .buffer_unordered(self.max_concurrent)
                .collect()
                .await;
            for attempt in attempts {
                report.record(attempt);
            }
        }
    }

    async fn process(&self, op: PendingOperation) -> Attempt {
        match self.try_process(&op).await {
            Ok(attempt) => attempt,
            Err(e) => {
                // Bad payloads never improve; anything else may be local trouble.
                let retryable = !matches!(
                    e,
                    SyncError::Payload(_) | SyncError::Protocol(_) | SyncError::NoHandler(_)
                );
                warn!(id = %op.id, kind = %op.kind, error = %e, retryable, "operation failed locally");
                self.record_failure(&op, e.to_string(), retryable, false).await
            }
        }
    }

    async fn try_process(&self, op: &PendingOperation) -> SyncResult<Attempt> {
        let handler = self.handlers.for_kind(op.kind)?;
        let payload = handler.deserialize(op.kind, &op.payload)?;

        let precheck = {
            let _guard = self.locks.lock(&op.entity).await;
            self.precheck(op)?
        };
        match precheck {
            Precheck::Clear => {}
            Precheck::AlreadyApplied => {
                debug!(id = %op.id, entity = %op.entity, "entity already gone, delete completed");
                self.queue.mark_completed(op.id).await?;
                return Ok(Attempt::Completed);
            }
            Precheck::Conflict(reason) => {
                warn!(id = %op.id, kind = %op.kind, entity = %op.entity, %reason, "conflict");
                self.queue.mark_failed(op.id, reason.clone(), false).await?;
                self.notify(SyncNotice::Conflict {
                    operation: op.id,
                    entity: op.entity.clone(),
                    reason,
                });
                return Ok(Attempt::Conflict);
            }
        }

        debug!(id = %op.id, kind = %op.kind, entity = %op.entity, attempt = op.attempt_count + 1, "executing operation");
        match handler.execute(op, &payload, self.remote.as_ref()).await {
            Ok(outcome) => {
                self.confirm(op, handler.as_ref(), &payload, outcome).await?;
                Ok(Attempt::Completed)
            }
            Err(e) => {
                let retryable = e.is_retryable();
                let auth = e.is_auth();
                Ok(self.record_failure(op, e.to_string(), retryable, auth).await)
            }
        }
    }

    fn precheck(&self, op: &PendingOperation) -> SyncResult<Precheck> {
        if op.kind == OperationKind::CreateEntity {
            return Ok(Precheck::Clear);
        }
        let Some(current) = self.store.get(&op.entity)? else {
            if op.kind == OperationKind::DeleteEntity {
                return Ok(Precheck::AlreadyApplied);
            }
            return Ok(Precheck::Conflict(format!(
                "Conflict: {} no longer exists",
                op.entity
            )));
        };
        let base = op.base_version.unwrap_or(0);
        if current.server_version > base {
            return Ok(Precheck::Conflict(format!(
                "Conflict: server version {} is newer than base {base}",
                current.server_version
            )));
        }
        Ok(Precheck::Clear)
    }

    async fn record_failure(
        &self,
        op: &PendingOperation,
        reason: String,
        retryable: bool,
        auth: bool,
    ) -> Attempt {
        let status = match self.queue.mark_failed(op.id, reason.clone(), retryable).await {
            Ok(status) => status,
            Err(e) => {
                warn!(id = %op.id, error = %e, "could not record failure");
                return Attempt::Failed;
            }
        };
        if status == OperationStatus::Pending {
            debug!(id = %op.id, %reason, "operation will be retried");
            return Attempt::Retried;
        }
        warn!(id = %op.id, kind = %op.kind, entity = %op.entity, %reason, "operation failed");
        self.notify(SyncNotice::OperationFailed {
            operation: op.id,
            entity: op.entity.clone(),
            reason,
            auth,
        });
        Attempt::Failed
    }

    async fn confirm(
        &self,
        op: &PendingOperation,
        handler: &dyn OperationHandler,
        payload: &OperationPayload,
        outcome: ExecuteOutcome,
    ) -> SyncResult<()> {
        let _guard = self.locks.lock(&op.entity).await;
        let mut entity = op.entity.clone();
        for mapping in &outcome.id_mappings {
            self.reconcile(op.id, mapping).await?;
            if entity.entity_type == mapping.entity_type && entity.id == mapping.temporary {
                entity = entity.with_id(mapping.assigned.clone());
            }
        }

        let version = outcome.server_version;
        self.store.modify(&entity, &mut |row| {
            apply_fields(&mut row.fields, &outcome.field_corrections);
            if let Some(version) = version {
                row.server_version = row.server_version.max(version);
            }
        })?;
        handler.apply_confirmed(&entity, payload, &outcome, self.store.as_ref())?;
        if let Some(version) = version {
            self.queue.rebase(&entity, version).await?;
        }
        self.queue.mark_completed(op.id).await?;
        if !self.queue.has_outstanding(&entity) {
            self.store.set_sync_state(&entity, SyncState::Synced)?;
        }
        debug!(id = %op.id, %entity, version = ?version, "operation confirmed");
        Ok(())
    }

    /// Replaces a temporary id everywhere: store rows and references, queue
    /// targets and queued payloads.
    async fn reconcile(&self, confirmed: OperationId, mapping: &IdMapping) -> SyncResult<()> {
        let IdMapping {
            entity_type,
            temporary,
            assigned,
        } = mapping;
        let rows = self
            .store
            .rewrite_references(*entity_type, temporary, assigned)?;
        let retargeted = self
            .queue
            .rewrite_entity_id(*entity_type, temporary, assigned)
            .await?;

        let mut payloads = 0;
        for row in self.queue.list() {
            if row.id == confirmed {
                continue;
            }
            let handler = self.handlers.for_kind(row.kind)?;
            if let Some(bytes) = handler.rewrite_payload(row.kind, &row.payload, temporary, assigned)? {
                self.queue.replace_payload(row.id, bytes).await?;
                payloads += 1;
            }
        }

        info!(%entity_type, %temporary, %assigned, rows, retargeted, payloads, "temporary id reconciled");
        self.stats.lock().id_reconciliations += 1;
        self.notify(SyncNotice::IdReconciled {
            entity_type: *entity_type,
            temporary: temporary.clone(),
            assigned: assigned.clone(),
        });
        Ok(())
    }
}

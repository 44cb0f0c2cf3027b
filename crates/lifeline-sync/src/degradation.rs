//! Store health monitoring and graph reconciliation.
//!
//! Two timers poll the stores independently. Graph mutations that could not
//! be written while the graph store was down wait in a bounded queue and are
//! replayed in batches once a graph health check succeeds.

use chrono::Utc;
use lifeline_core::{
    DeferredGraphWrite, DegradationConfig, DocumentStore, GraphStore, HealthReport,
    ServiceStatus, ServiceStatusReport, StoreKind, StoreResult, SyncError, UnsyncedOperation,
    UnsyncedStats,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::apply::{roll_back, run_graph_mutations};
use crate::queue::UnsyncedQueue;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub synced: usize,
    pub requeued: usize,
    pub permanently_failed: usize,
}

/// Watches store availability and replays deferred graph mutations.
pub struct DegradationService {
    config: DegradationConfig,
    document: Arc<dyn DocumentStore>,
    graph: Arc<dyn GraphStore>,
    queue: Mutex<UnsyncedQueue>,
    document_status: RwLock<ServiceStatus>,
    graph_status: RwLock<ServiceStatus>,
    draining: AtomicBool,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

/// Clears the drain flag when a drain pass ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DegradationService {
    /// Create a service. Nothing runs until [`DegradationService::start`].
    ///
    /// Construction does not contact the stores: both report unavailable
    /// until the first check, which `start` runs immediately. Callers that
    /// need a status before starting the timers call
    /// [`DegradationService::check_document_health`] and
    /// [`DegradationService::check_graph_health`] themselves.
    pub fn new(
        config: DegradationConfig,
        document: Arc<dyn DocumentStore>,
        graph: Arc<dyn GraphStore>,
    ) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            config,
            document,
            graph,
            queue: Mutex::new(UnsyncedQueue::new()),
            document_status: RwLock::new(ServiceStatus::unknown(now)),
            graph_status: RwLock::new(ServiceStatus::unknown(now)),
            draining: AtomicBool::new(false),
            timers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &DegradationConfig {
        &self.config
    }

    /// Spawn both health-check timers. Each checks once immediately.
    ///
    /// Calling `start` on a running service does nothing. The timers hold a
    /// weak reference and exit once the service is dropped.
    pub fn start(self: &Arc<Self>) {
        let mut timers = lock(&self.timers);
        if !timers.is_empty() {
            debug!("Degradation service already started");
            return;
        }

        timers.push(spawn_timer(
            Arc::downgrade(self),
            self.config.graph_health_check_interval(),
            StoreKind::Graph,
        ));
        timers.push(spawn_timer(
            Arc::downgrade(self),
            self.config.doc_health_check_interval(),
            StoreKind::Document,
        ));

        info!(
            graph_interval_ms = self.config.graph_health_check_interval_ms,
            doc_interval_ms = self.config.doc_health_check_interval_ms,
            background_sync = self.config.enable_background_sync,
            "Degradation service started"
        );
    }

    /// Cancel both timers. Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        let timers: Vec<_> = lock(&self.timers).drain(..).collect();
        if timers.is_empty() {
            return;
        }
        for timer in timers {
            timer.abort();
        }
        info!("Degradation service stopped");
    }

    pub fn is_running(&self) -> bool {
        !lock(&self.timers).is_empty()
    }

    /// Probe the graph store and drain the queue if it is reachable.
    pub async fn check_graph_health(&self) -> ServiceStatus {
        let status = probe(self.graph.health_check()).await;
        let was_available = self.record_status(StoreKind::Graph, &status);

        if status.available && !was_available {
            info!(queued = self.queue_len(), "Graph store recovered");
        }
        if status.available && self.queue_len() > 0 {
            if self.config.enable_background_sync {
                self.drain().await;
            } else {
                debug!("Background sync disabled; leaving queue untouched");
            }
        }

        status
    }

    /// Probe the document store.
    pub async fn check_document_health(&self) -> ServiceStatus {
        let status = probe(self.document.health_check()).await;
        self.record_status(StoreKind::Document, &status);
        status
    }

    /// Queue the graph half of a write for later replay.
    ///
    /// Returns the queued entry's id, or `None` when background sync is
    /// disabled. A full queue drops its oldest entries to make room.
    pub fn queue_unsynced_operation(&self, write: DeferredGraphWrite) -> Option<String> {
        if !self.config.enable_background_sync {
            warn!(
                entity_id = %write.entity_id,
                kind = %write.kind,
                "Background sync disabled; graph mutation will not be replayed"
            );
            return None;
        }

        let mut queue = lock(&self.queue);
        let (entry, evicted) = queue.push(write, Utc::now());
        let id = entry.id.clone();
        let entity_id = entry.entity_id.clone();
        let queued = queue.len();
        drop(queue);

        if !evicted.is_empty() {
            warn!(
                evicted = evicted.len(),
                oldest = %evicted[0].id,
                "Unsynced queue full; dropped oldest operations"
            );
        }
        debug!(operation_id = %id, entity_id = %entity_id, queued, "Queued unsynced graph operation");
        Some(id)
    }

    /// Replay up to `sync_batch_size` queued operations.
    ///
    /// Runs from the graph health tick, or from the coordinator ahead of a
    /// graph-required write. The graph status is not checked first. A pass that
    /// starts while another is in progress returns an empty report at once.
    pub async fn drain(&self) -> DrainReport {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already in progress");
            return DrainReport::default();
        }
        let _guard = DrainGuard(&self.draining);

        let batch = lock(&self.queue).pop_batch(self.config.sync_batch_size);
        if batch.is_empty() {
            return DrainReport::default();
        }

        let mut report = DrainReport::default();
        let mut retry = Vec::new();
        let mut pending = batch.into_iter();
        let started = Instant::now();

        while let Some(mut op) = pending.next() {
            report.attempted += 1;
            match self.replay(&op).await {
                Ok(()) => {
                    report.synced += 1;
                    debug!(operation_id = %op.id, entity_id = %op.entity_id, "Replayed unsynced operation");
                }
                Err(err) => {
                    let graph_down = matches!(err, SyncError::StoreUnavailable { .. });
                    op.retry_count += 1;
                    op.last_error = Some(err.to_string());

                    if op.retry_count < self.config.max_retry_attempts {
                        debug!(operation_id = %op.id, retry_count = op.retry_count, error = %err, "Replay failed; will retry");
                        retry.push(op);
                    } else {
                        let failure = SyncError::PermanentSyncFailure {
                            operation_id: op.id.clone(),
                            entity_id: op.entity_id.clone(),
                            retry_count: op.retry_count,
                            reason: err.to_string(),
                        };
                        error!(error = %failure, kind = %op.kind, collection = %op.collection, "Permanent sync failure");
                        lock(&self.queue).record_permanent_failure();
                        report.permanently_failed += 1;
                    }

                    // The rest of the batch would fail the same way.
                    if graph_down {
                        warn!(error = %err, "Graph store unreachable during drain; stopping pass");
                        break;
                    }
                }
            }
        }

        // Untouched entries go back too, behind the ones that just failed.
        retry.extend(pending);
        report.requeued = retry.len();
        let mut queue = lock(&self.queue);
        queue.requeue_front(retry);
        queue.finish_batch();
        drop(queue);

        info!(
            attempted = report.attempted,
            synced = report.synced,
            requeued = report.requeued,
            permanently_failed = report.permanently_failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Drain pass complete"
        );
        report
    }

    /// Apply one queued operation in its own graph transaction.
    async fn replay(&self, op: &UnsyncedOperation) -> Result<(), SyncError> {
        let mut txn = self
            .graph
            .open_transaction()
            .await
            .map_err(|source| SyncError::StoreUnavailable {
                store: StoreKind::Graph,
                source,
            })?;

        if let Err(source) = run_graph_mutations(txn.as_mut(), &op.replay_mutations()).await {
            roll_back(None, Some(txn)).await;
            return Err(SyncError::OperationExecution {
                store: StoreKind::Graph,
                index: 0,
                kind: op.kind,
                collection: op.collection.clone(),
                entity_id: op.entity_id.clone(),
                source,
            });
        }

        txn.commit().await.map_err(|source| SyncError::Commit {
            store: StoreKind::Graph,
            source,
        })
    }

    pub fn service_status(&self) -> ServiceStatusReport {
        ServiceStatusReport {
            document_store: read_status(&self.document_status),
            graph_store: read_status(&self.graph_status),
        }
    }

    pub fn unsynced_stats(&self) -> UnsyncedStats {
        lock(&self.queue).stats()
    }

    /// Snapshot of queued operations, oldest first.
    pub fn unsynced_operations(&self) -> Vec<UnsyncedOperation> {
        lock(&self.queue).iter().cloned().collect()
    }

    /// Drop every queued operation, returning how many were removed.
    pub fn clear_unsynced_operations(&self) -> usize {
        let removed = lock(&self.queue).clear();
        if removed > 0 {
            warn!(removed, "Cleared unsynced operation queue");
        }
        removed
    }

    pub fn is_graph_available(&self) -> bool {
        read_status(&self.graph_status).available
    }

    pub fn is_document_available(&self) -> bool {
        read_status(&self.document_status).available
    }

    /// True while a graph write for `entity_id` is queued or being replayed.
    ///
    /// Direct graph writes for such an entity must wait behind it, or the
    /// replay would overwrite them.
    pub fn has_pending(&self, entity_id: &str) -> bool {
        lock(&self.queue).has_pending(entity_id)
    }

    fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Store the new status, logging transitions. Returns the previous availability.
    fn record_status(&self, store: StoreKind, status: &ServiceStatus) -> bool {
        let slot = match store {
            StoreKind::Document => &self.document_status,
            StoreKind::Graph => &self.graph_status,
        };
        let mut current = slot.write().unwrap_or_else(PoisonError::into_inner);
        let was_available = current.available;
        *current = status.clone();
        drop(current);

        match (was_available, status.available) {
            (true, false) => warn!(
                store = %store,
                error = status.error.as_deref().unwrap_or("unknown"),
                "Store became unavailable"
            ),
            (false, true) => info!(store = %store, latency_ms = status.latency_ms, "Store available"),
            (false, false) => debug!(
                store = %store,
                error = status.error.as_deref().unwrap_or("unknown"),
                "Store still unavailable"
            ),
            (true, true) => debug!(store = %store, latency_ms = status.latency_ms, "Store healthy"),
        }
        was_available
    }
}

impl Drop for DegradationService {
    fn drop(&mut self) {
        for timer in lock(&self.timers).drain(..) {
            timer.abort();
        }
    }
}

fn read_status(slot: &RwLock<ServiceStatus>) -> ServiceStatus {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Turn a health probe into a status; an error counts as unavailable.
async fn probe(
    check: impl std::future::Future<Output = StoreResult<HealthReport>>,
) -> ServiceStatus {
    let checked_at = Utc::now();
    match check.await {
        Ok(report) if report.is_healthy() => ServiceStatus {
            available: true,
            last_checked: checked_at,
            error: None,
            latency_ms: report.latency_ms,
        },
        Ok(report) => ServiceStatus {
            available: false,
            last_checked: checked_at,
            error: Some(report.error.unwrap_or_else(|| "unhealthy".to_string())),
            latency_ms: report.latency_ms,
        },
        Err(err) => ServiceStatus {
            available: false,
            last_checked: checked_at,
            error: Some(err.to_string()),
            latency_ms: None,
        },
    }
}

fn spawn_timer(service: Weak<DegradationService>, period: Duration, store: StoreKind) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(service) = service.upgrade() else {
                break;
            };
            match store {
                StoreKind::Graph => {
                    service.check_graph_health().await;
                }
                StoreKind::Document => {
                    service.check_document_health().await;
                }
            }
        }
    })
}

//! Dual-store transaction coordinator.
//!
//! Every call opens its own document and graph transactions, applies the
//! whole batch to both, and commits both or aborts both. Failed attempts are
//! retried with linear backoff. When the graph store cannot be reached and
//! degradation is allowed, the write completes against the document store
//! and the graph half is queued on the [`DegradationService`].

use chrono::Utc;
use lifeline_core::model::{fields, timestamp};
use lifeline_core::{
    CoordinatorConfig, Document, DocumentStore, DocumentTransaction, GraphStore,
    GraphTransaction, Properties, RelationshipSpec, StoreError, StoreKind, SyncError,
    TransactionResult, WriteOperation,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::apply::{roll_back, run_graph_mutations};
use crate::degradation::DegradationService;

/// Per-call overrides of the coordinator defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    pub retry_attempts: Option<u32>,
    pub graceful_degradation: Option<bool>,
    pub graph_store_required: Option<bool>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }

    pub fn graceful_degradation(mut self, enabled: bool) -> Self {
        self.graceful_degradation = Some(enabled);
        self
    }

    pub fn require_graph_store(mut self) -> Self {
        self.graph_store_required = Some(true);
        self
    }
}

/// Options resolved against the coordinator config.
#[derive(Debug, Clone, Copy)]
struct Settings {
    attempts: u32,
    graceful_degradation: bool,
    graph_store_required: bool,
    base_delay: Duration,
}

impl Settings {
    fn may_degrade(&self) -> bool {
        self.graceful_degradation && !self.graph_store_required
    }
}

/// Input for [`TransactionCoordinator::create_entity`].
#[derive(Debug, Clone, Default)]
pub struct CreateEntity {
    pub collection: String,
    pub data: Document,
    pub graph_labels: Vec<String>,
    pub graph_properties: Properties,
    pub relationships: Vec<RelationshipSpec>,
}

impl CreateEntity {
    pub fn new(collection: impl Into<String>, data: Document) -> Self {
        Self {
            collection: collection.into(),
            data,
            ..Self::default()
        }
    }

    pub fn labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.graph_labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn graph_properties(mut self, properties: Properties) -> Self {
        self.graph_properties = properties;
        self
    }

    pub fn relationship(mut self, relationship: RelationshipSpec) -> Self {
        self.relationships.push(relationship);
        self
    }
}

/// Input for [`TransactionCoordinator::update_entity`].
#[derive(Debug, Clone, Default)]
pub struct UpdateEntity {
    pub collection: String,
    pub entity_id: String,
    pub data: Document,
    pub graph_properties: Properties,
    pub relationships: Vec<RelationshipSpec>,
}

impl UpdateEntity {
    pub fn new(collection: impl Into<String>, entity_id: impl Into<String>, data: Document) -> Self {
        Self {
            collection: collection.into(),
            entity_id: entity_id.into(),
            data,
            ..Self::default()
        }
    }

    pub fn graph_properties(mut self, properties: Properties) -> Self {
        self.graph_properties = properties;
        self
    }

    pub fn relationship(mut self, relationship: RelationshipSpec) -> Self {
        self.relationships.push(relationship);
        self
    }
}

enum AttemptOutcome {
    Committed {
        document_results: Vec<Value>,
        graph_results: Vec<Value>,
        deferred: usize,
    },
    Failed {
        error: SyncError,
        rollback_errors: Vec<SyncError>,
    },
    /// The document store committed but the graph store did not; not retryable.
    PartialCommit(SyncError),
}

pub struct TransactionCoordinator {
    document: Arc<dyn DocumentStore>,
    graph: Arc<dyn GraphStore>,
    degradation: Option<Arc<DegradationService>>,
    config: CoordinatorConfig,
}

impl TransactionCoordinator {
    pub fn new(
        document: Arc<dyn DocumentStore>,
        graph: Arc<dyn GraphStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            document,
            graph,
            degradation: None,
            config,
        }
    }

    /// Attach the service that receives graph mutations skipped during an outage.
    ///
    /// Without one, a graph outage fails the write as if the graph store were
    /// required.
    pub fn with_degradation(mut self, service: Arc<DegradationService>) -> Self {
        self.degradation = Some(service);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn degradation(&self) -> Option<&Arc<DegradationService>> {
        self.degradation.as_ref()
    }

    /// Apply a batch of writes to both stores.
    ///
    /// Never returns an error for store failures; they are reported in the
    /// result with `success == false`.
    pub async fn execute_transaction(
        &self,
        operations: Vec<WriteOperation>,
        options: TransactionOptions,
    ) -> TransactionResult {
        let settings = self.resolve(options);

        if operations.is_empty() {
            return TransactionResult {
                success: true,
                ..TransactionResult::default()
            };
        }
        if let Some(err) = operations.iter().find_map(|op| op.validate().err()) {
            warn!(error = %err, "Rejected transaction before touching either store");
            return TransactionResult::failure(err, 0, false);
        }

        let mut last_error = None;
        let mut rollback_errors = Vec::new();

        for attempt in 1..=settings.attempts {
            match self.attempt(&operations, &settings).await {
                AttemptOutcome::Committed {
                    document_results,
                    graph_results,
                    deferred,
                } => {
                    info!(
                        attempt,
                        operations = operations.len(),
                        deferred,
                        "Transaction committed"
                    );
                    return TransactionResult {
                        success: true,
                        document_results,
                        graph_results,
                        error: None,
                        rollback_performed: false,
                        attempts: attempt,
                        deferred_graph_operations: deferred,
                        entity_id: None,
                    };
                }
                AttemptOutcome::PartialCommit(err) => {
                    error!(attempt, error = %err, "Graph store diverged from committed document store");
                    return TransactionResult::failure(err, attempt, false);
                }
                AttemptOutcome::Failed {
                    error: err,
                    rollback_errors: errors,
                } => {
                    warn!(
                        attempt,
                        max_attempts = settings.attempts,
                        error = %err,
                        "Transaction attempt failed"
                    );
                    rollback_errors.extend(errors);
                    last_error = Some(err);

                    if attempt < settings.attempts {
                        let delay = settings.base_delay * attempt;
                        debug!(delay_ms = delay.as_millis() as u64, "Backing off before retry");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let err = SyncError::MaxRetriesExceeded {
            attempts: settings.attempts,
            last_error: Box::new(
                last_error.unwrap_or_else(|| SyncError::validation("no attempt was made")),
            ),
            rollback_errors,
        };
        error!(error = %err, "Transaction failed");
        TransactionResult::failure(err, settings.attempts, true)
    }

    /// Create a new entity in both stores under a generated id.
    pub async fn create_entity(
        &self,
        request: CreateEntity,
        options: TransactionOptions,
    ) -> TransactionResult {
        let entity_id = Uuid::new_v4().to_string();
        let now = Value::String(timestamp(Utc::now()));

        let mut document = request.data;
        document.insert(fields::ID.to_string(), Value::String(entity_id.clone()));
        document.insert(fields::CREATED_AT.to_string(), now.clone());
        document.insert(fields::UPDATED_AT.to_string(), now);
        document.insert(fields::VERSION.to_string(), Value::from(1));
        document.insert(fields::IS_DELETED.to_string(), Value::Bool(false));

        let op = WriteOperation::create(
            request.collection.as_str(),
            entity_id.as_str(),
            document,
            request.graph_labels,
            request.graph_properties,
        )
        .with_relationships(request.relationships);

        let mut result = self.execute_transaction(vec![op], options).await;
        if result.success {
            info!(collection = %request.collection, entity_id = %entity_id, "Entity created");
            result.entity_id = Some(entity_id);
        }
        result
    }

    /// Set fields on an entity; bumps `version` and refreshes `updatedAt`.
    pub async fn update_entity(
        &self,
        request: UpdateEntity,
        options: TransactionOptions,
    ) -> TransactionResult {
        let op = WriteOperation::update(
            request.collection,
            request.entity_id,
            request.data,
            request.graph_properties,
        )
        .with_relationships(request.relationships);
        self.execute_transaction(vec![op], options).await
    }

    /// Soft-delete an entity in both stores.
    pub async fn delete_entity(
        &self,
        collection: &str,
        entity_id: &str,
        options: TransactionOptions,
    ) -> TransactionResult {
        let op = WriteOperation::delete(collection, entity_id);
        self.execute_transaction(vec![op], options).await
    }

    fn resolve(&self, options: TransactionOptions) -> Settings {
        Settings {
            attempts: options
                .retry_attempts
                .unwrap_or(self.config.retry_attempts)
                .max(1),
            graceful_degradation: options
                .graceful_degradation
                .unwrap_or(self.config.graceful_degradation),
            graph_store_required: options
                .graph_store_required
                .unwrap_or(self.config.graph_store_required),
            base_delay: self.config.base_retry_delay(),
        }
    }

    fn can_defer(&self, settings: &Settings) -> bool {
        settings.may_degrade() && self.degradation.is_some()
    }

    /// True when an entity this batch writes or links to still has graph
    /// writes waiting in the reconciliation queue.
    fn has_queued_writes(&self, operations: &[WriteOperation]) -> bool {
        let Some(service) = &self.degradation else {
            return false;
        };
        operations.iter().any(|op| {
            service.has_pending(&op.entity_id)
                || op
                    .relationships()
                    .iter()
                    .any(|rel| service.has_pending(&rel.target_entity_id))
        })
    }

    async fn attempt(&self, operations: &[WriteOperation], settings: &Settings) -> AttemptOutcome {
        let now = Utc::now();

        // Graph writes for an entity must land in order. With queued writes
        // ahead, either queue behind them or replay them first.
        let mut behind_queue = self.has_queued_writes(operations);
        if behind_queue && !self.can_defer(settings) {
            if let Some(service) = &self.degradation {
                service.drain().await;
            }
            behind_queue = self.has_queued_writes(operations);
            if behind_queue {
                return AttemptOutcome::Failed {
                    error: SyncError::StoreUnavailable {
                        store: StoreKind::Graph,
                        source: StoreError::Conflict(
                            "earlier graph writes for these entities are still queued".to_string(),
                        ),
                    },
                    rollback_errors: Vec::new(),
                };
            }
        }

        let mut document_txn = match self.document.open_transaction().await {
            Ok(txn) => txn,
            Err(source) => {
                return AttemptOutcome::Failed {
                    error: SyncError::StoreUnavailable {
                        store: StoreKind::Document,
                        source,
                    },
                    rollback_errors: Vec::new(),
                };
            }
        };

        let open_graph = if behind_queue {
            debug!("Graph writes queued for these entities; deferring behind them");
            Ok(None)
        } else {
            self.graph.open_transaction().await.map(Some)
        };
        let mut graph_txn = match open_graph {
            Ok(txn) => txn,
            Err(source) if self.can_defer(settings) => {
                warn!(error = %source, "Graph store unavailable; writing document store only");
                None
            }
            Err(source) => {
                let rollback_errors = roll_back(Some(document_txn), None).await;
                return AttemptOutcome::Failed {
                    error: SyncError::StoreUnavailable {
                        store: StoreKind::Graph,
                        source,
                    },
                    rollback_errors,
                };
            }
        };

        let applied = apply_operations(
            operations,
            now,
            document_txn.as_mut(),
            graph_txn.as_deref_mut(),
        )
        .await;
        let (document_results, graph_results) = match applied {
            Ok(results) => results,
            Err(err) => {
                let rollback_errors = roll_back(Some(document_txn), graph_txn).await;
                return AttemptOutcome::Failed {
                    error: err,
                    rollback_errors,
                };
            }
        };

        if let Err(source) = document_txn.commit().await {
            let rollback_errors = roll_back(None, graph_txn).await;
            return AttemptOutcome::Failed {
                error: SyncError::Commit {
                    store: StoreKind::Document,
                    source,
                },
                rollback_errors,
            };
        }

        let deferred = match graph_txn {
            Some(txn) => match txn.commit().await {
                Ok(()) => 0,
                Err(source) if self.can_defer(settings) => {
                    warn!(error = %source, "Graph commit failed after document commit; deferring graph mutations");
                    self.defer(operations, now)
                }
                Err(source) => {
                    return AttemptOutcome::PartialCommit(SyncError::PartialCommit {
                        store: StoreKind::Graph,
                        source,
                    });
                }
            },
            None => self.defer(operations, now),
        };

        AttemptOutcome::Committed {
            document_results,
            graph_results,
            deferred,
        }
    }

    /// Queue the graph half of each operation; returns how many were queued.
    fn defer(&self, operations: &[WriteOperation], now: chrono::DateTime<Utc>) -> usize {
        let Some(service) = &self.degradation else {
            return 0;
        };
        operations
            .iter()
            .filter_map(|op| service.queue_unsynced_operation(op.deferred_graph_write(now)))
            .count()
    }
}

/// Apply every operation in caller order: document first, then its graph statements.
async fn apply_operations(
    operations: &[WriteOperation],
    now: chrono::DateTime<Utc>,
    document: &mut (dyn DocumentTransaction + '_),
    mut graph: Option<&mut (dyn GraphTransaction + '_)>,
) -> Result<(Vec<Value>, Vec<Value>), SyncError> {
    let mut document_results = Vec::with_capacity(operations.len());
    let mut graph_results = Vec::new();

    for (index, op) in operations.iter().enumerate() {
        let result = document
            .run(&op.document_mutation(now))
            .await
            .map_err(|source| execution_error(StoreKind::Document, index, op, source))?;
        document_results.push(result);

        if let Some(txn) = graph.as_deref_mut() {
            let result = run_graph_mutations(txn, &op.graph_mutations(now))
                .await
                .map_err(|source| execution_error(StoreKind::Graph, index, op, source))?;
            graph_results.push(result);
        }
    }

    Ok((document_results, graph_results))
}

fn execution_error(
    store: StoreKind,
    index: usize,
    op: &WriteOperation,
    source: StoreError,
) -> SyncError {
    SyncError::OperationExecution {
        store,
        index,
        kind: op.kind(),
        collection: op.collection.clone(),
        entity_id: op.entity_id.clone(),
        source,
    }
}

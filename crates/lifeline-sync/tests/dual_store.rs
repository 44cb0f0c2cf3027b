use async_trait::async_trait;
use lifeline_core::memory::{MemoryDocumentStore, MemoryGraphStore};
use lifeline_core::{
    CoordinatorConfig, DegradationConfig, Document, DocumentMutation, DocumentStore,
    DocumentTransaction, HealthReport, OperationKind, Properties, RelationshipSpec, StoreResult,
    SyncError, WriteOperation,
};
use lifeline_sync::{
    CreateEntity, DegradationService, TransactionCoordinator, TransactionOptions, UpdateEntity,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Harness {
    document: MemoryDocumentStore,
    graph: MemoryGraphStore,
    service: Arc<DegradationService>,
    coordinator: TransactionCoordinator,
}

fn harness(degradation: DegradationConfig) -> Harness {
    let document = MemoryDocumentStore::new();
    let graph = MemoryGraphStore::new();
    let service = DegradationService::new(
        degradation,
        Arc::new(document.clone()),
        Arc::new(graph.clone()),
    );
    let coordinator = TransactionCoordinator::new(
        Arc::new(document.clone()),
        Arc::new(graph.clone()),
        CoordinatorConfig::default(),
    )
    .with_degradation(Arc::clone(&service));
    Harness {
        document,
        graph,
        service,
        coordinator,
    }
}

fn data(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn create(id: &str) -> WriteOperation {
    WriteOperation::create(
        "events",
        id,
        data(json!({"title": id})),
        vec!["Event".to_string()],
        Properties::new(),
    )
}

#[tokio::test]
async fn test_coffee_transaction_shares_id_and_timestamps() {
    let h = harness(DegradationConfig::default());

    let result = h
        .coordinator
        .create_entity(
            CreateEntity::new(
                "financial_transactions",
                data(json!({"amount": 100.50, "description": "Coffee"})),
            )
            .labels(["Transaction", "Financial"]),
            TransactionOptions::new(),
        )
        .await;

    assert!(result.success);
    let id = result.entity_id.expect("id on success");
    let doc = h.document.document("financial_transactions", &id).unwrap();
    let node = h.graph.node(&id).unwrap();

    assert_eq!(doc["amount"], json!(100.50));
    assert_eq!(doc["description"], json!("Coffee"));
    assert_eq!(doc["version"], json!(1));
    assert_eq!(doc["isDeleted"], json!(false));

    assert!(node.has_label("Entity"));
    assert!(node.has_label("Transaction"));
    assert!(node.has_label("Financial"));
    assert_eq!(node.properties["id"], json!(id));
    assert_eq!(node.properties["collection"], json!("financial_transactions"));
    assert_eq!(node.properties["isDeleted"], json!(false));
    assert_eq!(node.properties["createdAt"], doc["createdAt"]);
}

#[tokio::test]
async fn test_update_bumps_version_and_delete_is_soft() {
    let h = harness(DegradationConfig::default());
    let id = h
        .coordinator
        .create_entity(
            CreateEntity::new("tasks", data(json!({"title": "Draft"}))).labels(["Task"]),
            TransactionOptions::new(),
        )
        .await
        .entity_id
        .unwrap();

    for title in ["Review", "Ship"] {
        let mut props = Properties::new();
        props.insert("title".to_string(), json!(title));
        let result = h
            .coordinator
            .update_entity(
                UpdateEntity::new("tasks", id.as_str(), data(json!({"title": title, "version": 40})))
                    .graph_properties(props),
                TransactionOptions::new(),
            )
            .await;
        assert!(result.success);
    }

    let doc = h.document.document("tasks", &id).unwrap();
    assert_eq!(doc["version"], json!(3));
    assert_eq!(doc["title"], json!("Ship"));
    assert_eq!(h.graph.node(&id).unwrap().properties["title"], json!("Ship"));

    let result = h
        .coordinator
        .delete_entity("tasks", &id, TransactionOptions::new())
        .await;
    assert!(result.success);

    let doc = h.document.document("tasks", &id).unwrap();
    assert_eq!(doc["isDeleted"], json!(true));
    assert_eq!(doc["version"], json!(3));
    assert_eq!(doc["title"], json!("Ship"));
    assert_eq!(h.graph.node(&id).unwrap().properties["isDeleted"], json!(true));
}

#[tokio::test(start_paused = true)]
async fn test_failure_at_any_operation_leaves_both_stores_untouched() {
    for failing in ["e-0", "e-1", "e-2"] {
        let h = harness(DegradationConfig::default());
        h.graph.controls().fail_runs_for(Some(failing));

        let ops = vec![create("e-0"), create("e-1"), create("e-2")];
        let result = h
            .coordinator
            .execute_transaction(ops, TransactionOptions::new())
            .await;

        assert!(!result.success, "batch failing at {} succeeded", failing);
        assert!(result.rollback_performed);
        assert!(h.document.is_empty());
        assert_eq!(h.graph.node_count(), 0);
        assert_eq!(h.service.unsynced_stats().total_queued, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_document_failure_mid_batch_reports_operation() {
    let h = harness(DegradationConfig::default());
    let ops = vec![
        create("e-0"),
        WriteOperation::update("events", "missing", data(json!({"title": "x"})), Properties::new()),
        create("e-2"),
    ];

    let result = h
        .coordinator
        .execute_transaction(ops, TransactionOptions::new().retry_attempts(2))
        .await;

    assert_eq!(result.attempts, 2);
    match result.error {
        Some(SyncError::MaxRetriesExceeded { attempts, last_error, .. }) => {
            assert_eq!(attempts, 2);
            match *last_error {
                SyncError::OperationExecution { index, kind, ref entity_id, .. } => {
                    assert_eq!(index, 1);
                    assert_eq!(kind, OperationKind::Update);
                    assert_eq!(entity_id, "missing");
                }
                ref other => panic!("unexpected cause: {:?}", other),
            }
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(h.document.is_empty());
    assert_eq!(h.graph.node_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_count_never_exceeds_configured_bound() {
    for attempts in 1..=4u32 {
        let h = harness(DegradationConfig::default());
        h.document.controls().set_fail_commits(true);

        let result = h
            .coordinator
            .execute_transaction(
                vec![create("e-0")],
                TransactionOptions::new().retry_attempts(attempts),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts, attempts);
        assert_eq!(h.document.controls().opened_transactions(), attempts as usize);
        assert_eq!(h.document.controls().committed_transactions(), 0);
    }
}

#[tokio::test]
async fn test_degraded_writes_converge_after_recovery() {
    let h = harness(DegradationConfig::default());
    let anchor = h
        .coordinator
        .create_entity(
            CreateEntity::new("accounts", data(json!({"name": "Checking"}))).labels(["Account"]),
            TransactionOptions::new(),
        )
        .await
        .entity_id
        .unwrap();

    h.graph.controls().set_available(false);
    assert!(!h.service.check_graph_health().await.available);

    let mut ids = Vec::new();
    for amount in [5, 12, 40] {
        let result = h
            .coordinator
            .create_entity(
                CreateEntity::new("financial_transactions", data(json!({"amount": amount})))
                    .labels(["Transaction"])
                    .relationship(
                        RelationshipSpec::new("BELONGS_TO", anchor.as_str())
                            .with_target_labels(["Account"]),
                    ),
                TransactionOptions::new(),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.deferred_graph_operations, 1);
        ids.push(result.entity_id.unwrap());
    }
    let stats = h.service.unsynced_stats();
    assert_eq!(stats.total_queued, 3);
    assert_eq!(stats.counts_by_kind[&OperationKind::Create], 3);

    h.graph.controls().set_available(true);
    let status = h.service.check_graph_health().await;
    assert!(status.available);
    assert!(h.service.is_graph_available());
    assert_eq!(h.service.unsynced_stats().total_queued, 0);

    for id in &ids {
        let doc = h.document.document("financial_transactions", id).unwrap();
        let node = h.graph.node(id).expect("replayed node");
        assert_eq!(node.properties["id"], doc["id"]);
        assert!(node.has_label("Transaction"));
    }
    let relationships = h.graph.relationships();
    assert_eq!(relationships.len(), 3);
    assert!(relationships
        .iter()
        .all(|r| r.rel_type == "BELONGS_TO" && r.to_id == anchor));
}

#[tokio::test]
async fn test_queue_stays_bounded_through_long_outage() {
    let h = harness(DegradationConfig::default());
    h.graph.controls().set_available(false);

    for i in 0..1100 {
        let result = h
            .coordinator
            .execute_transaction(vec![create(&format!("e-{}", i))], TransactionOptions::new())
            .await;
        assert!(result.success);
    }

    let stats = h.service.unsynced_stats();
    assert_eq!(stats.total_queued, 1000);
    assert_eq!(stats.evicted_total, 100);
    assert_eq!(h.document.len(), 1100);

    let queued = h.service.unsynced_operations();
    assert_eq!(queued[0].entity_id, "e-100");
    assert_eq!(queued[999].entity_id, "e-1099");
}

#[tokio::test]
async fn test_replay_failures_drop_entry_after_max_attempts() {
    let h = harness(DegradationConfig {
        max_retry_attempts: 2,
        ..DegradationConfig::default()
    });
    h.graph.controls().set_available(false);

    let id = h
        .coordinator
        .create_entity(
            CreateEntity::new("events", data(json!({"title": "Poison"}))),
            TransactionOptions::new(),
        )
        .await
        .entity_id
        .unwrap();

    h.graph.controls().set_available(true);
    h.graph.controls().fail_runs_for(Some(&id));

    h.service.check_graph_health().await;
    let queued = h.service.unsynced_operations();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].retry_count, 1);
    assert!(queued[0].last_error.is_some());

    h.service.check_graph_health().await;
    let stats = h.service.unsynced_stats();
    assert_eq!(stats.total_queued, 0);
    assert_eq!(stats.permanently_failed_total, 1);

    // The document store keeps the write; only the graph half is lost.
    assert!(h.document.document("events", &id).is_some());
    assert!(h.graph.node(&id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_background_timers_reconcile_without_callers() {
    let h = harness(DegradationConfig {
        graph_health_check_interval_ms: 50,
        doc_health_check_interval_ms: 50,
        ..DegradationConfig::default()
    });
    h.graph.controls().set_available(false);

    let id = h
        .coordinator
        .create_entity(
            CreateEntity::new("events", data(json!({"title": "Offline"}))),
            TransactionOptions::new(),
        )
        .await
        .entity_id
        .unwrap();

    h.service.start();
    assert!(h.service.is_running());
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(h.service.is_document_available());
    assert!(!h.service.is_graph_available());

    h.graph.controls().set_available(true);
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(h.service.is_graph_available());
    assert_eq!(h.service.unsynced_stats().total_queued, 0);
    assert!(h.graph.node(&id).is_some());

    h.service.stop();
    h.service.stop();
    assert!(!h.service.is_running());
}

/// Commits a competing write just before the next transaction it hands out
/// commits, the way a concurrent writer would.
#[derive(Clone)]
struct RacingDocumentStore {
    inner: MemoryDocumentStore,
    competing: Arc<Mutex<Option<DocumentMutation>>>,
}

#[async_trait]
impl DocumentStore for RacingDocumentStore {
    async fn open_transaction(&self) -> StoreResult<Box<dyn DocumentTransaction>> {
        Ok(Box::new(RacingTransaction {
            txn: self.inner.open_transaction().await?,
            store: self.clone(),
        }))
    }

    async fn fetch(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        self.inner.fetch(collection, id).await
    }

    async fn health_check(&self) -> StoreResult<HealthReport> {
        self.inner.health_check().await
    }
}

struct RacingTransaction {
    txn: Box<dyn DocumentTransaction>,
    store: RacingDocumentStore,
}

#[async_trait]
impl DocumentTransaction for RacingTransaction {
    async fn run(&mut self, mutation: &DocumentMutation) -> StoreResult<Value> {
        self.txn.run(mutation).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let competing = self.store.competing.lock().unwrap().take();
        if let Some(mutation) = competing {
            let mut other = self.store.inner.open_transaction().await?;
            other.run(&mutation).await?;
            other.commit().await?;
        }
        self.txn.commit().await
    }

    async fn abort(self: Box<Self>) -> StoreResult<()> {
        self.txn.abort().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_update_is_retried_instead_of_lost() {
    let document = MemoryDocumentStore::new();
    let racing = RacingDocumentStore {
        inner: document.clone(),
        competing: Arc::new(Mutex::new(None)),
    };
    let coordinator = TransactionCoordinator::new(
        Arc::new(racing.clone()),
        Arc::new(MemoryGraphStore::new()),
        CoordinatorConfig::default(),
    );

    let id = coordinator
        .create_entity(
            CreateEntity::new("tasks", data(json!({"title": "Draft"}))),
            TransactionOptions::new(),
        )
        .await
        .entity_id
        .unwrap();

    *racing.competing.lock().unwrap() = Some(DocumentMutation::Update {
        collection: "tasks".to_string(),
        id: id.clone(),
        fields: data(json!({"reviewer": "kim"})),
        updated_at: "2026-01-01T00:00:00.000Z".to_string(),
    });

    let result = coordinator
        .update_entity(
            UpdateEntity::new("tasks", id.as_str(), data(json!({"title": "Final"}))),
            TransactionOptions::new(),
        )
        .await;

    assert!(result.success);
    assert_eq!(result.attempts, 2);
    let doc = document.document("tasks", &id).unwrap();
    assert_eq!(doc["version"], json!(3));
    assert_eq!(doc["title"], json!("Final"));
    assert_eq!(doc["reviewer"], json!("kim"));
}

fn title(value: &str) -> Properties {
    data(json!({ "title": value }))
}

#[tokio::test]
async fn test_delete_after_recovery_waits_behind_deferred_create() {
    let h = harness(DegradationConfig::default());
    h.graph.controls().set_available(false);

    let id = h
        .coordinator
        .create_entity(
            CreateEntity::new("events", data(json!({"title": "Launch"}))).labels(["Event"]),
            TransactionOptions::new(),
        )
        .await
        .entity_id
        .unwrap();

    // Graph is back, but no health tick has replayed the create yet.
    h.graph.controls().set_available(true);
    let result = h
        .coordinator
        .delete_entity("events", &id, TransactionOptions::new())
        .await;
    assert!(result.success);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.deferred_graph_operations, 1);
    assert_eq!(h.service.unsynced_stats().total_queued, 2);

    h.service.check_graph_health().await;
    assert_eq!(h.service.unsynced_stats().total_queued, 0);

    let doc = h.document.document("events", &id).unwrap();
    let node = h.graph.node(&id).unwrap();
    assert_eq!(doc["isDeleted"], json!(true));
    assert_eq!(node.properties["isDeleted"], json!(true));
    assert!(node.has_label("Event"));
}

#[tokio::test]
async fn test_direct_update_does_not_overtake_queued_update() {
    let h = harness(DegradationConfig::default());
    let id = h
        .coordinator
        .create_entity(
            CreateEntity::new("events", data(json!({"title": "Draft"}))),
            TransactionOptions::new(),
        )
        .await
        .entity_id
        .unwrap();

    h.graph.controls().set_available(false);
    let deferred = h
        .coordinator
        .update_entity(
            UpdateEntity::new("events", id.as_str(), title("A")).graph_properties(title("A")),
            TransactionOptions::new(),
        )
        .await;
    assert!(deferred.is_degraded());

    h.graph.controls().set_available(true);
    let later = h
        .coordinator
        .update_entity(
            UpdateEntity::new("events", id.as_str(), title("B")).graph_properties(title("B")),
            TransactionOptions::new(),
        )
        .await;
    assert!(later.success);
    assert_eq!(later.deferred_graph_operations, 1);

    h.service.check_graph_health().await;

    let doc = h.document.document("events", &id).unwrap();
    let node = h.graph.node(&id).unwrap();
    assert_eq!(doc["title"], json!("B"));
    assert_eq!(doc["version"], json!(3));
    assert_eq!(node.properties["title"], json!("B"));
    assert_eq!(h.service.unsynced_stats().total_queued, 0);
}

#[tokio::test]
async fn test_relationship_to_queued_entity_waits_for_its_node() {
    let h = harness(DegradationConfig::default());
    h.graph.controls().set_available(false);
    let account = h
        .coordinator
        .create_entity(
            CreateEntity::new("accounts", data(json!({"name": "Savings"}))).labels(["Account"]),
            TransactionOptions::new(),
        )
        .await
        .entity_id
        .unwrap();

    h.graph.controls().set_available(true);
    let result = h
        .coordinator
        .create_entity(
            CreateEntity::new("financial_transactions", data(json!({"amount": 3})))
                .labels(["Transaction"])
                .relationship(RelationshipSpec::new("BELONGS_TO", account.as_str())),
            TransactionOptions::new(),
        )
        .await;
    assert!(result.is_degraded());

    h.service.check_graph_health().await;
    let relationships = h.graph.relationships();
    assert_eq!(relationships.len(), 1);
    assert_eq!(relationships[0].to_id, account);
}

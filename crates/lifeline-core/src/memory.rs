//! In-process document and graph stores.
//!
//! Both implement the adapter traits with real transaction semantics
//! (staged writes, all-or-nothing commit) and expose [`FaultControls`] so an
//! outage, a failing statement or a failing commit can be switched on at will.
//! Used by the test suites and for running the layer without infrastructure.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{StoreError, StoreResult};
use crate::model::{fields, Direction, Document, BASE_LABEL};
use crate::store::{
    DocumentMutation, DocumentStore, DocumentTransaction, GraphMutation, GraphNode, GraphStore,
    GraphTransaction, HealthReport,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Switches for simulated failures, plus transaction counters.
#[derive(Debug, Default)]
pub struct FaultControls {
    unavailable: AtomicBool,
    health_check_errors: AtomicBool,
    fail_runs: AtomicBool,
    fail_commits: AtomicBool,
    fail_aborts: AtomicBool,
    fail_entity: Mutex<Option<String>>,
    opened: AtomicUsize,
    committed: AtomicUsize,
    aborted: AtomicUsize,
}

impl FaultControls {
    /// Down stores refuse new transactions and report unhealthy.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make `health_check` return an error instead of a report.
    pub fn set_health_check_errors(&self, enabled: bool) {
        self.health_check_errors.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_runs(&self, enabled: bool) {
        self.fail_runs.store(enabled, Ordering::SeqCst);
    }

    /// Fail only statements that touch the given entity.
    pub fn fail_runs_for(&self, entity_id: Option<&str>) {
        *lock(&self.fail_entity) = entity_id.map(str::to_string);
    }

    pub fn set_fail_commits(&self, enabled: bool) {
        self.fail_commits.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_aborts(&self, enabled: bool) {
        self.fail_aborts.store(enabled, Ordering::SeqCst);
    }

    pub fn opened_transactions(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn committed_transactions(&self) -> usize {
        self.committed.load(Ordering::SeqCst)
    }

    pub fn aborted_transactions(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    fn check_open(&self, store: &str) -> StoreResult<()> {
        if !self.is_available() {
            return Err(StoreError::Unavailable(format!("{} is down", store)));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn check_run(&self, entity_id: &str) -> StoreResult<()> {
        if self.fail_runs.load(Ordering::SeqCst) {
            return Err(StoreError::Query("statement rejected".to_string()));
        }
        if lock(&self.fail_entity).as_deref() == Some(entity_id) {
            return Err(StoreError::Query(format!("statement rejected for {}", entity_id)));
        }
        Ok(())
    }

    fn check_commit(&self) -> StoreResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Query("commit rejected".to_string()));
        }
        Ok(())
    }

    fn check_abort(&self) -> StoreResult<()> {
        if self.fail_aborts.load(Ordering::SeqCst) {
            return Err(StoreError::Query("abort rejected".to_string()));
        }
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn health(&self, store: &str) -> StoreResult<HealthReport> {
        if self.health_check_errors.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(format!("{} health probe failed", store)));
        }
        if !self.is_available() {
            return Ok(HealthReport::unhealthy(format!("{} is down", store)));
        }
        Ok(HealthReport::healthy(0))
    }
}

type DocumentKey = (String, String);

#[derive(Default)]
struct DocumentState {
    documents: Mutex<BTreeMap<DocumentKey, Document>>,
    controls: FaultControls,
}

/// Document store kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<DocumentState>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controls(&self) -> &FaultControls {
        &self.inner.controls
    }

    /// Committed document, if any.
    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        lock(&self.inner.documents)
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.documents).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn open_transaction(&self) -> StoreResult<Box<dyn DocumentTransaction>> {
        self.inner.controls.check_open("document store")?;
        Ok(Box::new(MemoryDocumentTransaction {
            state: Arc::clone(&self.inner),
            read: BTreeMap::new(),
            staged: BTreeMap::new(),
        }))
    }

    async fn fetch(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        Ok(self.document(collection, id))
    }

    async fn health_check(&self) -> StoreResult<HealthReport> {
        self.inner.controls.health("document store")
    }
}

/// Commit fails with a conflict if any document it wrote changed after it
/// was first read, so overlapping updates never lose a write.
struct MemoryDocumentTransaction {
    state: Arc<DocumentState>,
    /// Committed state of each key as first read; `None` when absent.
    read: BTreeMap<DocumentKey, Option<Document>>,
    staged: BTreeMap<DocumentKey, Document>,
}

#[async_trait]
impl DocumentTransaction for MemoryDocumentTransaction {
    async fn run(&mut self, mutation: &DocumentMutation) -> StoreResult<Value> {
        self.state.controls.check_run(mutation.id())?;

        let key = (mutation.collection().to_string(), mutation.id().to_string());
        let existing = match self.staged.get(&key) {
            Some(doc) => Some(doc.clone()),
            None => {
                let committed = lock(&self.state.documents).get(&key).cloned();
                self.read.insert(key.clone(), committed.clone());
                committed
            }
        };
        let next = mutation.apply_to(existing.as_ref())?;
        let version = next.get(fields::VERSION).cloned().unwrap_or(Value::Null);
        self.staged.insert(key, next);

        Ok(json!({
            "acknowledged": true,
            "operation": mutation.name(),
            "collection": mutation.collection(),
            "id": mutation.id(),
            "version": version,
        }))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryDocumentTransaction {
            state,
            read,
            staged,
        } = *self;
        state.controls.check_commit()?;

        let mut documents = lock(&state.documents);
        if let Some(((collection, id), _)) = read
            .iter()
            .find(|(key, seen)| documents.get(*key) != seen.as_ref())
        {
            return Err(StoreError::Conflict(format!(
                "document {}/{} changed since it was read",
                collection, id
            )));
        }
        documents.extend(staged);
        drop(documents);
        state.controls.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(self: Box<Self>) -> StoreResult<()> {
        self.state.controls.check_abort()
    }
}

/// An edge held by [`MemoryGraphStore`], stored in its outgoing direction.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRelationship {
    pub from_id: String,
    pub to_id: String,
    pub rel_type: String,
    pub properties: Document,
}

#[derive(Debug, Clone, Default)]
struct GraphData {
    nodes: BTreeMap<String, GraphNode>,
    relationships: Vec<MemoryRelationship>,
}

fn add_label(node: &mut GraphNode, label: &str) {
    if !node.has_label(label) {
        node.labels.push(label.to_string());
    }
}

impl GraphData {
    fn apply(&mut self, mutation: &GraphMutation) -> StoreResult<Value> {
        match mutation {
            GraphMutation::CreateNode { id, labels, properties } => {
                if self.nodes.contains_key(id) {
                    return Err(StoreError::Conflict(format!("node {} already exists", id)));
                }
                let mut node = GraphNode {
                    labels: vec![BASE_LABEL.to_string()],
                    properties: properties.clone(),
                };
                for label in labels {
                    add_label(&mut node, label);
                }
                node.properties.insert(fields::ID.to_string(), Value::String(id.clone()));
                self.nodes.insert(id.clone(), node);
                Ok(json!({"nodesCreated": 1, "propertiesSet": properties.len()}))
            }
            // MATCH semantics: a missing node is left alone.
            GraphMutation::SetProperties { id, properties } => {
                let Some(node) = self.nodes.get_mut(id) else {
                    return Ok(json!({"propertiesSet": 0}));
                };
                node.properties
                    .extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
                Ok(json!({"propertiesSet": properties.len()}))
            }
            GraphMutation::SoftDelete { id, deleted_at } => {
                let Some(node) = self.nodes.get_mut(id) else {
                    return Ok(json!({"propertiesSet": 0}));
                };
                node.properties.insert(fields::IS_DELETED.to_string(), Value::Bool(true));
                node.properties
                    .insert(fields::UPDATED_AT.to_string(), Value::String(deleted_at.clone()));
                Ok(json!({"propertiesSet": 2}))
            }
            GraphMutation::MergeNode { id, labels, properties } => {
                let created = !self.nodes.contains_key(id);
                let node = self.nodes.entry(id.clone()).or_insert_with(|| GraphNode {
                    labels: vec![BASE_LABEL.to_string()],
                    properties: Document::new(),
                });
                for label in labels {
                    add_label(node, label);
                }
                node.properties
                    .extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
                node.properties.insert(fields::ID.to_string(), Value::String(id.clone()));
                Ok(json!({"nodesCreated": usize::from(created), "propertiesSet": properties.len()}))
            }
            GraphMutation::Relate { source_id, relationship } => {
                let target_matches = self
                    .nodes
                    .get(&relationship.target_entity_id)
                    .map(|node| relationship.target_labels.iter().all(|l| node.has_label(l)))
                    .unwrap_or(false);
                // MATCH semantics: a missing endpoint creates nothing.
                if !self.nodes.contains_key(source_id) || !target_matches {
                    return Ok(json!({"relationshipsCreated": 0}));
                }

                let (from_id, to_id) = match relationship.direction {
                    Direction::Outgoing => (source_id.clone(), relationship.target_entity_id.clone()),
                    Direction::Incoming => (relationship.target_entity_id.clone(), source_id.clone()),
                };
                if let Some(existing) = self.relationships.iter_mut().find(|r| {
                    r.from_id == from_id && r.to_id == to_id && r.rel_type == relationship.rel_type
                }) {
                    existing.properties.extend(
                        relationship.properties.iter().map(|(k, v)| (k.clone(), v.clone())),
                    );
                    return Ok(json!({"relationshipsCreated": 0}));
                }
                self.relationships.push(MemoryRelationship {
                    from_id,
                    to_id,
                    rel_type: relationship.rel_type.clone(),
                    properties: relationship.properties.clone(),
                });
                Ok(json!({"relationshipsCreated": 1}))
            }
        }
    }
}

#[derive(Default)]
struct GraphState {
    data: Mutex<GraphData>,
    controls: FaultControls,
}

/// Graph store kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryGraphStore {
    inner: Arc<GraphState>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controls(&self) -> &FaultControls {
        &self.inner.controls
    }

    /// Committed node, if any.
    pub fn node(&self, id: &str) -> Option<GraphNode> {
        lock(&self.inner.data).nodes.get(id).cloned()
    }

    pub fn node_count(&self) -> usize {
        lock(&self.inner.data).nodes.len()
    }

    pub fn relationships(&self) -> Vec<MemoryRelationship> {
        lock(&self.inner.data).relationships.clone()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn open_transaction(&self) -> StoreResult<Box<dyn GraphTransaction>> {
        self.inner.controls.check_open("graph store")?;
        Ok(Box::new(MemoryGraphTransaction {
            state: Arc::clone(&self.inner),
            working: None,
            staged: Vec::new(),
        }))
    }

    async fn fetch_node(&self, id: &str) -> StoreResult<Option<GraphNode>> {
        Ok(self.node(id))
    }

    async fn health_check(&self) -> StoreResult<HealthReport> {
        self.inner.controls.health("graph store")
    }
}

struct MemoryGraphTransaction {
    state: Arc<GraphState>,
    working: Option<GraphData>,
    staged: Vec<GraphMutation>,
}

#[async_trait]
impl GraphTransaction for MemoryGraphTransaction {
    async fn run(&mut self, mutation: &GraphMutation) -> StoreResult<Value> {
        self.state.controls.check_run(mutation.node_id())?;

        let state = &self.state;
        let working = self
            .working
            .get_or_insert_with(|| lock(&state.data).clone());
        let summary = working.apply(mutation)?;
        self.staged.push(mutation.clone());
        Ok(summary)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.state.controls.check_commit()?;

        // Re-apply against the latest committed graph so concurrent commits
        // are not overwritten by this transaction's snapshot.
        let mut data = lock(&self.state.data);
        let mut next = data.clone();
        for mutation in &self.staged {
            next.apply(mutation)?;
        }
        *data = next;
        self.state.controls.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(self: Box<Self>) -> StoreResult<()> {
        self.state.controls.check_abort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Properties, RelationshipSpec};
    use crate::store::HealthStatus;

    fn props(value: Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_document_abort_discards_staged_writes() {
        let store = MemoryDocumentStore::new();
        let mut txn = store.open_transaction().await.unwrap();
        txn.run(&DocumentMutation::Insert {
            collection: "c".into(),
            id: "1".into(),
            document: props(json!({"id": "1", "version": 1})),
        })
        .await
        .unwrap();
        txn.abort().await.unwrap();

        assert!(store.is_empty());
        assert_eq!(store.controls().aborted_transactions(), 1);
    }

    #[tokio::test]
    async fn test_document_transaction_sees_its_own_writes() {
        let store = MemoryDocumentStore::new();
        let mut txn = store.open_transaction().await.unwrap();
        txn.run(&DocumentMutation::Insert {
            collection: "c".into(),
            id: "1".into(),
            document: props(json!({"id": "1", "version": 1})),
        })
        .await
        .unwrap();
        let result = txn
            .run(&DocumentMutation::Update {
                collection: "c".into(),
                id: "1".into(),
                fields: props(json!({"note": "x"})),
                updated_at: "t".into(),
            })
            .await
            .unwrap();
        assert_eq!(result["version"], json!(2));
        txn.commit().await.unwrap();

        assert_eq!(store.document("c", "1").unwrap()["version"], json!(2));
    }

    fn update(id: &str, field: &str) -> DocumentMutation {
        DocumentMutation::Update {
            collection: "c".into(),
            id: id.into(),
            fields: props(json!({ field: 1 })),
            updated_at: "t".into(),
        }
    }

    #[tokio::test]
    async fn test_overlapping_updates_conflict_at_commit() {
        let store = MemoryDocumentStore::new();
        let mut txn = store.open_transaction().await.unwrap();
        txn.run(&DocumentMutation::Insert {
            collection: "c".into(),
            id: "a".into(),
            document: props(json!({"id": "a", "version": 1})),
        })
        .await
        .unwrap();
        txn.commit().await.unwrap();

        let mut first = store.open_transaction().await.unwrap();
        let mut second = store.open_transaction().await.unwrap();
        first.run(&update("a", "x")).await.unwrap();
        second.run(&update("a", "y")).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.document("c", "a").unwrap()["version"], json!(2));

        let mut retry = store.open_transaction().await.unwrap();
        retry.run(&update("a", "y")).await.unwrap();
        retry.commit().await.unwrap();

        let doc = store.document("c", "a").unwrap();
        assert_eq!(doc["version"], json!(3));
        assert_eq!(doc["x"], json!(1));
        assert_eq!(doc["y"], json!(1));
    }

    #[tokio::test]
    async fn test_concurrent_insert_of_same_id_conflicts() {
        let store = MemoryDocumentStore::new();
        let insert = DocumentMutation::Insert {
            collection: "c".into(),
            id: "a".into(),
            document: props(json!({"id": "a", "version": 1})),
        };
        let mut first = store.open_transaction().await.unwrap();
        let mut second = store.open_transaction().await.unwrap();
        first.run(&insert).await.unwrap();
        second.run(&insert).await.unwrap();

        first.commit().await.unwrap();
        assert!(matches!(
            second.commit().await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_graph_update_of_missing_node_matches_nothing() {
        let store = MemoryGraphStore::new();
        let mut txn = store.open_transaction().await.unwrap();
        let set = txn
            .run(&GraphMutation::SetProperties {
                id: "ghost".into(),
                properties: props(json!({"title": "x"})),
            })
            .await
            .unwrap();
        let deleted = txn
            .run(&GraphMutation::SoftDelete {
                id: "ghost".into(),
                deleted_at: "t".into(),
            })
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert_eq!(set["propertiesSet"], json!(0));
        assert_eq!(deleted["propertiesSet"], json!(0));
        assert_eq!(store.node_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_refuses_transactions() {
        let store = MemoryGraphStore::new();
        store.controls().set_available(false);

        assert!(matches!(
            store.open_transaction().await,
            Err(StoreError::Unavailable(_))
        ));
        let report = store.health_check().await.unwrap();
        assert_eq!(report.status, HealthStatus::Unhealthy);

        store.controls().set_health_check_errors(true);
        assert!(store.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_relationship_requires_matching_target() {
        let store = MemoryGraphStore::new();
        let mut txn = store.open_transaction().await.unwrap();
        for id in ["a", "b"] {
            txn.run(&GraphMutation::CreateNode {
                id: id.into(),
                labels: vec!["Account".into()],
                properties: Properties::new(),
            })
            .await
            .unwrap();
        }
        let miss = txn
            .run(&GraphMutation::Relate {
                source_id: "a".into(),
                relationship: RelationshipSpec::new("OWNS", "b").with_target_labels(["Person"]),
            })
            .await
            .unwrap();
        assert_eq!(miss["relationshipsCreated"], json!(0));

        let hit = txn
            .run(&GraphMutation::Relate {
                source_id: "a".into(),
                relationship: RelationshipSpec::new("OWNS", "b").incoming(),
            })
            .await
            .unwrap();
        assert_eq!(hit["relationshipsCreated"], json!(1));
        txn.commit().await.unwrap();

        let rels = store.relationships();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].from_id, "b");
        assert_eq!(rels[0].to_id, "a");
        assert!(store.node("a").unwrap().has_label(BASE_LABEL));
    }

    #[tokio::test]
    async fn test_merge_node_creates_then_merges() {
        let store = MemoryGraphStore::new();
        for props_value in [json!({"amount": 1}), json!({"note": "later"})] {
            let mut txn = store.open_transaction().await.unwrap();
            txn.run(&GraphMutation::MergeNode {
                id: "n".into(),
                labels: vec!["Transaction".into()],
                properties: props(props_value),
            })
            .await
            .unwrap();
            txn.commit().await.unwrap();
        }

        let node = store.node("n").unwrap();
        assert_eq!(node.labels, vec!["Entity".to_string(), "Transaction".to_string()]);
        assert_eq!(node.properties["amount"], json!(1));
        assert_eq!(node.properties["note"], json!("later"));
        assert_eq!(store.node_count(), 1);
    }
}

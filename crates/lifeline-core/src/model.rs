//! Write operations, transaction outcomes and reconciliation records.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::SyncError;
use crate::store::{DocumentMutation, GraphMutation};

/// Schema-flexible document body.
pub type Document = Map<String, Value>;

/// Property map attached to a graph node or relationship.
pub type Properties = Map<String, Value>;

/// Label carried by every node the layer writes, in addition to caller labels.
pub const BASE_LABEL: &str = "Entity";

/// Field names stamped by the layer in both stores.
pub mod fields {
    pub const ID: &str = "id";
    pub const COLLECTION: &str = "collection";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const VERSION: &str = "version";
    pub const IS_DELETED: &str = "isDeleted";

    /// Fields a caller may not overwrite through an update.
    pub const RESERVED: &[&str] = &[ID, CREATED_AT, VERSION, IS_DELETED];

    pub fn is_reserved(name: &str) -> bool {
        RESERVED.contains(&name)
    }
}

/// RFC 3339 timestamp with millisecond precision, as written to both stores.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Check that a label or relationship type is a plain identifier.
///
/// Cypher cannot parameterize labels, so they end up in statement text.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Kind of a logical write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a relationship relative to the entity being written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Outgoing,
    Incoming,
}

/// An edge to create alongside a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipSpec {
    pub rel_type: String,
    pub target_entity_id: String,
    #[serde(default)]
    pub target_labels: Vec<String>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub direction: Direction,
}

impl RelationshipSpec {
    pub fn new(rel_type: impl Into<String>, target_entity_id: impl Into<String>) -> Self {
        Self {
            rel_type: rel_type.into(),
            target_entity_id: target_entity_id.into(),
            target_labels: Vec::new(),
            properties: Properties::new(),
            direction: Direction::Outgoing,
        }
    }

    pub fn with_target_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn incoming(mut self) -> Self {
        self.direction = Direction::Incoming;
        self
    }
}

/// The mutation carried by a [`WriteOperation`]; each kind has its own fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Create {
        document: Document,
        graph_labels: Vec<String>,
        graph_properties: Properties,
        relationships: Vec<RelationshipSpec>,
    },
    Update {
        fields: Document,
        graph_properties: Properties,
        relationships: Vec<RelationshipSpec>,
    },
    Delete,
}

/// One logical mutation submitted to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOperation {
    pub collection: String,
    /// Cross-store join key, identical in both stores.
    pub entity_id: String,
    pub mutation: Mutation,
}

impl WriteOperation {
    pub fn create(
        collection: impl Into<String>,
        entity_id: impl Into<String>,
        document: Document,
        graph_labels: Vec<String>,
        graph_properties: Properties,
    ) -> Self {
        Self {
            collection: collection.into(),
            entity_id: entity_id.into(),
            mutation: Mutation::Create {
                document,
                graph_labels,
                graph_properties,
                relationships: Vec::new(),
            },
        }
    }

    pub fn update(
        collection: impl Into<String>,
        entity_id: impl Into<String>,
        fields: Document,
        graph_properties: Properties,
    ) -> Self {
        Self {
            collection: collection.into(),
            entity_id: entity_id.into(),
            mutation: Mutation::Update {
                fields,
                graph_properties,
                relationships: Vec::new(),
            },
        }
    }

    pub fn delete(collection: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            entity_id: entity_id.into(),
            mutation: Mutation::Delete,
        }
    }

    /// Attach relationships. Deletes carry none, so this is a no-op for them.
    pub fn with_relationships(mut self, rels: Vec<RelationshipSpec>) -> Self {
        match &mut self.mutation {
            Mutation::Create { relationships, .. } | Mutation::Update { relationships, .. } => {
                *relationships = rels;
            }
            Mutation::Delete => {}
        }
        self
    }

    pub fn kind(&self) -> OperationKind {
        match self.mutation {
            Mutation::Create { .. } => OperationKind::Create,
            Mutation::Update { .. } => OperationKind::Update,
            Mutation::Delete => OperationKind::Delete,
        }
    }

    /// Caller labels; only creates carry any.
    pub fn graph_labels(&self) -> &[String] {
        match &self.mutation {
            Mutation::Create { graph_labels, .. } => graph_labels,
            _ => &[],
        }
    }

    pub fn relationships(&self) -> &[RelationshipSpec] {
        match &self.mutation {
            Mutation::Create { relationships, .. } | Mutation::Update { relationships, .. } => {
                relationships
            }
            Mutation::Delete => &[],
        }
    }

    /// Reject labels and relationship types that cannot be written safely.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.collection.trim().is_empty() {
            return Err(SyncError::validation("collection must not be empty"));
        }
        if self.entity_id.trim().is_empty() {
            return Err(SyncError::validation("entity id must not be empty"));
        }
        for label in self.graph_labels() {
            if !is_valid_identifier(label) {
                return Err(SyncError::validation(format!("invalid graph label '{}'", label)));
            }
        }
        for rel in self.relationships() {
            if !is_valid_identifier(&rel.rel_type) {
                return Err(SyncError::validation(format!(
                    "invalid relationship type '{}'",
                    rel.rel_type
                )));
            }
            if let Some(label) = rel.target_labels.iter().find(|l| !is_valid_identifier(l)) {
                return Err(SyncError::validation(format!("invalid target label '{}'", label)));
            }
        }
        Ok(())
    }

    /// Document-store mutation for this operation, stamped at `now`.
    ///
    /// Creates always carry `id`, `createdAt`, `updatedAt`, `version = 1` and
    /// `isDeleted = false`; stamps already present on the document are kept.
    pub fn document_mutation(&self, now: DateTime<Utc>) -> DocumentMutation {
        let ts = timestamp(now);
        match &self.mutation {
            Mutation::Create { document, .. } => {
                let mut document = document.clone();
                document.insert(fields::ID.to_string(), Value::String(self.entity_id.clone()));
                let created_at = document
                    .entry(fields::CREATED_AT)
                    .or_insert_with(|| Value::String(ts.clone()))
                    .clone();
                document.entry(fields::UPDATED_AT).or_insert(created_at);
                document.insert(fields::VERSION.to_string(), Value::from(1));
                document.insert(fields::IS_DELETED.to_string(), Value::Bool(false));
                DocumentMutation::Insert {
                    collection: self.collection.clone(),
                    id: self.entity_id.clone(),
                    document,
                }
            }
            Mutation::Update { fields: changes, .. } => DocumentMutation::Update {
                collection: self.collection.clone(),
                id: self.entity_id.clone(),
                fields: changes
                    .iter()
                    .filter(|(k, _)| !fields::is_reserved(k) && k.as_str() != fields::UPDATED_AT)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                updated_at: ts,
            },
            Mutation::Delete => DocumentMutation::SoftDelete {
                collection: self.collection.clone(),
                id: self.entity_id.clone(),
                deleted_at: ts,
            },
        }
    }

    /// Graph statements for this operation, in execution order.
    ///
    /// For creates the node comes first, then each declared relationship.
    pub fn graph_mutations(&self, now: DateTime<Utc>) -> Vec<GraphMutation> {
        let properties = self.graph_properties_at(now);
        let mut mutations = match &self.mutation {
            Mutation::Create { graph_labels, .. } => vec![GraphMutation::CreateNode {
                id: self.entity_id.clone(),
                labels: graph_labels.clone(),
                properties,
            }],
            Mutation::Update { .. } => vec![GraphMutation::SetProperties {
                id: self.entity_id.clone(),
                properties,
            }],
            Mutation::Delete => vec![GraphMutation::SoftDelete {
                id: self.entity_id.clone(),
                deleted_at: timestamp(now),
            }],
        };
        mutations.extend(self.relationships().iter().map(|rel| GraphMutation::Relate {
            source_id: self.entity_id.clone(),
            relationship: rel.clone(),
        }));
        mutations
    }

    /// The graph half of this operation, packaged for deferred replay.
    pub fn deferred_graph_write(&self, now: DateTime<Utc>) -> DeferredGraphWrite {
        DeferredGraphWrite {
            kind: self.kind(),
            collection: self.collection.clone(),
            entity_id: self.entity_id.clone(),
            graph_labels: self.graph_labels().to_vec(),
            graph_properties: self.graph_properties_at(now),
            relationships: self.relationships().to_vec(),
        }
    }

    /// Properties written onto the node, including the stamped fields.
    fn graph_properties_at(&self, now: DateTime<Utc>) -> Properties {
        let ts = timestamp(now);
        match &self.mutation {
            Mutation::Create {
                document,
                graph_properties,
                ..
            } => {
                let mut props = graph_properties.clone();
                let created_at = document
                    .get(fields::CREATED_AT)
                    .cloned()
                    .unwrap_or_else(|| Value::String(ts.clone()));
                let updated_at = document
                    .get(fields::UPDATED_AT)
                    .cloned()
                    .unwrap_or_else(|| created_at.clone());
                props.insert(fields::ID.to_string(), Value::String(self.entity_id.clone()));
                props.insert(
                    fields::COLLECTION.to_string(),
                    Value::String(self.collection.clone()),
                );
                props.insert(fields::CREATED_AT.to_string(), created_at);
                props.insert(fields::UPDATED_AT.to_string(), updated_at);
                props.insert(fields::IS_DELETED.to_string(), Value::Bool(false));
                props
            }
            Mutation::Update {
                graph_properties, ..
            } => {
                let mut props: Properties = graph_properties
                    .iter()
                    .filter(|(k, _)| !fields::is_reserved(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                props.insert(fields::UPDATED_AT.to_string(), Value::String(ts));
                props
            }
            Mutation::Delete => {
                let mut props = Properties::new();
                props.insert(fields::IS_DELETED.to_string(), Value::Bool(true));
                props.insert(fields::UPDATED_AT.to_string(), Value::String(ts));
                props
            }
        }
    }
}

/// Outcome of one `execute_transaction` call.
#[derive(Debug, Clone, Default)]
pub struct TransactionResult {
    pub success: bool,
    /// One entry per operation that reached the document store.
    pub document_results: Vec<Value>,
    /// One entry per operation that reached the graph store.
    pub graph_results: Vec<Value>,
    /// Present iff `success` is false.
    pub error: Option<SyncError>,
    pub rollback_performed: bool,
    pub attempts: u32,
    /// Operations whose graph half was handed to the reconciliation queue.
    pub deferred_graph_operations: usize,
    /// Generated id, set by `create_entity` on success only.
    pub entity_id: Option<String>,
}

impl TransactionResult {
    pub fn failure(error: SyncError, attempts: u32, rollback_performed: bool) -> Self {
        Self {
            success: false,
            error: Some(error),
            rollback_performed,
            attempts,
            ..Self::default()
        }
    }

    /// True when the write succeeded but its graph half is still pending.
    pub fn is_degraded(&self) -> bool {
        self.success && self.deferred_graph_operations > 0
    }
}

/// The graph half of a write, handed to the reconciliation queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredGraphWrite {
    pub kind: OperationKind,
    pub collection: String,
    pub entity_id: String,
    pub graph_labels: Vec<String>,
    pub graph_properties: Properties,
    #[serde(default)]
    pub relationships: Vec<RelationshipSpec>,
}

/// A graph mutation deferred because the graph store was unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsyncedOperation {
    pub id: String,
    pub enqueued_at: DateTime<Utc>,
    pub kind: OperationKind,
    pub collection: String,
    pub entity_id: String,
    pub graph_labels: Vec<String>,
    pub graph_properties: Properties,
    #[serde(default)]
    pub relationships: Vec<RelationshipSpec>,
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl UnsyncedOperation {
    /// Wrap a deferred write. `sequence` keeps ids unique within one instant.
    pub fn new(write: DeferredGraphWrite, enqueued_at: DateTime<Utc>, sequence: u64) -> Self {
        let id = format!(
            "{}:{}:{}:{}:{}",
            write.kind,
            write.collection,
            write.entity_id,
            enqueued_at.timestamp_millis(),
            sequence
        );
        Self {
            id,
            enqueued_at,
            kind: write.kind,
            collection: write.collection,
            entity_id: write.entity_id,
            graph_labels: write.graph_labels,
            graph_properties: write.graph_properties,
            relationships: write.relationships,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Statements that bring the graph up to date with this operation.
    ///
    /// The node is merged by id (created if absent), so replay is idempotent.
    pub fn replay_mutations(&self) -> Vec<GraphMutation> {
        let mut properties = self.graph_properties.clone();
        properties.insert(fields::ID.to_string(), Value::String(self.entity_id.clone()));
        if self.kind == OperationKind::Delete {
            properties.insert(fields::IS_DELETED.to_string(), Value::Bool(true));
        }

        let mut mutations = vec![GraphMutation::MergeNode {
            id: self.entity_id.clone(),
            labels: self.graph_labels.clone(),
            properties,
        }];
        mutations.extend(self.relationships.iter().map(|rel| GraphMutation::Relate {
            source_id: self.entity_id.clone(),
            relationship: rel.clone(),
        }));
        mutations
    }
}

/// Availability of one store as of its last health check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub available: bool,
    pub last_checked: DateTime<Utc>,
    pub error: Option<String>,
    pub latency_ms: Option<u64>,
}

impl ServiceStatus {
    /// Status before the first check: unavailable, no error recorded.
    pub fn unknown(now: DateTime<Utc>) -> Self {
        Self {
            available: false,
            last_checked: now,
            error: None,
            latency_ms: None,
        }
    }
}

/// Both stores' status, as returned by the degradation service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatusReport {
    pub document_store: ServiceStatus,
    pub graph_store: ServiceStatus,
}

/// Snapshot of the reconciliation queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnsyncedStats {
    pub total_queued: usize,
    pub counts_by_kind: BTreeMap<OperationKind, usize>,
    pub counts_by_collection: BTreeMap<String, usize>,
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
    pub newest_enqueued_at: Option<DateTime<Utc>>,
    pub evicted_total: u64,
    pub permanently_failed_total: u64,
}

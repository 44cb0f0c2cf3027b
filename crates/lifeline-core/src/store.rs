//! Store session adapter contracts.
//!
//! Each backing store exposes transactions as explicit values: the
//! coordinator opens one, threads it through every `run`, and finally
//! consumes it with `commit` or `abort`.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::StoreResult;
use crate::model::{fields, Document, Properties, RelationshipSpec};

/// A mutation applied inside a document-store transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentMutation {
    /// Insert a new document; fails if one already exists under the id.
    Insert {
        collection: String,
        id: String,
        document: Document,
    },
    /// Set fields on an existing document and bump `version` by one.
    Update {
        collection: String,
        id: String,
        fields: Document,
        updated_at: String,
    },
    /// Flag an existing document as deleted. The record is kept.
    SoftDelete {
        collection: String,
        id: String,
        deleted_at: String,
    },
}

impl DocumentMutation {
    pub fn collection(&self) -> &str {
        match self {
            Self::Insert { collection, .. }
            | Self::Update { collection, .. }
            | Self::SoftDelete { collection, .. } => collection,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Insert { id, .. } | Self::Update { id, .. } | Self::SoftDelete { id, .. } => id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::SoftDelete { .. } => "soft_delete",
        }
    }

    /// Compute the document that results from applying this mutation.
    ///
    /// Used by stores that materialize whole documents rather than issuing
    /// field-level commands.
    pub fn apply_to(&self, existing: Option<&Document>) -> StoreResult<Document> {
        use crate::error::StoreError;

        match (self, existing) {
            (Self::Insert { collection, id, .. }, Some(_)) => Err(StoreError::Conflict(format!(
                "document {}/{} already exists",
                collection, id
            ))),
            (Self::Insert { document, .. }, None) => Ok(document.clone()),
            (Self::Update { collection, id, .. }, None)
            | (Self::SoftDelete { collection, id, .. }, None) => Err(StoreError::NotFound(
                format!("document {}/{}", collection, id),
            )),
            (Self::Update { fields: changes, updated_at, .. }, Some(current)) => {
                let mut next = current.clone();
                for (key, value) in changes {
                    next.insert(key.clone(), value.clone());
                }
                let version = current
                    .get(fields::VERSION)
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                next.insert(fields::VERSION.to_string(), Value::from(version + 1));
                next.insert(fields::UPDATED_AT.to_string(), Value::String(updated_at.clone()));
                Ok(next)
            }
            (Self::SoftDelete { deleted_at, .. }, Some(current)) => {
                let mut next = current.clone();
                next.insert(fields::IS_DELETED.to_string(), Value::Bool(true));
                next.insert(fields::UPDATED_AT.to_string(), Value::String(deleted_at.clone()));
                Ok(next)
            }
        }
    }
}

/// A mutation applied inside a graph-store transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphMutation {
    /// Create a node with the base label plus `labels`.
    CreateNode {
        id: String,
        labels: Vec<String>,
        properties: Properties,
    },
    /// Merge properties onto an existing node.
    SetProperties { id: String, properties: Properties },
    /// Flag an existing node as deleted.
    SoftDelete { id: String, deleted_at: String },
    /// Create the node if absent, then merge labels and properties.
    MergeNode {
        id: String,
        labels: Vec<String>,
        properties: Properties,
    },
    /// Create an edge between the source node and the target entity.
    Relate {
        source_id: String,
        relationship: RelationshipSpec,
    },
}

impl GraphMutation {
    pub fn node_id(&self) -> &str {
        match self {
            Self::CreateNode { id, .. }
            | Self::SetProperties { id, .. }
            | Self::SoftDelete { id, .. }
            | Self::MergeNode { id, .. } => id,
            Self::Relate { source_id, .. } => source_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateNode { .. } => "create_node",
            Self::SetProperties { .. } => "set_properties",
            Self::SoftDelete { .. } => "soft_delete",
            Self::MergeNode { .. } => "merge_node",
            Self::Relate { .. } => "relate",
        }
    }
}

/// A node as read back from the graph store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub labels: Vec<String>,
    pub properties: Map<String, Value>,
}

impl GraphNode {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Result of a store health probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl HealthReport {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            error: Some(error.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// An open document-store transaction.
#[async_trait]
pub trait DocumentTransaction: Send {
    async fn run(&mut self, mutation: &DocumentMutation) -> StoreResult<Value>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn abort(self: Box<Self>) -> StoreResult<()>;
}

/// Schema-flexible primary store for entity records.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn open_transaction(&self) -> StoreResult<Box<dyn DocumentTransaction>>;

    /// Read a document outside any transaction.
    async fn fetch(&self, collection: &str, id: &str) -> StoreResult<Option<Document>>;

    async fn health_check(&self) -> StoreResult<HealthReport>;
}

/// An open graph-store transaction.
#[async_trait]
pub trait GraphTransaction: Send {
    async fn run(&mut self, mutation: &GraphMutation) -> StoreResult<Value>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn abort(self: Box<Self>) -> StoreResult<()>;
}

/// Store holding nodes and relationships for relationship discovery.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn open_transaction(&self) -> StoreResult<Box<dyn GraphTransaction>>;

    /// Read a node by entity id outside any transaction.
    async fn fetch_node(&self, id: &str) -> StoreResult<Option<GraphNode>>;

    async fn health_check(&self) -> StoreResult<HealthReport>;
}

//! Lifeline Core Library
//!
//! Write model, store adapter contracts and error types shared by the
//! dual-store consistency layer and its adapters.

pub mod config;
pub mod error;
pub mod memory;
pub mod model;
pub mod store;

pub use config::{CoordinatorConfig, DegradationConfig};
pub use error::{StoreError, StoreKind, StoreResult, SyncError};
pub use model::{
    DeferredGraphWrite, Direction, Document, Mutation, OperationKind, Properties,
    RelationshipSpec, ServiceStatus, ServiceStatusReport, TransactionResult, UnsyncedOperation,
    UnsyncedStats, WriteOperation,
};
pub use store::{
    DocumentMutation, DocumentStore, DocumentTransaction, GraphMutation, GraphNode, GraphStore,
    GraphTransaction, HealthReport, HealthStatus,
};

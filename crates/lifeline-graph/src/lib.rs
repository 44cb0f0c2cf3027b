//! # Lifeline Graph
//!
//! Neo4j side of the dual-store layer: connection handling, schema setup,
//! and a [`lifeline_core::GraphStore`] that runs each write inside an
//! explicit Bolt transaction.

pub mod bolt;
pub mod client;
pub mod cypher;
pub mod schema;
pub mod store;

pub use client::{GraphClient, GraphConfig, GraphError, GraphResult};
pub use schema::initialize_schema;
pub use store::Neo4jGraphStore;

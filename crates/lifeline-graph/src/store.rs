//! [`GraphStore`] implementation over Neo4j.

use async_trait::async_trait;
use lifeline_core::model::BASE_LABEL;
use lifeline_core::{
    GraphMutation, GraphNode, GraphStore, GraphTransaction, HealthReport, Properties, StoreError,
    StoreResult,
};
use neo4rs::{Query, Txn};
use serde_json::{json, Value};
use std::time::Instant;
use tracing::debug;

use crate::bolt;
use crate::client::{GraphClient, GraphError};
use crate::cypher::{self, Statement};

fn store_error(err: impl Into<GraphError>) -> StoreError {
    let err: GraphError = err.into();
    err.into()
}

fn to_query(statement: &Statement) -> Query {
    statement
        .params
        .iter()
        .fold(Query::new(statement.text.clone()), |query, (key, value)| {
            query.param(key, bolt::to_bolt(value))
        })
}

#[derive(Clone)]
pub struct Neo4jGraphStore {
    client: GraphClient,
}

impl Neo4jGraphStore {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &GraphClient {
        &self.client
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn open_transaction(&self) -> StoreResult<Box<dyn GraphTransaction>> {
        let txn = self.client.inner().start_txn().await.map_err(store_error)?;
        Ok(Box::new(Neo4jTransaction { txn, statements: 0 }))
    }

    async fn fetch_node(&self, id: &str) -> StoreResult<Option<GraphNode>> {
        let query = Query::new(format!(
            "MATCH (n:{} {{id: $id}}) RETURN n LIMIT 1",
            cypher::quote(BASE_LABEL)
        ))
        .param("id", id);

        let rows = self.client.query(query).await.map_err(store_error)?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let node: neo4rs::Node = row
            .get("n")
            .map_err(|e| store_error(GraphError::Decode(e.to_string())))?;
        Ok(Some(decode_node(&node)?))
    }

    async fn health_check(&self) -> StoreResult<HealthReport> {
        let started = Instant::now();
        match self.client.ping().await {
            Ok(()) => Ok(HealthReport::healthy(started.elapsed().as_millis() as u64)),
            Err(e) => {
                debug!(error = %e, "Neo4j health check failed");
                Ok(HealthReport::unhealthy(e.to_string()))
            }
        }
    }
}

fn decode_node(node: &neo4rs::Node) -> StoreResult<GraphNode> {
    let mut properties = Properties::new();
    for key in node.keys() {
        let value: Value = node
            .get(key)
            .map_err(|e| store_error(GraphError::Decode(format!("property {}: {}", key, e))))?;
        properties.insert(key.to_string(), value);
    }
    Ok(GraphNode {
        labels: node.labels().into_iter().map(str::to_string).collect(),
        properties,
    })
}

/// One explicit Bolt transaction; statements run as they arrive.
struct Neo4jTransaction {
    txn: Txn,
    statements: usize,
}

#[async_trait]
impl GraphTransaction for Neo4jTransaction {
    async fn run(&mut self, mutation: &GraphMutation) -> StoreResult<Value> {
        let statement = cypher::statement(mutation);
        self.txn
            .run(to_query(&statement))
            .await
            .map_err(store_error)?;
        self.statements += 1;
        Ok(json!({
            "statement": mutation.name(),
            "nodeId": mutation.node_id(),
        }))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let statements = self.statements;
        self.txn.commit().await.map_err(store_error)?;
        debug!(statements, "Neo4j transaction committed");
        Ok(())
    }

    async fn abort(self: Box<Self>) -> StoreResult<()> {
        self.txn.rollback().await.map_err(store_error)
    }
}

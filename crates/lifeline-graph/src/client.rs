//! Neo4j connection client.

use lifeline_core::StoreError;
use neo4rs::{ConfigBuilder, Graph, Query};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Invalid Neo4j configuration: {0}")]
    Config(String),

    #[error("Neo4j error: {0}")]
    Neo4j(#[from] neo4rs::Error),

    #[error("Failed to decode Neo4j result: {0}")]
    Decode(String),
}

pub type GraphResult<T> = Result<T, GraphError>;

impl From<GraphError> for StoreError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Neo4j(neo4rs::Error::IOError { .. })
            | GraphError::Neo4j(neo4rs::Error::ConnectionError) => {
                StoreError::Unavailable(err.to_string())
            }
            GraphError::Neo4j(e) => StoreError::Query(e.to_string()),
            GraphError::Config(msg) => StoreError::Connection(msg),
            GraphError::Decode(msg) => StoreError::Serialization(msg),
        }
    }
}

/// Configuration for connecting to Neo4j.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: "neo4j".to_string(),
            database: "neo4j".to_string(),
            max_connections: 16,
        }
    }
}

impl GraphConfig {
    /// Override connection settings from `NEO4J_URI`, `NEO4J_USER` and
    /// `NEO4J_PASSWORD` when set.
    pub fn apply_env(&mut self) {
        let vars = [
            ("NEO4J_URI", &mut self.uri),
            ("NEO4J_USER", &mut self.user),
            ("NEO4J_PASSWORD", &mut self.password),
        ];
        for (name, slot) in vars {
            if let Ok(value) = std::env::var(name) {
                if !value.is_empty() {
                    *slot = value;
                }
            }
        }
    }
}

/// Shared handle to a Neo4j connection pool.
#[derive(Clone)]
pub struct GraphClient {
    graph: Graph,
}

impl GraphClient {
    /// Connect and verify the server answers queries.
    ///
    /// `Graph::connect` only builds the pool; the `RETURN 1` ping forces a
    /// real Bolt handshake so an unreachable server fails here.
    pub async fn connect(config: &GraphConfig) -> GraphResult<Self> {
        let client = Self::connect_lazy(config).await?;
        client.ping().await?;
        Ok(client)
    }

    /// Build the pool without contacting the server.
    ///
    /// Used when the graph store may legitimately be down at startup; the
    /// first transaction or health check establishes the connection.
    pub async fn connect_lazy(config: &GraphConfig) -> GraphResult<Self> {
        let neo4j_config = ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.user)
            .password(&config.password)
            .db(config.database.as_str())
            .max_connections(config.max_connections.max(1))
            .fetch_size(200)
            .build()
            .map_err(|e| GraphError::Config(e.to_string()))?;

        let graph = Graph::connect(neo4j_config).await?;
        Ok(Self { graph })
    }

    pub async fn ping(&self) -> GraphResult<()> {
        self.execute(Query::new("RETURN 1".to_string())).await
    }

    /// Execute a Cypher query that returns no results.
    pub async fn execute(&self, query: Query) -> GraphResult<()> {
        self.graph.run(query).await?;
        Ok(())
    }

    /// Execute a Cypher query and collect its rows.
    pub async fn query(&self, query: Query) -> GraphResult<Vec<neo4rs::Row>> {
        let mut result = self.graph.execute(query).await?;
        let mut rows = Vec::new();
        while let Some(row) = result.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Get a reference to the underlying neo4rs Graph.
    pub fn inner(&self) -> &Graph {
        &self.graph
    }
}

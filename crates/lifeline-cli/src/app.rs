//! Composition root: builds the stores, the degradation service and the
//! coordinator from a loaded config.

use anyhow::{Context, Result};
use lifeline_graph::{GraphClient, Neo4jGraphStore};
use lifeline_redis::RedisDocumentStore;
use lifeline_sync::{DegradationService, TransactionCoordinator};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::LifelineConfig;

pub struct App {
    pub config: LifelineConfig,
    pub document: Arc<RedisDocumentStore>,
    pub graph: Arc<Neo4jGraphStore>,
    pub degradation: Arc<DegradationService>,
    pub coordinator: TransactionCoordinator,
}

impl App {
    /// Connect to both stores and probe them once.
    ///
    /// Redis must be reachable. Neo4j may be down: writes then take the
    /// degraded path until it comes back.
    pub async fn connect(config: LifelineConfig) -> Result<Self> {
        let document = RedisDocumentStore::connect(&config.redis)
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", config.redis.url))?;
        let client = GraphClient::connect_lazy(&config.neo4j)
            .await
            .context("Failed to create Neo4j connection pool")?;

        let document = Arc::new(document);
        let graph = Arc::new(Neo4jGraphStore::new(client));
        let degradation = DegradationService::new(
            config.degradation.clone(),
            document.clone(),
            graph.clone(),
        );
        let coordinator = TransactionCoordinator::new(
            document.clone(),
            graph.clone(),
            config.coordinator.clone(),
        )
        .with_degradation(Arc::clone(&degradation));

        degradation.check_document_health().await;
        let graph_status = degradation.check_graph_health().await;
        if graph_status.available {
            info!(uri = %config.neo4j.uri, "Connected to Neo4j");
        } else {
            warn!(
                uri = %config.neo4j.uri,
                error = graph_status.error.as_deref().unwrap_or("unknown"),
                "Neo4j unavailable; graph writes will be deferred"
            );
        }

        Ok(Self {
            config,
            document,
            graph,
            degradation,
            coordinator,
        })
    }

    /// Wait for queued graph writes to be replayed, up to `timeout`.
    ///
    /// Returns how many are still queued.
    pub async fn settle(&self, timeout: std::time::Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let queued = self.degradation.unsynced_stats().total_queued;
            if queued == 0 || tokio::time::Instant::now() >= deadline {
                return queued;
            }
            self.degradation.check_graph_health().await;
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
    }
}

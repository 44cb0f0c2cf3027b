//! Neo4j schema initialization (constraints and indexes).

use neo4rs::Query;
use tracing::info;

use crate::client::{GraphClient, GraphResult};

/// Cypher statements for schema initialization.
const SCHEMA_STATEMENTS: &[&str] = &[
    // The cross-store join key
    "CREATE CONSTRAINT entity_id IF NOT EXISTS FOR (n:Entity) REQUIRE n.id IS UNIQUE",
    "CREATE INDEX entity_collection IF NOT EXISTS FOR (n:Entity) ON (n.collection)",
    "CREATE INDEX entity_deleted IF NOT EXISTS FOR (n:Entity) ON (n.isDeleted)",
];

/// Initialize Neo4j schema with constraints and indexes.
///
/// Safe to run multiple times - uses IF NOT EXISTS clauses.
pub async fn initialize_schema(client: &GraphClient) -> GraphResult<usize> {
    info!("Initializing Neo4j schema...");

    for statement in SCHEMA_STATEMENTS {
        client.execute(Query::new(statement.to_string())).await?;
    }

    info!("Neo4j schema initialized ({} statements)", SCHEMA_STATEMENTS.len());
    Ok(SCHEMA_STATEMENTS.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_are_idempotent() {
        assert!(SCHEMA_STATEMENTS.iter().all(|s| s.contains("IF NOT EXISTS")));
        assert!(SCHEMA_STATEMENTS[0].contains("REQUIRE n.id IS UNIQUE"));
    }
}

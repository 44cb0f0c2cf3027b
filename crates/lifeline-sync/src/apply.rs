//! Statement execution and rollback helpers shared by the coordinator and
//! the reconciliation drain.

use lifeline_core::{
    DocumentTransaction, GraphMutation, GraphTransaction, StoreKind, StoreResult, SyncError,
};
use serde_json::Value;
use tracing::{debug, warn};

/// Run one operation's graph statements in order, stopping at the first error.
pub(crate) async fn run_graph_mutations(
    txn: &mut (dyn GraphTransaction + '_),
    mutations: &[GraphMutation],
) -> StoreResult<Value> {
    let mut summaries = Vec::with_capacity(mutations.len());
    for mutation in mutations {
        let summary = txn.run(mutation).await?;
        debug!(node_id = %mutation.node_id(), statement = mutation.name(), "Graph statement applied");
        summaries.push(summary);
    }
    Ok(Value::Array(summaries))
}

/// Abort whichever transactions are open, collecting rollback failures.
///
/// Rollback errors are reported, never raised: the caller keeps its
/// original failure as the primary cause.
pub(crate) async fn roll_back(
    document: Option<Box<dyn DocumentTransaction>>,
    graph: Option<Box<dyn GraphTransaction>>,
) -> Vec<SyncError> {
    let mut errors = Vec::new();

    if let Some(txn) = document {
        if let Err(source) = txn.abort().await {
            warn!(error = %source, "Document store rollback failed");
            errors.push(SyncError::Rollback {
                store: StoreKind::Document,
                source,
            });
        }
    }

    if let Some(txn) = graph {
        if let Err(source) = txn.abort().await {
            warn!(error = %source, "Graph store rollback failed");
            errors.push(SyncError::Rollback {
                store: StoreKind::Graph,
                source,
            });
        }
    }

    errors
}

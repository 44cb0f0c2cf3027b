//! Cypher text for each [`GraphMutation`].
//!
//! Labels and relationship types cannot be parameters, so they are
//! backtick-quoted into the statement; every value travels as a parameter.

use lifeline_core::model::{fields, BASE_LABEL};
use lifeline_core::{Direction, GraphMutation};
use serde_json::Value;

/// A statement and its parameters, independent of the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: Vec<(&'static str, Value)>,
}

/// Quote an identifier for use as a label or relationship type.
pub fn quote(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

/// `:`Entity`:`A`:`B``, base label first and never repeated.
fn label_clause(labels: &[String]) -> String {
    std::iter::once(BASE_LABEL)
        .chain(
            labels
                .iter()
                .map(String::as_str)
                .filter(|l| *l != BASE_LABEL),
        )
        .map(|l| format!(":{}", quote(l)))
        .collect()
}

pub fn statement(mutation: &GraphMutation) -> Statement {
    let entity = quote(BASE_LABEL);
    match mutation {
        GraphMutation::CreateNode {
            id,
            labels,
            properties,
        } => Statement {
            text: format!(
                "CREATE (n{} {{id: $id}}) SET n += $props",
                label_clause(labels)
            ),
            params: vec![
                ("id", Value::String(id.clone())),
                ("props", Value::Object(properties.clone())),
            ],
        },
        GraphMutation::SetProperties { id, properties } => Statement {
            text: format!("MATCH (n:{} {{id: $id}}) SET n += $props", entity),
            params: vec![
                ("id", Value::String(id.clone())),
                ("props", Value::Object(properties.clone())),
            ],
        },
        GraphMutation::SoftDelete { id, deleted_at } => Statement {
            text: format!(
                "MATCH (n:{} {{id: $id}}) SET n.{} = true, n.{} = $deletedAt",
                entity,
                fields::IS_DELETED,
                fields::UPDATED_AT
            ),
            params: vec![
                ("id", Value::String(id.clone())),
                ("deletedAt", Value::String(deleted_at.clone())),
            ],
        },
        GraphMutation::MergeNode {
            id,
            labels,
            properties,
        } => {
            let mut text = format!("MERGE (n:{} {{id: $id}})", entity);
            let extra: Vec<&String> = labels.iter().filter(|l| *l != BASE_LABEL).collect();
            if !extra.is_empty() {
                text.push_str(" SET n");
                for label in extra {
                    text.push(':');
                    text.push_str(&quote(label));
                }
            }
            text.push_str(" SET n += $props");
            Statement {
                text,
                params: vec![
                    ("id", Value::String(id.clone())),
                    ("props", Value::Object(properties.clone())),
                ],
            }
        }
        GraphMutation::Relate {
            source_id,
            relationship,
        } => {
            let pattern = match relationship.direction {
                Direction::Outgoing => "(s)-[r:{}]->(t)",
                Direction::Incoming => "(t)-[r:{}]->(s)",
            }
            .replace("{}", &quote(&relationship.rel_type));
            Statement {
                text: format!(
                    "MATCH (s:{} {{id: $sourceId}}) MATCH (t{} {{id: $targetId}}) MERGE {} SET r += $props",
                    entity,
                    label_clause(&relationship.target_labels),
                    pattern
                ),
                params: vec![
                    ("sourceId", Value::String(source_id.clone())),
                    (
                        "targetId",
                        Value::String(relationship.target_entity_id.clone()),
                    ),
                    ("props", Value::Object(relationship.properties.clone())),
                ],
            }
        }
    }
}

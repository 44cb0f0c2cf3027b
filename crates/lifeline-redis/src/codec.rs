//! Key layout and hash encoding for stored documents.

use lifeline_core::model::fields;
use lifeline_core::Document;
use serde_json::Value;

use crate::client::{RedisResult, RedisStoreError};

/// Hash field holding the full JSON document.
pub const DATA_FIELD: &str = "data";

/// `{prefix}:{collection}:{id}`
pub fn document_key(prefix: &str, collection: &str, id: &str) -> String {
    format!("{}:{}:{}", prefix, collection, id)
}

/// Sorted set of a collection's ids, scored by insert time.
pub fn collection_index_key(prefix: &str, collection: &str) -> String {
    format!("{}:{}:all", prefix, collection)
}

/// Hash fields written for a document.
///
/// `version` and `isDeleted` are mirrored outside the JSON body so they can
/// be read with a plain HGET.
pub fn encode(document: &Document) -> RedisResult<Vec<(&'static str, String)>> {
    let mut out = vec![(DATA_FIELD, serde_json::to_string(document)?)];
    if let Some(version) = document.get(fields::VERSION).and_then(Value::as_i64) {
        out.push((fields::VERSION, version.to_string()));
    }
    if let Some(deleted) = document.get(fields::IS_DELETED).and_then(Value::as_bool) {
        out.push((fields::IS_DELETED, deleted.to_string()));
    }
    Ok(out)
}

/// Parse the `data` field of a document hash.
pub fn decode(key: &str, raw: Option<String>) -> RedisResult<Option<Document>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(&raw)? {
        Value::Object(map) => Ok(Some(map)),
        other => Err(RedisStoreError::Corrupt {
            key: key.to_string(),
            reason: format!("expected an object, found {}", kind_of(&other)),
        }),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

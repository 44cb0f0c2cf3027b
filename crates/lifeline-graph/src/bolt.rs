//! JSON to Bolt parameter conversion.
//!
//! Neo4j properties hold scalars and homogeneous lists only. Objects below
//! the top level of a property map are written as JSON text.

use neo4rs::{BoltBoolean, BoltFloat, BoltInteger, BoltList, BoltMap, BoltNull, BoltString, BoltType};
use serde_json::Value;

/// Convert a statement parameter. A top-level object becomes a property map.
pub fn to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Object(entries) => {
            let mut map = BoltMap::new();
            for (key, value) in entries {
                map.put(BoltString::new(key), property(value));
            }
            BoltType::Map(map)
        }
        other => property(other),
    }
}

fn property(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => BoltType::Boolean(BoltBoolean::new(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => BoltType::Integer(BoltInteger::new(i)),
            None => BoltType::Float(BoltFloat::new(n.as_f64().unwrap_or(f64::NAN))),
        },
        Value::String(s) => BoltType::String(BoltString::new(s)),
        Value::Array(items) => {
            let mut list = BoltList::with_capacity(items.len());
            for item in items {
                list.push(property(item));
            }
            BoltType::List(list)
        }
        Value::Object(_) => BoltType::String(BoltString::new(&value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry<'a>(map: &'a BoltMap, key: &str) -> &'a BoltType {
        map.value.get(&BoltString::new(key)).unwrap()
    }

    #[test]
    fn test_scalars() {
        assert!(matches!(to_bolt(&json!(null)), BoltType::Null(_)));
        assert!(matches!(to_bolt(&json!(true)), BoltType::Boolean(b) if b.value));
        assert!(matches!(to_bolt(&json!(42)), BoltType::Integer(i) if i.value == 42));
        assert!(matches!(to_bolt(&json!(100.5)), BoltType::Float(f) if f.value == 100.5));
        assert!(matches!(to_bolt(&json!("Coffee")), BoltType::String(s) if s.value == "Coffee"));
    }

    #[test]
    fn test_property_map_flattens_nested_objects() {
        let bolt = to_bolt(&json!({
            "amount": 100.5,
            "tags": ["a", "b"],
            "meta": {"source": "import"}
        }));
        let BoltType::Map(map) = bolt else {
            panic!("expected a map");
        };
        assert_eq!(map.value.len(), 3);
        assert!(matches!(entry(&map, "tags"), BoltType::List(l) if l.value.len() == 2));
        match entry(&map, "meta") {
            BoltType::String(s) => assert_eq!(s.value, r#"{"source":"import"}"#),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_large_unsigned_becomes_float() {
        assert!(matches!(to_bolt(&json!(u64::MAX)), BoltType::Float(_)));
    }
}

//! Helpers for the loosely-shaped JSON the tracker returns.
//!
//! Batch endpoints answer either with an object keyed by id or with an array
//! of records carrying an `id`; both are normalised to an id-keyed map.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub type Record = Map<String, Value>;

/// Read an id that may be encoded as a number or a numeric string.
pub fn as_id(value: &Value) -> Option<u64> {
  match value {
    Value::Number(n) => n.as_u64(),
    Value::String(s) => s.parse().ok(),
    _ => None,
  }
}

/// Normalise a record container into `id -> record`.
pub fn records(container: Option<&Value>) -> BTreeMap<u64, Record> {
  let mut out = BTreeMap::new();
  match container {
    Some(Value::Object(map)) => {
      for (key, value) in map {
        if let (Ok(id), Value::Object(record)) = (key.parse::<u64>(), value) {
          out.insert(id, record.clone());
        }
      }
    }
    Some(Value::Array(items)) => {
      for item in items {
        if let Value::Object(record) = item {
          if let Some(id) = record.get("id").and_then(as_id) {
            out.insert(id, record.clone());
          }
        }
      }
    }
    _ => {}
  }
  out
}

/// Entry for `id` in a container that maps ids to arbitrary values
/// (`{"bugs": {"42": [...]}}` or `{"bugs": [{"id": 42, ...}]}`).
pub fn entry_for<'a>(container: Option<&'a Value>, id: u64) -> Option<&'a Value> {
  match container? {
    Value::Object(map) => map.get(&id.to_string()),
    Value::Array(items) => items
      .iter()
      .find(|item| item.get("id").and_then(as_id) == Some(id)),
    _ => None,
  }
}

/// Array field of a value, empty when absent or of the wrong type.
pub fn array_of(value: Option<&Value>) -> Vec<Value> {
  value
    .and_then(Value::as_array)
    .cloned()
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_records_from_object() {
    let body = json!({ "42": { "id": 42, "status": "NEW" }, "junk": 1 });
    let map = records(Some(&body));
    assert_eq!(map.len(), 1);
    assert_eq!(map[&42]["status"], "NEW");
  }

  #[test]
  fn test_records_from_array() {
    let body = json!([{ "id": 1 }, { "id": "2" }, { "summary": "no id" }]);
    let map = records(Some(&body));
    assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
  }

  #[test]
  fn test_entry_for_both_shapes() {
    let keyed = json!({ "7": [1, 2] });
    assert_eq!(entry_for(Some(&keyed), 7), Some(&json!([1, 2])));

    let listed = json!([{ "id": 7, "history": [] }]);
    assert!(entry_for(Some(&listed), 7).is_some());
    assert!(entry_for(Some(&listed), 8).is_none());
    assert!(entry_for(None, 7).is_none());
  }
}

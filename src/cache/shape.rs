//! Listing payload shapes.
//!
//! The API returns collections either as a bare JSON array or wrapped in an
//! object under `data` or `results` (paginated endpoints, with siblings such
//! as `count` and `next`). The shape is resolved once and everything
//! downstream works on `ListShape`.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum ListShape {
  Bare(Vec<Value>),
  Data {
    items: Vec<Value>,
    rest: Map<String, Value>,
  },
  Results {
    items: Vec<Value>,
    rest: Map<String, Value>,
  },
}

impl ListShape {
  /// Resolve the shape of `value`, or hand it back if it is not a listing.
  pub fn from_value(value: Value) -> Result<Self, Value> {
    match value {
      Value::Array(items) => Ok(Self::Bare(items)),
      Value::Object(mut map) => {
        if matches!(map.get("results"), Some(Value::Array(_))) {
          let items = take_array(&mut map, "results");
          Ok(Self::Results { items, rest: map })
        } else if matches!(map.get("data"), Some(Value::Array(_))) {
          let items = take_array(&mut map, "data");
          Ok(Self::Data { items, rest: map })
        } else {
          Err(Value::Object(map))
        }
      }
      other => Err(other),
    }
  }

  pub fn items(&self) -> &[Value] {
    match self {
      Self::Bare(items) => items,
      Self::Data { items, .. } | Self::Results { items, .. } => items,
    }
  }

  pub fn items_mut(&mut self) -> &mut Vec<Value> {
    match self {
      Self::Bare(items) => items,
      Self::Data { items, .. } | Self::Results { items, .. } => items,
    }
  }

  /// Shift a numeric `count` sibling, if present, by `delta`.
  pub fn adjust_count(&mut self, delta: i64) {
    let rest = match self {
      Self::Bare(_) => return,
      Self::Data { rest, .. } | Self::Results { rest, .. } => rest,
    };
    if let Some(count) = rest.get("count").and_then(Value::as_i64) {
      rest.insert("count".to_string(), Value::from((count + delta).max(0)));
    }
  }

  pub fn into_value(self) -> Value {
    match self {
      Self::Bare(items) => Value::Array(items),
      Self::Data { items, mut rest } => {
        rest.insert("data".to_string(), Value::Array(items));
        Value::Object(rest)
      }
      Self::Results { items, mut rest } => {
        rest.insert("results".to_string(), Value::Array(items));
        Value::Object(rest)
      }
    }
  }
}

fn take_array(map: &mut Map<String, Value>, field: &str) -> Vec<Value> {
  match map.remove(field) {
    Some(Value::Array(items)) => items,
    _ => Vec::new(),
  }
}

/// The record's `id` field rendered as a string, whether numeric or textual.
pub fn record_id(record: &Value) -> Option<String> {
  match record.get("id")? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_bare_array() {
    let shape = ListShape::from_value(json!([{"id": 1}])).unwrap();
    assert!(matches!(shape, ListShape::Bare(_)));
    assert_eq!(shape.items().len(), 1);
    assert_eq!(shape.into_value(), json!([{"id": 1}]));
  }

  #[test]
  fn test_results_wrapper_keeps_siblings() {
    let value = json!({"count": 2, "next": null, "results": [{"id": 1}, {"id": 2}]});
    let mut shape = ListShape::from_value(value).unwrap();
    assert!(matches!(shape, ListShape::Results { .. }));
    shape.items_mut().pop();
    shape.adjust_count(-1);
    assert_eq!(
      shape.into_value(),
      json!({"count": 1, "next": null, "results": [{"id": 1}]})
    );
  }

  #[test]
  fn test_data_wrapper() {
    let shape = ListShape::from_value(json!({"data": [], "page": 1})).unwrap();
    assert!(matches!(shape, ListShape::Data { .. }));
  }

  #[test]
  fn test_non_listing_is_returned() {
    let detail = json!({"id": 7, "name": "Acme"});
    assert_eq!(ListShape::from_value(detail.clone()).unwrap_err(), detail);
    assert!(ListShape::from_value(json!({"data": "not a list"})).is_err());
  }

  #[test]
  fn test_record_id_forms() {
    assert_eq!(record_id(&json!({"id": 7})), Some("7".to_string()));
    assert_eq!(record_id(&json!({"id": "tmp-1"})), Some("tmp-1".to_string()));
    assert_eq!(record_id(&json!({"name": "x"})), None);
  }
}

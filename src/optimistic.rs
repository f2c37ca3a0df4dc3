//! Local approximation of the state after a queued write.
//!
//! Cached listings of the affected collection are edited in place so reads
//! reflect the write before the server has seen it. Touched records carry
//! `_sync_state: "pending"`. Nothing here is ever treated as confirmed: the
//! next successful network read of the same key overwrites it.

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::cache::shape::{record_id, ListShape};
use crate::cache::{CacheManager, EndpointKey};
use crate::entity::SyncState;
use crate::error::Result;
use crate::queue::MutationAction;

/// Field added to records that have a queued write outstanding.
pub const SYNC_STATE_FIELD: &str = "_sync_state";

#[derive(Debug, Clone, PartialEq)]
enum Edit<'a> {
  Prepend(&'a Value),
  Merge { id: &'a str, patch: &'a Value },
  Remove { id: &'a str },
  Replace { id: &'a str, record: Option<&'a Value> },
}

#[derive(Clone)]
pub struct OptimisticEngine {
  cache: CacheManager,
}

impl OptimisticEngine {
  pub fn new(cache: CacheManager) -> Self {
    Self { cache }
  }

  /// Reflect a queued write in the cache and return the provisional record.
  ///
  /// `temp_id` is the identifier given to a created record.
  pub fn apply(
    &self,
    action: MutationAction,
    key: &EndpointKey,
    body: &Value,
    temp_id: Option<&str>,
  ) -> Result<Value> {
    let collection = key.collection();
    match action {
      MutationAction::Create => {
        let mut record = as_object(body);
        if let Some(id) = temp_id {
          record.insert("id".to_string(), Value::String(id.to_string()));
        }
        let mut record = Value::Object(record);
        mark_pending(&mut record);
        let edited = self.edit_collection(&collection, &Edit::Prepend(&record))?;
        debug!(key = %key, edited, "applied optimistic create");
        Ok(record)
      }
      MutationAction::Update => {
        let Some(id) = key.record_id() else {
          let mut record = body.clone();
          mark_pending(&mut record);
          return Ok(record);
        };
        let edited = self.edit_collection(&collection, &Edit::Merge { id, patch: body })?;

        let mut record = match self.cache.entry(key.resource())? {
          Some(entry) => {
            let mut detail = entry.payload;
            merge_patch(&mut detail, body);
            mark_pending(&mut detail);
            self.cache.replace_payload(key.resource(), &detail)?;
            detail
          }
          None => {
            let mut record = Value::Object(as_object(body));
            if let Value::Object(map) = &mut record {
              map
                .entry("id".to_string())
                .or_insert_with(|| Value::String(id.to_string()));
            }
            record
          }
        };
        mark_pending(&mut record);
        debug!(key = %key, edited, "applied optimistic update");
        Ok(record)
      }
      MutationAction::Delete => {
        let Some(id) = key.record_id() else {
          return Ok(Value::Null);
        };
        let edited = self.edit_collection(&collection, &Edit::Remove { id })?;
        let resource = key.resource().to_string();
        self.cache.invalidate(|k| k.resource() == resource)?;
        debug!(key = %key, edited, "applied optimistic delete");

        let mut record = json!({ "id": id });
        mark_pending(&mut record);
        Ok(record)
      }
    }
  }

  /// Fold the server's answer to a replayed write back into the cache.
  ///
  /// The optimistic record is replaced by the server record when the
  /// response carries one, otherwise its pending marker is removed.
  pub fn confirm(
    &self,
    action: MutationAction,
    key: &EndpointKey,
    temp_id: Option<&str>,
    response: &Value,
  ) -> Result<()> {
    let server_record = response.is_object().then_some(response);
    let collection = key.collection();

    match action {
      MutationAction::Create => {
        let Some(temp_id) = temp_id else {
          return Ok(());
        };
        self.edit_collection(
          &collection,
          &Edit::Replace {
            id: temp_id,
            record: server_record,
          },
        )?;
        if let Some(record) = server_record {
          if let Some(real_id) = record_id(record) {
            let detail = EndpointKey::parse(&key.record_path(&real_id))?;
            self.cache.put(&detail, record)?;
          }
        }
      }
      MutationAction::Update => {
        let Some(id) = key.record_id() else {
          return Ok(());
        };
        let record = server_record.filter(|r| record_id(r).as_deref() == Some(id));
        self.edit_collection(&collection, &Edit::Replace { id, record })?;
        if let Some(entry) = self.cache.entry(key.resource())? {
          let confirmed = match record {
            Some(record) => record.clone(),
            None => {
              let mut detail = entry.payload;
              strip_marker(&mut detail);
              detail
            }
          };
          self.cache.replace_payload(key.resource(), &confirmed)?;
        }
      }
      MutationAction::Delete => {}
    }
    Ok(())
  }

  /// Apply `edit` to every live cached listing of `collection`.
  fn edit_collection(&self, collection: &str, edit: &Edit<'_>) -> Result<usize> {
    let mut edited = 0;
    for entry in self.cache.live_entries_for(collection)? {
      if let Some(payload) = edit_listing(entry.payload, edit) {
        self.cache.replace_payload(&entry.endpoint_key, &payload)?;
        edited += 1;
      }
    }
    Ok(edited)
  }
}

/// Apply `edit` to a listing payload. Returns `None` if the payload is not a
/// listing or nothing matched.
fn edit_listing(payload: Value, edit: &Edit<'_>) -> Option<Value> {
  let mut shape = ListShape::from_value(payload).ok()?;
  let position = |items: &[Value], id: &str| {
    items
      .iter()
      .position(|item| record_id(item).as_deref() == Some(id))
  };

  match edit {
    Edit::Prepend(record) => {
      shape.items_mut().insert(0, (*record).clone());
      shape.adjust_count(1);
    }
    Edit::Merge { id, patch } => {
      let index = position(shape.items(), *id)?;
      let item = &mut shape.items_mut()[index];
      merge_patch(item, *patch);
      mark_pending(item);
    }
    Edit::Remove { id } => {
      let index = position(shape.items(), *id)?;
      shape.items_mut().remove(index);
      shape.adjust_count(-1);
    }
    Edit::Replace { id, record } => {
      let index = position(shape.items(), *id)?;
      let item = &mut shape.items_mut()[index];
      match record {
        Some(record) => *item = (*record).clone(),
        None => strip_marker(item),
      }
    }
  }
  Some(shape.into_value())
}

fn as_object(value: &Value) -> Map<String, Value> {
  match value {
    Value::Object(map) => map.clone(),
    _ => Map::new(),
  }
}

/// Shallow merge of `patch` into `target`. Non-object patches are ignored.
pub fn merge_patch(target: &mut Value, patch: &Value) {
  if let (Value::Object(target), Value::Object(patch)) = (target, patch) {
    for (field, value) in patch {
      target.insert(field.clone(), value.clone());
    }
  }
}

pub fn mark_pending(record: &mut Value) {
  if let Value::Object(map) = record {
    map.insert(
      SYNC_STATE_FIELD.to_string(),
      Value::String(SyncState::Pending.as_str().to_string()),
    );
  }
}

pub fn strip_marker(record: &mut Value) {
  if let Value::Object(map) = record {
    map.remove(SYNC_STATE_FIELD);
  }
}

pub fn is_pending(record: &Value) -> bool {
  record.get(SYNC_STATE_FIELD).and_then(Value::as_str) == Some(SyncState::Pending.as_str())
}

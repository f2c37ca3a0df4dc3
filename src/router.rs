//! The single entry point for API requests.
//!
//! Callers never check connectivity themselves. The router re-reads the
//! connectivity signal on every request and picks a path:
//!
//! - online read: network, cached on success; a connection error falls back to the cache
//! - offline read: cache or `NoCachedData`
//! - online write: network, related cached reads invalidated on success
//! - offline write: queued and applied optimistically, answered with a provisional result

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{Method, Transport};
use crate::cache::key::new_temp_id;
use crate::cache::{CacheManager, EndpointKey};
use crate::connectivity::Connectivity;
use crate::entity::SyncState;
use crate::error::{Error, Result, TransportError};
use crate::optimistic::{mark_pending, OptimisticEngine};
use crate::queue::{
  collect_temp_ids, replace_string_values, MutationAction, MutationQueue, NewMutation, SyncLedger,
};

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
  Network,
  Cache,
  /// Synthesised locally for a queued write
  Optimistic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
  pub data: Value,
  pub source: ResponseSource,
  /// Not confirmed by the server
  pub provisional: bool,
  /// Served from a cached sibling with different query parameters
  pub approximate: bool,
  pub cached_at: Option<DateTime<Utc>>,
  pub queue_id: Option<i64>,
}

impl Response {
  fn network(data: Value) -> Self {
    Self {
      data,
      source: ResponseSource::Network,
      provisional: false,
      approximate: false,
      cached_at: None,
      queue_id: None,
    }
  }
}

#[derive(Clone)]
pub struct RequestRouter {
  transport: Arc<dyn Transport>,
  cache: CacheManager,
  queue: MutationQueue,
  ledger: SyncLedger,
  optimistic: OptimisticEngine,
  connectivity: Connectivity,
}

impl RequestRouter {
  pub fn new(
    transport: Arc<dyn Transport>,
    cache: CacheManager,
    queue: MutationQueue,
    ledger: SyncLedger,
    connectivity: Connectivity,
  ) -> Self {
    let optimistic = OptimisticEngine::new(cache.clone());
    Self {
      transport,
      cache,
      queue,
      ledger,
      optimistic,
      connectivity,
    }
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn optimistic(&self) -> &OptimisticEngine {
    &self.optimistic
  }

  pub async fn get(&self, key: &str) -> Result<Response> {
    self.request(Method::Get, key, None).await
  }

  /// Perform a logical request.
  pub async fn request(&self, method: Method, key: &str, body: Option<Value>) -> Result<Response> {
    let key = EndpointKey::parse(key)?;
    let (key, body, unresolved) = self.resolve_temp_ids(key, body);
    let online = self.connectivity.is_online();

    match MutationAction::from_method(method) {
      None => {
        if online && unresolved.is_empty() {
          self.read_online(&key).await
        } else {
          self.read_cached(&key)
        }
      }
      Some(action) => {
        if !online {
          return self.enqueue(action, method, key, body);
        }
        if !unresolved.is_empty() {
          debug!(key = %key, ?unresolved, "write references unsynced records, queueing");
          return self.enqueue(action, method, key, body);
        }
        self.write_online(action, method, key, body).await
      }
    }
  }

  /// GET from the network and cache the result, whatever the connectivity signal says.
  pub async fn refresh(&self, key: &str) -> Result<Response> {
    let key = EndpointKey::parse(key)?;
    let data = self.transport.send(Method::Get, &key, None).await?;
    self.store_read(&key, &data);
    Ok(Response::network(data))
  }

  /// Send a request straight to the server, rewriting temporary ids that
  /// have since been resolved. Used to replay queued writes.
  pub(crate) async fn dispatch(
    &self,
    method: Method,
    key: &EndpointKey,
    body: Option<&Value>,
  ) -> std::result::Result<Value, TransportError> {
    let (key, body, _) = self.resolve_temp_ids(key.clone(), body.cloned());
    self.transport.send(method, &key, body.as_ref()).await
  }

  async fn read_online(&self, key: &EndpointKey) -> Result<Response> {
    match self.transport.send(Method::Get, key, None).await {
      Ok(data) => {
        self.store_read(key, &data);
        Ok(Response::network(data))
      }
      Err(TransportError::Connection(reason)) => {
        warn!(key = %key, %reason, "network unreachable, serving from cache");
        self.read_cached(key)
      }
      Err(err) => Err(err.into()),
    }
  }

  fn read_cached(&self, key: &EndpointKey) -> Result<Response> {
    let miss = || Error::NoCachedData {
      key: key.as_str().to_string(),
    };
    let hit = match self.cache.get(key) {
      Ok(hit) => hit,
      Err(Error::StorageUnavailable(reason)) => {
        debug!(key = %key, %reason, "no local storage for offline read");
        None
      }
      Err(err) => return Err(err),
    };

    let hit = hit.ok_or_else(miss)?;
    Ok(Response {
      data: hit.response.payload,
      source: ResponseSource::Cache,
      provisional: false,
      approximate: hit.approximate,
      cached_at: Some(hit.response.cached_at),
      queue_id: None,
    })
  }

  fn store_read(&self, key: &EndpointKey, data: &Value) {
    match self.cache.put(key, data) {
      Ok(()) => {}
      Err(Error::StorageUnavailable(_)) => {}
      Err(err) => warn!(key = %key, error = %err, "failed to cache response"),
    }
  }

  async fn write_online(
    &self,
    action: MutationAction,
    method: Method,
    key: EndpointKey,
    body: Option<Value>,
  ) -> Result<Response> {
    match self.transport.send(method, &key, body.as_ref()).await {
      Ok(data) => {
        let collection = key.collection();
        match self.cache.invalidate_collection(&collection) {
          Ok(_) | Err(Error::StorageUnavailable(_)) => {}
          Err(err) => warn!(%collection, error = %err, "failed to invalidate cached reads"),
        }
        Ok(Response::network(data))
      }
      Err(TransportError::Connection(reason)) => {
        warn!(key = %key, %reason, "network unreachable, queueing write");
        self.enqueue(action, method, key, body)
      }
      Err(err) => Err(err.into()),
    }
  }

  fn enqueue(
    &self,
    action: MutationAction,
    method: Method,
    key: EndpointKey,
    body: Option<Value>,
  ) -> Result<Response> {
    let payload = body.unwrap_or(Value::Null);
    let temp_id = (action == MutationAction::Create).then(new_temp_id);
    let entity_kind = key.entity_kind();

    let item = self.queue.enqueue(NewMutation {
      action,
      entity_kind,
      method,
      endpoint_key: key.clone(),
      payload: payload.clone(),
      temp_id: temp_id.clone(),
    })?;

    // Queued from here on: later errors are logged, not returned.
    let data = match self
      .optimistic
      .apply(action, &key, &payload, temp_id.as_deref())
    {
      Ok(data) => data,
      Err(err) => {
        warn!(id = item.id, key = %key, error = %err, "queued write not reflected in cached reads");
        provisional_record(&payload, temp_id.as_deref())
      }
    };

    let record_id = temp_id.as_deref().or(key.record_id());
    if let Some(record_id) = record_id {
      if let Err(err) = self
        .ledger
        .set_state(entity_kind, record_id, SyncState::Pending, Some(item.id))
      {
        warn!(id = item.id, record_id, error = %err, "failed to tag record as pending");
      }
    }

    info!(id = item.id, key = %key, "write queued for sync");
    Ok(Response {
      data,
      source: ResponseSource::Optimistic,
      provisional: true,
      approximate: false,
      cached_at: None,
      queue_id: Some(item.id),
    })
  }

  /// Rewrite temporary ids whose create has synced. Returns the ids that
  /// are still unresolved.
  fn resolve_temp_ids(
    &self,
    mut key: EndpointKey,
    mut body: Option<Value>,
  ) -> (EndpointKey, Option<Value>, Vec<String>) {
    let mut ids: Vec<String> = key.temp_ids().into_iter().map(String::from).collect();
    if let Some(body) = &body {
      collect_temp_ids(body, &mut ids);
    }
    ids.sort();
    ids.dedup();

    let mut unresolved = Vec::new();
    for id in ids {
      match self.ledger.resolve(&id).ok().flatten() {
        Some(real_id) => {
          key = key.with_segment_replaced(&id, &real_id);
          if let Some(body) = body.as_mut() {
            replace_string_values(body, &id, &real_id);
          }
        }
        None => unresolved.push(id),
      }
    }
    (key, body, unresolved)
  }
}

/// The request body as it would read once accepted, for when the cache
/// could not be edited.
fn provisional_record(body: &Value, temp_id: Option<&str>) -> Value {
  let mut record = body.clone();
  if let (Value::Object(map), Some(id)) = (&mut record, temp_id) {
    map.insert("id".to_string(), Value::String(id.to_string()));
  }
  mark_pending(&mut record);
  record
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::mock::MockTransport;
  use crate::entity::EntityKind;
  use crate::optimistic::is_pending;
  use crate::queue::QueueStatus;
  use crate::store::Store;
  use serde_json::json;

  struct Harness {
    router: RequestRouter,
    transport: Arc<MockTransport>,
    cache: CacheManager,
    queue: MutationQueue,
    ledger: SyncLedger,
  }

  fn harness_with(store: Store, online: bool) -> Harness {
    let store = Arc::new(store);
    let transport = Arc::new(MockTransport::new());
    let cache = CacheManager::new(store.clone());
    let queue = MutationQueue::new(store.clone());
    let ledger = SyncLedger::new(store);
    let router = RequestRouter::new(
      transport.clone(),
      cache.clone(),
      queue.clone(),
      ledger.clone(),
      Connectivity::new(online),
    );
    Harness {
      router,
      transport,
      cache,
      queue,
      ledger,
    }
  }

  fn harness(online: bool) -> Harness {
    harness_with(Store::open_in_memory().unwrap(), online)
  }

  fn connection_lost() -> std::result::Result<Value, TransportError> {
    Err(TransportError::Connection("connection reset".into()))
  }

  #[tokio::test]
  async fn test_online_read_is_cached_and_served_offline() {
    let h = harness(true);
    h.transport
      .respond(Method::Get, "/patients/", Ok(json!([{"id": 1}])));

    let response = h.router.get("/patients/").await.unwrap();
    assert_eq!(response.source, ResponseSource::Network);

    h.router.connectivity().set_online(false);
    let response = h.router.get("/patients/").await.unwrap();
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.data, json!([{"id": 1}]));
    assert!(response.cached_at.is_some());
    assert_eq!(h.transport.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_offline_read_miss_is_an_error() {
    let h = harness(false);
    let err = h.router.get("/patients/").await.unwrap_err();
    assert!(matches!(err, Error::NoCachedData { ref key } if key == "/patients/"));
    assert!(h.transport.calls().is_empty());
  }

  #[tokio::test]
  async fn test_connection_loss_falls_back_to_cache() {
    let h = harness(true);
    h.cache
      .put(&EndpointKey::parse("/patients/").unwrap(), &json!(["cached"]))
      .unwrap();
    h.transport.respond(Method::Get, "/patients/", connection_lost());

    let response = h.router.get("/patients/").await.unwrap();
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.data, json!(["cached"]));

    let err = h.router.get("/employees/").await.unwrap_err();
    assert!(matches!(err, Error::NoCachedData { .. }));
  }

  #[tokio::test]
  async fn test_server_errors_do_not_fall_back() {
    let h = harness(true);
    h.cache
      .put(&EndpointKey::parse("/patients/").unwrap(), &json!([]))
      .unwrap();
    h.transport
      .respond(Method::Get, "/patients/", Err(TransportError::status(500, "boom")));
    let err = h.router.get("/patients/").await.unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::Status { status: 500, .. })));
  }

  #[tokio::test]
  async fn test_offline_write_is_queued_and_reflected() {
    let h = harness(true);
    h.transport.respond(
      Method::Get,
      "/organizations/",
      Ok(json!({"count": 1, "results": [{"id": 7, "name": "Acme"}]})),
    );
    h.router.get("/organizations/").await.unwrap();

    h.router.connectivity().set_online(false);
    let response = h
      .router
      .request(
        Method::Patch,
        "/organizations/7/",
        Some(json!({"name": "Acme West"})),
      )
      .await
      .unwrap();
    assert_eq!(response.source, ResponseSource::Optimistic);
    assert!(response.provisional);
    let queue_id = response.queue_id.unwrap();

    let item = h.queue.get(queue_id).unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.action, MutationAction::Update);
    assert_eq!(item.entity_kind, EntityKind::Organization);

    let list = h.router.get("/organizations/").await.unwrap().data;
    assert_eq!(list["results"][0]["name"], "Acme West");
    assert!(is_pending(&list["results"][0]));
    assert_eq!(
      h.ledger.state(EntityKind::Organization, "7").unwrap(),
      SyncState::Pending
    );
    assert_eq!(h.transport.call_count(Method::Patch, "/organizations/7/"), 0);
  }

  #[tokio::test]
  async fn test_network_read_replaces_optimistic_edits() {
    let h = harness(true);
    let server_list = json!([{"id": 1, "name": "Ann"}, {"id": 2, "name": "Bob"}]);
    h.transport
      .respond(Method::Get, "/patients/", Ok(server_list.clone()));
    h.router.get("/patients/").await.unwrap();

    h.router.connectivity().set_online(false);
    h.router
      .request(Method::Post, "/patients/", Some(json!({"name": "Cy"})))
      .await
      .unwrap();
    h.router
      .request(Method::Delete, "/patients/2/", None)
      .await
      .unwrap();
    let offline = h.router.get("/patients/").await.unwrap().data;
    let ids: Vec<Value> = offline
      .as_array()
      .unwrap()
      .iter()
      .map(|r| r["id"].clone())
      .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids[0].as_str().unwrap().starts_with("tmp-"));
    assert_eq!(ids[1], json!(1));

    h.router.connectivity().set_online(true);
    let response = h.router.get("/patients/").await.unwrap();
    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(response.data, server_list);

    h.router.connectivity().set_online(false);
    let cached = h.router.get("/patients/").await.unwrap();
    assert_eq!(cached.source, ResponseSource::Cache);
    assert_eq!(cached.data, server_list);
    assert_eq!(h.queue.counts().unwrap().pending, 2);
  }

  #[tokio::test]
  async fn test_queued_write_survives_unreadable_cached_listing() {
    let store = Store::open_in_memory().unwrap();
    store
      .with_conn(|conn| {
        conn.execute(
          "INSERT INTO cached_responses (endpoint_key, resource, payload, cached_at, expires_at)
           VALUES ('/patients/', '/patients/', '{not json', 1, ?)",
          [i64::MAX],
        )
      })
      .unwrap();
    let h = harness_with(store, false);

    let response = h
      .router
      .request(Method::Post, "/patients/", Some(json!({"name": "Ann"})))
      .await
      .unwrap();
    assert!(response.provisional);
    assert_eq!(response.data["name"], "Ann");
    assert!(response.data["id"].as_str().unwrap().starts_with("tmp-"));
    assert!(is_pending(&response.data));
    assert_eq!(h.queue.counts().unwrap().pending, 1);
  }

  #[tokio::test]
  async fn test_online_write_invalidates_collection() {
    let h = harness(true);
    h.cache
      .put(&EndpointKey::parse("/organizations/?page=1").unwrap(), &json!([]))
      .unwrap();
    h.cache
      .put(&EndpointKey::parse("/patients/").unwrap(), &json!([]))
      .unwrap();
    h.transport.respond(
      Method::Patch,
      "/organizations/7/",
      Ok(json!({"id": 7, "name": "Acme West"})),
    );

    let response = h
      .router
      .request(Method::Patch, "/organizations/7/", Some(json!({"name": "Acme West"})))
      .await
      .unwrap();
    assert_eq!(response.source, ResponseSource::Network);
    assert!(h.cache.entry("/organizations/?page=1").unwrap().is_none());
    assert!(h.cache.entry("/patients/").unwrap().is_some());
    assert_eq!(h.queue.counts().unwrap().pending, 0);
  }

  #[tokio::test]
  async fn test_write_during_connection_loss_is_queued() {
    let h = harness(true);
    h.transport.respond(Method::Post, "/patients/", connection_lost());
    let response = h
      .router
      .request(Method::Post, "/patients/", Some(json!({"name": "Ann"})))
      .await
      .unwrap();
    assert!(response.provisional);
    assert_eq!(h.queue.counts().unwrap().pending, 1);
  }

  #[tokio::test]
  async fn test_temp_ids_queue_until_resolved() {
    let h = harness(false);
    let created = h
      .router
      .request(Method::Post, "/patients/", Some(json!({"name": "Ann"})))
      .await
      .unwrap();
    let temp_id = created.data["id"].as_str().unwrap().to_string();
    assert!(temp_id.starts_with("tmp-"));

    h.router.connectivity().set_online(true);
    let follow_up = h
      .router
      .request(
        Method::Patch,
        &format!("/patients/{}/", temp_id),
        Some(json!({"name": "Anne"})),
      )
      .await
      .unwrap();
    assert!(follow_up.provisional);
    assert!(h.transport.calls().is_empty());

    h.ledger
      .record_mapping(&temp_id, "42", EntityKind::Patient)
      .unwrap();
    h.transport
      .respond(Method::Get, "/patients/42/", Ok(json!({"id": 42})));
    let response = h
      .router
      .get(&format!("/patients/{}/", temp_id))
      .await
      .unwrap();
    assert_eq!(response.data, json!({"id": 42}));
    assert_eq!(h.transport.call_count(Method::Get, "/patients/42/"), 1);
  }

  #[tokio::test]
  async fn test_without_storage_reads_work_online_and_writes_fail_offline() {
    let h = harness_with(Store::unavailable("private mode"), true);
    h.transport.respond(Method::Get, "/patients/", Ok(json!([])));
    assert!(h.router.get("/patients/").await.is_ok());

    h.router.connectivity().set_online(false);
    assert!(matches!(
      h.router.get("/patients/").await.unwrap_err(),
      Error::NoCachedData { .. }
    ));
    let err = h
      .router
      .request(Method::Post, "/patients/", Some(json!({})))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::StorageUnavailable(_)));
  }

  #[tokio::test]
  async fn test_refresh_ignores_connectivity() {
    let h = harness(false);
    h.transport.respond(Method::Get, "/patients/", Ok(json!([1])));
    h.router.refresh("/patients/").await.unwrap();
    assert_eq!(h.cache.entry("/patients/").unwrap().unwrap().payload, json!([1]));
  }
}

//! Scripted transport for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::transport::{Method, Transport};
use crate::cache::EndpointKey;
use crate::error::TransportError;

type Reply = Result<Value, TransportError>;

/// A recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
  pub method: Method,
  pub key: String,
  pub body: Option<Value>,
}

/// Transport answering from scripted replies.
///
/// One-shot replies are consumed first, then the standing reply for the
/// route, and unmatched routes get a 404.
#[derive(Default)]
pub struct MockTransport {
  once: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
  standing: Mutex<HashMap<(Method, String), Reply>>,
  calls: Mutex<Vec<Call>>,
  sent_at: Mutex<Vec<Instant>>,
  delay: Option<Duration>,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Hold every request for `delay` before answering.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn respond(&self, method: Method, key: &str, reply: Reply) {
    self
      .standing
      .lock()
      .unwrap()
      .insert((method, normalize(key)), reply);
  }

  pub fn respond_once(&self, method: Method, key: &str, reply: Reply) {
    self
      .once
      .lock()
      .unwrap()
      .entry((method, normalize(key)))
      .or_default()
      .push_back(reply);
  }

  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, method: Method, key: &str) -> usize {
    let key = normalize(key);
    self
      .calls()
      .iter()
      .filter(|c| c.method == method && c.key == key)
      .count()
  }

  /// When each call arrived, in arrival order.
  pub fn sent_at(&self) -> Vec<Instant> {
    self.sent_at.lock().unwrap().clone()
  }

  /// Highest number of requests that were in flight at the same time.
  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }
}

fn normalize(key: &str) -> String {
  EndpointKey::parse(key)
    .map(|k| k.as_str().to_string())
    .unwrap_or_else(|_| key.to_string())
}

#[async_trait]
impl Transport for MockTransport {
  async fn send(&self, method: Method, key: &EndpointKey, body: Option<&Value>) -> Reply {
    self.calls.lock().unwrap().push(Call {
      method,
      key: key.as_str().to_string(),
      body: body.cloned(),
    });
    self.sent_at.lock().unwrap().push(Instant::now());

    let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(current, Ordering::SeqCst);
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    let route = (method, key.as_str().to_string());
    if let Some(reply) = self
      .once
      .lock()
      .unwrap()
      .get_mut(&route)
      .and_then(|replies| replies.pop_front())
    {
      return reply;
    }

    self
      .standing
      .lock()
      .unwrap()
      .get(&route)
      .cloned()
      .unwrap_or_else(|| Err(TransportError::status(404, "Not found.")))
  }
}

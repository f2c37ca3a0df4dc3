//! reqwest-backed transport for the clinic REST API.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::session::Session;
use super::transport::{Method, Transport};
use crate::cache::EndpointKey;
use crate::config::Config;
use crate::error::{Error, Result, TransportError};

const MAX_LOG_BODY_CHARS: usize = 512;

/// HTTP client for the remote API.
///
/// Every request carries the bearer token currently held by the session.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: String,
  session: Session,
}

impl HttpTransport {
  pub fn new(config: &Config, session: Session) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.api.timeout_secs))
      .build()
      .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url: config.api.base_url.trim_end_matches('/').to_string(),
      session,
    })
  }

  fn url(&self, key: &EndpointKey) -> String {
    format!("{}{}", self.base_url, key.as_str())
  }

  fn headers(&self) -> std::result::Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    if let Some(token) = self.session.token() {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| TransportError::status(401, "Invalid access token format"))?;
      headers.insert(AUTHORIZATION, value);
    }

    Ok(headers)
  }

  fn log_response(status: reqwest::StatusCode, body: &str) {
    if status.is_success() {
      debug!("API response status: {}", status);
      return;
    }

    let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
      preview.push_str("...");
    }
    debug!("API response error ({}): {}", status, preview);
  }

  async fn parse_response(response: reqwest::Response) -> std::result::Result<Value, TransportError> {
    let status = response.status();
    let body = response.text().await?;
    Self::log_response(status, &body);

    if !status.is_success() {
      return Err(TransportError::status(status.as_u16(), error_message(&body)));
    }

    if body.trim().is_empty() {
      return Ok(Value::Null);
    }

    serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()))
  }
}

/// Pull a human-readable message out of an error body.
fn error_message(body: &str) -> String {
  if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
    for field in ["detail", "message", "error"] {
      if let Some(Value::String(msg)) = map.get(field) {
        return msg.clone();
      }
    }
  }
  let trimmed = body.trim();
  if trimmed.is_empty() {
    "Request failed".to_string()
  } else {
    format!("Request failed: {}", trimmed)
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(
    &self,
    method: Method,
    key: &EndpointKey,
    body: Option<&Value>,
  ) -> std::result::Result<Value, TransportError> {
    let url = self.url(key);
    debug!(%method, %url, "sending request");

    let builder = match method {
      Method::Get => self.client.get(&url),
      Method::Post => self.client.post(&url),
      Method::Put => self.client.put(&url),
      Method::Patch => self.client.patch(&url),
      Method::Delete => self.client.delete(&url),
    };

    let mut builder = builder.headers(self.headers()?);
    if let Some(body) = body {
      builder = builder.json(body);
    }

    let response = builder.send().await?;
    Self::parse_response(response).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_url_joins_base_and_key() {
    let config = Config::with_base_url("https://clinic.test/api/");
    let transport = HttpTransport::new(&config, Session::new()).unwrap();
    let key = EndpointKey::parse("/patients/?page=2").unwrap();
    assert_eq!(transport.url(&key), "https://clinic.test/api/patients/?page=2");
  }

  #[test]
  fn test_bearer_header_follows_session() {
    let config = Config::with_base_url("https://clinic.test/api");
    let session = Session::new();
    let transport = HttpTransport::new(&config, session.clone()).unwrap();
    assert!(transport.headers().unwrap().get(AUTHORIZATION).is_none());

    session.set_token("tok");
    let headers = transport.headers().unwrap();
    assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok");
  }

  #[test]
  fn test_error_message_extraction() {
    assert_eq!(error_message(r#"{"detail": "Not found."}"#), "Not found.");
    assert_eq!(error_message(""), "Request failed");
    assert_eq!(error_message("oops"), "Request failed: oops");
  }
}

//! Logical request identity.
//!
//! An endpoint key is the API path plus its query string, relative to the API
//! base URL. Keys are normalised so that `?b=2&a=1` and `?a=1&b=2` address the
//! same cache entry.

use std::fmt;
use url::Url;
use uuid::Uuid;

use crate::entity::EntityKind;
use crate::error::{Error, Result};

/// Prefix of identifiers assigned to records created while offline.
pub const TEMP_ID_PREFIX: &str = "tmp-";

const PARSE_BASE: &str = "http://endpoint.local/";

/// Mint a fresh temporary identifier.
pub fn new_temp_id() -> String {
  format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4())
}

/// Whether `value` is a temporary identifier.
pub fn is_temp_id(value: &str) -> bool {
  value.starts_with(TEMP_ID_PREFIX)
}

/// Whether a path segment identifies a single record.
pub fn is_record_id(segment: &str) -> bool {
  !segment.is_empty()
    && (segment.bytes().all(|b| b.is_ascii_digit())
      || Uuid::parse_str(segment).is_ok()
      || is_temp_id(segment))
}

/// Parsed, normalised endpoint key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
  path: String,
  query: Vec<(String, String)>,
  normalized: String,
}

impl EndpointKey {
  pub fn parse(key: &str) -> Result<Self> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
      return Err(Error::InvalidEndpoint("empty endpoint key".to_string()));
    }
    if trimmed.contains("://") {
      return Err(Error::InvalidEndpoint(format!(
        "'{}' must be relative to the API base URL",
        trimmed
      )));
    }

    let base = Url::parse(PARSE_BASE).map_err(|e| Error::InvalidEndpoint(e.to_string()))?;
    let url = base
      .join(trimmed.trim_start_matches('/'))
      .map_err(|e| Error::InvalidEndpoint(format!("'{}': {}", trimmed, e)))?;

    let mut query: Vec<(String, String)> = url
      .query_pairs()
      .map(|(k, v)| (k.into_owned(), v.into_owned()))
      .collect();
    query.sort();

    Ok(Self::from_parts(url.path().to_string(), query))
  }

  fn from_parts(path: String, query: Vec<(String, String)>) -> Self {
    let normalized = if query.is_empty() {
      path.clone()
    } else {
      let encoded = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(query.iter())
        .finish();
      format!("{}?{}", path, encoded)
    };

    Self {
      path,
      query,
      normalized,
    }
  }

  /// Normalised `path?query` form used as the cache key.
  pub fn as_str(&self) -> &str {
    &self.normalized
  }

  /// The path without query string. All parameterisations of one listing
  /// share this value.
  pub fn resource(&self) -> &str {
    &self.path
  }

  pub fn has_query(&self) -> bool {
    !self.query.is_empty()
  }

  pub fn query(&self) -> &[(String, String)] {
    &self.query
  }

  pub fn segments(&self) -> impl Iterator<Item = &str> {
    self.path.split('/').filter(|s| !s.is_empty())
  }

  /// Identifier of the addressed record, if the path ends in one.
  pub fn record_id(&self) -> Option<&str> {
    self.segments().last().filter(|s| is_record_id(s))
  }

  /// Path of the collection holding the addressed record(s), with a
  /// trailing slash: `/organizations/7/` → `/organizations/`.
  pub fn collection(&self) -> String {
    let mut segments: Vec<&str> = self.segments().collect();
    if segments.last().is_some_and(|s| is_record_id(s)) {
      segments.pop();
    }
    if segments.is_empty() {
      return "/".to_string();
    }
    format!("/{}/", segments.join("/"))
  }

  /// Path of a single record inside this key's collection.
  pub fn record_path(&self, id: &str) -> String {
    format!("{}{}/", self.collection(), id)
  }

  /// Entity kind of the records addressed by this key.
  pub fn entity_kind(&self) -> EntityKind {
    self
      .segments()
      .filter(|s| !is_record_id(s))
      .last()
      .map(EntityKind::from_segment)
      .unwrap_or(EntityKind::Other)
  }

  /// Temporary identifiers appearing in the path.
  pub fn temp_ids(&self) -> Vec<&str> {
    self.segments().filter(|s| is_temp_id(s)).collect()
  }

  /// Copy of this key with every path segment equal to `from` replaced by `to`.
  pub fn with_segment_replaced(&self, from: &str, to: &str) -> Self {
    let trailing = self.path.ends_with('/');
    let mut path = String::from("/");
    let segments: Vec<&str> = self
      .segments()
      .map(|s| if s == from { to } else { s })
      .collect();
    path.push_str(&segments.join("/"));
    if trailing && !segments.is_empty() {
      path.push('/');
    }
    Self::from_parts(path, self.query.clone())
  }
}

impl fmt::Display for EndpointKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.normalized)
  }
}

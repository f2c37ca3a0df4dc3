use std::sync::{Arc, RwLock};

/// Bearer token of the signed-in user, shared with the HTTP transport.
#[derive(Debug, Clone, Default)]
pub struct Session {
  token: Arc<RwLock<Option<String>>>,
}

impl Session {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_token(&self, token: impl Into<String>) {
    if let Ok(mut t) = self.token.write() {
      *t = Some(token.into());
    }
  }

  pub fn clear(&self) {
    if let Ok(mut t) = self.token.write() {
      *t = None;
    }
  }

  pub fn token(&self) -> Option<String> {
    self.token.read().ok().and_then(|t| t.clone())
  }

  pub fn is_authenticated(&self) -> bool {
    self.token().is_some()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_token_is_shared_between_clones() {
    let session = Session::new();
    let other = session.clone();
    session.set_token("abc");
    assert_eq!(other.token().as_deref(), Some("abc"));
    other.clear();
    assert!(!session.is_authenticated());
  }
}

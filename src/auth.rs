//! Sign-in, sign-out and session resume.
//!
//! Online sign-in goes to the API and caches the result in the credential
//! vault. When the device is offline, or the sign-in call cannot reach the
//! server, the vault answers instead.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{Method, Session, Transport};
use crate::cache::EndpointKey;
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::error::{Error, Result, TransportError};
use crate::store::Flags;
use crate::vault::cipher::normalize_email;
use crate::vault::CredentialVault;

/// How the current session was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginMode {
  Online,
  Offline,
  /// Token supplied through the environment
  Token,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginOutcome {
  pub email: Option<String>,
  pub mode: LoginMode,
  pub profile: Value,
}

/// Body returned by the login endpoint. Token field names vary between
/// deployments.
#[derive(Debug, Deserialize)]
struct LoginResponse {
  #[serde(alias = "access", alias = "access_token", alias = "key")]
  token: String,
  #[serde(default, alias = "profile")]
  user: Value,
}

#[derive(Clone)]
pub struct AuthService {
  transport: Arc<dyn Transport>,
  session: Session,
  vault: CredentialVault,
  flags: Arc<Flags>,
  connectivity: Connectivity,
  login_path: String,
}

impl AuthService {
  pub fn new(
    transport: Arc<dyn Transport>,
    session: Session,
    vault: CredentialVault,
    flags: Arc<Flags>,
    connectivity: Connectivity,
    login_path: impl Into<String>,
  ) -> Self {
    Self {
      transport,
      session,
      vault,
      flags,
      connectivity,
      login_path: login_path.into(),
    }
  }

  pub fn session(&self) -> &Session {
    &self.session
  }

  /// Email of the last account that signed in on this device.
  pub fn active_email(&self) -> Option<String> {
    self.flags.get().active_email
  }

  pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome> {
    if !self.connectivity.is_online() {
      return self.login_offline(email, password);
    }

    let key = EndpointKey::parse(&self.login_path)?;
    let body = json!({ "email": email, "password": password });
    match self.transport.send(Method::Post, &key, Some(&body)).await {
      Ok(value) => {
        let response: LoginResponse = serde_json::from_value(value)?;
        self.session.set_token(response.token.clone());
        self
          .vault
          .store(email, password, &response.token, &response.user);
        self.remember(Some(normalize_email(email)));
        info!(email = %normalize_email(email), "signed in online");
        Ok(LoginOutcome {
          email: Some(normalize_email(email)),
          mode: LoginMode::Online,
          profile: response.user,
        })
      }
      Err(TransportError::Connection(reason)) => {
        warn!(%reason, "login server unreachable, trying offline credentials");
        self.login_offline(email, password)
      }
      Err(err) => Err(err.into()),
    }
  }

  fn login_offline(&self, email: &str, password: &str) -> Result<LoginOutcome> {
    let session = self.vault.verify(email, password)?;
    self.session.set_token(session.token);
    self.remember(Some(session.email.clone()));
    info!(email = %session.email, "signed in offline");
    Ok(LoginOutcome {
      email: Some(session.email),
      mode: LoginMode::Offline,
      profile: session.profile,
    })
  }

  /// End the session. Cached credentials are kept for offline sign-in
  /// unless `forget` is set.
  pub fn logout(&self, forget: bool) -> Result<()> {
    let email = self.active_email();
    self.session.clear();
    self.vault.clear(email.as_deref(), !forget)?;
    if forget {
      self.remember(None);
    }
    info!(forget, "signed out");
    Ok(())
  }

  /// Restore a session from `MEDISYNC_TOKEN`, or by unlocking the vault for
  /// the last active account with `MEDISYNC_PASSWORD`.
  pub fn resume(&self) -> Result<Option<LoginOutcome>> {
    self.resume_with(Config::get_session_token(), Config::get_password().ok())
  }

  pub(crate) fn resume_with(
    &self,
    token: Option<String>,
    password: Option<String>,
  ) -> Result<Option<LoginOutcome>> {
    if let Some(token) = token {
      self.session.set_token(token);
      return Ok(Some(LoginOutcome {
        email: self.active_email(),
        mode: LoginMode::Token,
        profile: Value::Null,
      }));
    }

    match (self.active_email(), password) {
      (Some(email), Some(password)) => self.login_offline(&email, &password).map(Some),
      _ => Ok(None),
    }
  }

  fn remember(&self, email: Option<String>) {
    if let Err(err) = self.flags.update(|f| f.active_email = email) {
      warn!(error = %err, "failed to record active account");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::mock::MockTransport;
  use crate::error::CredentialError;
  use crate::store::Store;

  struct Harness {
    auth: AuthService,
    transport: Arc<MockTransport>,
    vault: CredentialVault,
  }

  fn harness(online: bool) -> Harness {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let flags = Arc::new(Flags::in_memory());
    let transport = Arc::new(MockTransport::new());
    let vault = CredentialVault::new(store, flags.clone());
    let auth = AuthService::new(
      transport.clone(),
      Session::new(),
      vault.clone(),
      flags,
      Connectivity::new(online),
      "/auth/login/",
    );
    Harness {
      auth,
      transport,
      vault,
    }
  }

  fn accept_login(transport: &MockTransport) {
    transport.respond(
      Method::Post,
      "/auth/login/",
      Ok(json!({"access": "tok-1", "user": {"id": 5, "name": "Dr. Lee"}})),
    );
  }

  fn credential_error(err: Error) -> CredentialError {
    match err {
      Error::Credential(err) => err,
      other => panic!("expected a credential error, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_online_login_enables_offline_login() {
    let h = harness(true);
    accept_login(&h.transport);

    let outcome = h.auth.login("Lee@Clinic.test", "pw").await.unwrap();
    assert_eq!(outcome.mode, LoginMode::Online);
    assert_eq!(h.auth.session().token().as_deref(), Some("tok-1"));
    assert_eq!(h.auth.active_email().as_deref(), Some("lee@clinic.test"));
    assert!(h.vault.load("lee@clinic.test").unwrap().is_some());

    h.auth.logout(false).unwrap();
    assert!(!h.auth.session().is_authenticated());
    h.auth.connectivity.set_online(false);

    let outcome = h.auth.login("lee@clinic.test", "pw").await.unwrap();
    assert_eq!(outcome.mode, LoginMode::Offline);
    assert_eq!(outcome.profile, json!({"id": 5, "name": "Dr. Lee"}));
    assert_eq!(h.auth.session().token().as_deref(), Some("tok-1"));

    let err = h.auth.login("lee@clinic.test", "nope").await.unwrap_err();
    assert_eq!(credential_error(err), CredentialError::InvalidPassword);
  }

  #[tokio::test]
  async fn test_offline_login_without_history_is_not_found() {
    let h = harness(false);
    let err = h.auth.login("new@clinic.test", "pw").await.unwrap_err();
    let err = credential_error(err);
    assert_eq!(err, CredentialError::NotFound);
    assert!(err.to_string().contains("online"));
  }

  #[tokio::test]
  async fn test_unreachable_server_falls_back_to_vault() {
    let h = harness(true);
    accept_login(&h.transport);
    h.auth.login("lee@clinic.test", "pw").await.unwrap();

    h.transport.respond(
      Method::Post,
      "/auth/login/",
      Err(TransportError::Connection("timed out".into())),
    );
    let outcome = h.auth.login("lee@clinic.test", "pw").await.unwrap();
    assert_eq!(outcome.mode, LoginMode::Offline);
  }

  #[tokio::test]
  async fn test_rejected_online_login_is_not_retried_offline() {
    let h = harness(true);
    h.transport.respond(
      Method::Post,
      "/auth/login/",
      Err(TransportError::status(401, "Invalid credentials")),
    );
    let err = h.auth.login("lee@clinic.test", "pw").await.unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::Status { status: 401, .. })));
    assert!(!h.auth.session().is_authenticated());
  }

  #[tokio::test]
  async fn test_logout_forget_removes_credentials() {
    let h = harness(true);
    accept_login(&h.transport);
    h.auth.login("lee@clinic.test", "pw").await.unwrap();

    h.auth.logout(true).unwrap();
    assert!(h.vault.load("lee@clinic.test").unwrap().is_none());
    assert!(h.auth.active_email().is_none());
  }

  #[tokio::test]
  async fn test_resume_from_token_or_vault() {
    let h = harness(true);
    assert!(h.auth.resume_with(None, None).unwrap().is_none());

    let outcome = h
      .auth
      .resume_with(Some("env-token".into()), None)
      .unwrap()
      .unwrap();
    assert_eq!(outcome.mode, LoginMode::Token);
    assert_eq!(h.auth.session().token().as_deref(), Some("env-token"));

    accept_login(&h.transport);
    h.auth.login("lee@clinic.test", "pw").await.unwrap();
    h.auth.logout(false).unwrap();

    let outcome = h
      .auth
      .resume_with(None, Some("pw".into()))
      .unwrap()
      .unwrap();
    assert_eq!(outcome.mode, LoginMode::Offline);
    assert_eq!(h.auth.session().token().as_deref(), Some("tok-1"));
  }

  #[test]
  fn test_login_response_field_aliases() {
    for body in [
      json!({"token": "a"}),
      json!({"access_token": "a", "profile": {"id": 1}}),
      json!({"key": "a"}),
    ] {
      let response: LoginResponse = serde_json::from_value(body).unwrap();
      assert_eq!(response.token, "a");
    }
  }
}

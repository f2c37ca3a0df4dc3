//! Credential vault for offline authentication.

pub mod cipher;
mod credentials;

pub use credentials::{CredentialVault, OfflineCredential, OfflineSession, DEFAULT_CREDENTIAL_TTL_DAYS};

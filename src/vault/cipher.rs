//! Key derivation, password hashing and ChaCha20-Poly1305 sealing.

use chacha20poly1305::{
  aead::{Aead, KeyInit},
  ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// 256-bit key (32 bytes)
pub const KEY_SIZE: usize = 32;
/// 96-bit nonce (12 bytes)
pub const NONCE_SIZE: usize = 12;

const PASSWORD_SALT_SIZE: usize = 16;
const KEY_INFO: &[u8] = b"medisync offline credential key v1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
  #[error("Encryption failed")]
  EncryptionFailed,

  #[error("Decryption failed - data may be corrupted or the key does not match")]
  DecryptionFailed,

  #[error("Key derivation failed")]
  KeyDerivation,
}

/// Normalise an email so that key derivation and lookups agree.
pub fn normalize_email(email: &str) -> String {
  email.trim().to_lowercase()
}

/// Derive the per-user key from the email and the installation salt.
///
/// The password never takes part, so the key can be rebuilt before the
/// password has been checked.
pub fn derive_key(email: &str, device_salt: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>, CipherError> {
  let normalized = normalize_email(email);
  let hk = Hkdf::<Sha256>::new(Some(device_salt), normalized.as_bytes());
  let mut key = Zeroizing::new([0u8; KEY_SIZE]);
  hk.expand(KEY_INFO, key.as_mut())
    .map_err(|_| CipherError::KeyDerivation)?;
  Ok(key)
}

/// One-way salted hash of a password, stored as `salt$digest` in hex.
pub fn hash_password(password: &str) -> String {
  let mut salt = [0u8; PASSWORD_SALT_SIZE];
  rand::thread_rng().fill_bytes(&mut salt);
  format!("{}${}", hex::encode(salt), digest_password(&salt, password))
}

/// Check `password` against a hash produced by `hash_password`.
pub fn verify_password(password: &str, stored: &str) -> bool {
  let Some((salt_hex, expected)) = stored.split_once('$') else {
    return false;
  };
  let Ok(salt) = hex::decode(salt_hex) else {
    return false;
  };
  let actual = digest_password(&salt, password);
  // Compare without short-circuiting on the first differing byte
  actual.len() == expected.len()
    && actual
      .bytes()
      .zip(expected.bytes())
      .fold(0u8, |acc, (a, b)| acc | (a ^ b))
      == 0
}

fn digest_password(salt: &[u8], password: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(salt);
  hasher.update(password.as_bytes());
  hex::encode(hasher.finalize())
}

/// Encrypt plaintext with ChaCha20-Poly1305.
///
/// Returns: nonce || ciphertext || tag
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
  let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::EncryptionFailed)?;

  let mut nonce_bytes = [0u8; NONCE_SIZE];
  rand::thread_rng().fill_bytes(&mut nonce_bytes);
  let nonce = Nonce::from_slice(&nonce_bytes);

  let ciphertext = cipher
    .encrypt(nonce, plaintext)
    .map_err(|_| CipherError::EncryptionFailed)?;

  let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
  result.extend_from_slice(&nonce_bytes);
  result.extend_from_slice(&ciphertext);
  Ok(result)
}

/// Decrypt data produced by `encrypt`.
pub fn decrypt(key: &[u8; KEY_SIZE], sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError> {
  if sealed.len() < NONCE_SIZE {
    return Err(CipherError::DecryptionFailed);
  }

  let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::DecryptionFailed)?;
  let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
  let plaintext = cipher
    .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
    .map_err(|_| CipherError::DecryptionFailed)?;

  Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_encrypt_decrypt_roundtrip() {
    let key = derive_key("nurse@clinic.test", b"salt").unwrap();
    let sealed = encrypt(&key, b"bearer-token").unwrap();
    assert_ne!(&sealed[NONCE_SIZE..], b"bearer-token");
    assert_eq!(decrypt(&key, &sealed).unwrap().as_slice(), b"bearer-token");
  }

  #[test]
  fn test_key_depends_on_email_and_salt() {
    let a = derive_key("a@clinic.test", b"salt").unwrap();
    let b = derive_key("b@clinic.test", b"salt").unwrap();
    let c = derive_key("a@clinic.test", b"other salt").unwrap();
    assert_ne!(*a, *b);
    assert_ne!(*a, *c);
    assert_eq!(*a, *derive_key("  A@Clinic.test ", b"salt").unwrap());
  }

  #[test]
  fn test_wrong_key_fails() {
    let key1 = derive_key("a@clinic.test", b"salt").unwrap();
    let key2 = derive_key("b@clinic.test", b"salt").unwrap();
    let sealed = encrypt(&key1, b"secret").unwrap();
    assert_eq!(decrypt(&key2, &sealed).unwrap_err(), CipherError::DecryptionFailed);
    assert!(decrypt(&key1, &sealed[..4]).is_err());
  }

  #[test]
  fn test_password_hash() {
    let stored = hash_password("hunter2");
    assert!(verify_password("hunter2", &stored));
    assert!(!verify_password("hunter3", &stored));
    assert!(!verify_password("hunter2", "garbage"));
    assert_ne!(stored, hash_password("hunter2"));
  }
}

//! Response cache for offline reads.
//!
//! This module provides:
//! - Normalised endpoint keys (path + sorted query)
//! - A tagged representation of listing payloads
//! - Time-bounded cached snapshots with a best-effort sibling fallback

pub mod key;
mod manager;
pub mod shape;

pub use key::EndpointKey;
pub use manager::{CacheHit, CacheManager, CachedResponse, DEFAULT_TTL_HOURS};
pub use shape::ListShape;

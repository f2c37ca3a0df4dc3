//! Offline-first data synchronization engine for the clinic REST API.
//!
//! Reads are cached and served offline, writes made offline are queued,
//! applied optimistically and replayed once connectivity returns, and a
//! returning user can sign in without the network.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod entity;
pub mod error;
pub mod logging;
pub mod optimistic;
pub mod precache;
pub mod queue;
pub mod router;
pub mod store;
pub mod sync;
pub mod vault;

pub use context::AppContext;
pub use error::{Error, Result};

//! Network boundary: one transport trait, one reqwest implementation.

mod http;
#[cfg(test)]
pub mod mock;
mod session;
mod transport;

pub use http::HttpTransport;
pub use session::Session;
pub use transport::{Method, Transport};

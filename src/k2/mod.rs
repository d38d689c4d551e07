//! K2 Management API Layer
//!
//! Typed object model, HTTPS transport, the serialized retrying client and
//! the object locator built on its search endpoint.

pub mod client;
pub mod locator;
pub mod objects;
pub mod transport;

#[cfg(test)]
pub(crate) mod fake;

pub use client::{Endpoints, ResilientClient, MAX_K2_RETRY};
pub use locator::{Filter, SearchResult};
pub use transport::{HttpTransport, HttpTransportConfig};

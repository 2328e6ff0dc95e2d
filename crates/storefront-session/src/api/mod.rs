//! HTTP side of the session layer.
//!
//! This module provides the `ApiClient` middleware, which attaches bearer
//! tokens to outgoing calls and transparently refreshes and replays requests
//! rejected with the expired-token signature, and the `HttpTransport` seam it
//! sends through (`ReqwestTransport` in production).

pub mod client;
pub mod transport;

pub use client::ApiClient;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport};

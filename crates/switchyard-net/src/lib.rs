//! Switchyard Network Layer
//!
//! Concrete network collaborators for the core:
//! 1. `HttpClient`: hyper over rustls
//! 2. `HttpCredentialApi`: credential and template endpoints
//! 3. `DnsResolver`: hickory lookups for custom DNS hostnames

mod api;
mod client;
mod dns;

pub use api::HttpCredentialApi;
pub use client::{HttpClient, HttpClientConfig, HttpError, Response};
pub use dns::{DnsConfig, DnsError, DnsResolver};

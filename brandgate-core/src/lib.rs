//! Governance layer for AI operations in a marketing-campaign platform:
//! rate limiting, response caching, budget preflights and alerts, circuit
//! breaking around providers, and an append-only usage ledger.
//!
//! [`governance::Governance`] wires the pieces into the request pipeline;
//! [`endpoints::router`] exposes them over HTTP.

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod cost;
pub mod db;
pub mod endpoints;
pub mod error;
pub mod governance;
pub mod observability;
pub mod rate_limiting;
pub mod usage;

pub use config::Config;
pub use error::{Error, ErrorDetails};
pub use governance::{GenerationRequest, GenerationResult, Governance, ProviderResponse};

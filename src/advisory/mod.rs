//! Advisory service integration
//!
//! An external service (typically an LLM wrapper) returns a directional
//! opinion that joins fusion as one more vote.
//!
//! - [`client`] - HTTP client with bounded retry
//! - [`models`] - Request/response types

pub mod client;
pub mod models;

pub use client::{AdvisoryClient, AdvisoryConfig, AdvisoryError, RetryPolicy};
pub use models::{AdvisoryOpinion, OpinionRequest};
